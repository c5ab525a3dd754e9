//! # Read Protocol
//!
//! The payload of one device read is a packed array of [`DurationRecord`]s,
//! one per present CPU in ascending CPU order:
//!
//! ```text
//! offset  0        8        16       24       32
//!         ┌────────┬────────┬────────┬────────┬ ...
//!         │ secs   │ micros │ secs   │ micros │
//!         │ CPU 0           │ CPU 1           │
//!         └────────┴────────┴────────┴────────┴ ...
//! ```
//!
//! Both fields are native-endian `i64`, which is the layout of
//! `struct timeval` on 64-bit Linux, so a reader can `read(2)` straight into
//! a `timeval` array. Values are cumulative idle time, not deltas.

use std::io::Write;
use std::time::Duration;

use serde::Serialize;

use crate::domain::ItcError;

/// Size of one record on the wire
pub const RECORD_SIZE: usize = std::mem::size_of::<DurationRecord>();

const MICROS_PER_SEC: i64 = 1_000_000;

/// Fixed-width idle total: whole seconds plus microseconds (`0..1_000_000`)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DurationRecord {
    pub secs: i64,
    pub micros: i64,
}

impl DurationRecord {
    /// Convert, truncating below microsecond resolution
    #[must_use]
    pub fn from_duration(d: Duration) -> Self {
        Self {
            secs: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            micros: i64::from(d.subsec_micros()),
        }
    }

    /// Back to a `Duration`; negative or out-of-range fields clamp to zero
    #[must_use]
    pub fn to_duration(self) -> Duration {
        let secs = u64::try_from(self.secs).unwrap_or(0);
        let micros = u64::try_from(self.micros.clamp(0, MICROS_PER_SEC - 1)).unwrap_or(0);
        Duration::from_secs(secs) + Duration::from_micros(micros)
    }

    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.to_duration().as_secs_f64()
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..8].copy_from_slice(&self.secs.to_ne_bytes());
        out[8..].copy_from_slice(&self.micros.to_ne_bytes());
        out
    }

    /// Decode one record from exactly [`RECORD_SIZE`] bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut secs = [0u8; 8];
        let mut micros = [0u8; 8];
        secs.copy_from_slice(&bytes[..8]);
        micros.copy_from_slice(&bytes[8..]);
        Self { secs: i64::from_ne_bytes(secs), micros: i64::from_ne_bytes(micros) }
    }
}

/// Bytes a read must be able to hold for `cpu_count` present CPUs
#[must_use]
pub fn required_len(cpu_count: usize) -> usize {
    cpu_count * RECORD_SIZE
}

/// Reject buffers that cannot hold every present CPU
///
/// # Errors
/// Returns [`ItcError::InvalidArgument`] if `capacity` is too small
pub fn check_capacity(capacity: usize, cpu_count: usize) -> Result<usize, ItcError> {
    let required = required_len(cpu_count);
    if capacity < required {
        return Err(ItcError::InvalidArgument(format!(
            "read buffer holds {capacity} bytes, {required} required ({cpu_count} CPUs x {RECORD_SIZE})"
        )));
    }
    Ok(required)
}

/// Encode `durations` into the front of `buf`, returning the bytes written
///
/// # Errors
/// Returns [`ItcError::InvalidArgument`] if `buf` is too small
pub fn encode_into(durations: &[Duration], buf: &mut [u8]) -> Result<usize, ItcError> {
    let required = check_capacity(buf.len(), durations.len())?;

    for (chunk, d) in buf[..required].chunks_exact_mut(RECORD_SIZE).zip(durations) {
        chunk.copy_from_slice(&DurationRecord::from_duration(*d).to_bytes());
    }

    Ok(required)
}

/// Encode `durations` into a freshly allocated payload
#[must_use]
pub fn encode(durations: &[Duration]) -> Vec<u8> {
    durations.iter().flat_map(|d| DurationRecord::from_duration(*d).to_bytes()).collect()
}

/// Write the payload for `durations` to `out`
///
/// # Errors
/// Returns [`ItcError::CopyFault`] if the writer fails
pub fn write_to<W: Write>(durations: &[Duration], out: &mut W) -> Result<usize, ItcError> {
    let payload = encode(durations);
    out.write_all(&payload).map_err(ItcError::CopyFault)?;
    Ok(payload.len())
}

/// Decode a whole payload
///
/// # Errors
/// Returns [`ItcError::InvalidArgument`] if the length is not a multiple of
/// [`RECORD_SIZE`]
pub fn decode(payload: &[u8]) -> Result<Vec<DurationRecord>, ItcError> {
    if payload.len() % RECORD_SIZE != 0 {
        return Err(ItcError::InvalidArgument(format!(
            "payload of {} bytes is not a whole number of {RECORD_SIZE}-byte records",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes.copy_from_slice(chunk);
            DurationRecord::from_bytes(&bytes)
        })
        .collect())
}
