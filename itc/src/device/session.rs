//! # Device Session
//!
//! At most one reader at a time. Opening installs the idle event source,
//! releasing removes it:
//!
//! ```text
//!            open(): CAS in_use, install, wake
//!   Closed ────────────────────────────────────▶ Open
//!     ▲                                            │
//!     └────────────────────────────────────────────┘
//!      release(): uninstall, wake barrier, settle, clear in_use
//! ```
//!
//! `open()` while Open fails with [`ItcError::AlreadyInUse`] and changes
//! nothing. The accounting totals survive release: a later session reads
//! them cumulative since the service was created.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use super::protocol::{self, DurationRecord};
use crate::accounting::{IdleAccountingService, Snapshot};
use crate::domain::{CpuId, ItcError};
use crate::hook::{IdleEventSource, SourceStats};

/// Owner of the exclusivity flag and the idle event source
pub struct DeviceSession<S: IdleEventSource> {
    service: Arc<IdleAccountingService>,
    source: Mutex<S>,
    in_use: AtomicBool,
    last_stats: Mutex<Option<SourceStats>>,
}

impl<S: IdleEventSource> DeviceSession<S> {
    pub fn new(service: Arc<IdleAccountingService>, source: S) -> Self {
        Self {
            service,
            source: Mutex::new(source),
            in_use: AtomicBool::new(false),
            last_stats: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &Arc<IdleAccountingService> {
        &self.service
    }

    /// Name of the idle source behind this device
    pub fn source_name(&self) -> &'static str {
        lock(&self.source).name()
    }

    pub fn is_open(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Counters reported by the source when the last session was released
    pub fn last_stats(&self) -> Option<SourceStats> {
        *lock(&self.last_stats)
    }

    /// Open the device for reading
    ///
    /// # Errors
    /// - [`ItcError::AlreadyInUse`] if another reader holds the device
    /// - whatever the source's install fails with; the device stays closed
    pub fn open(&self) -> Result<Reader<'_, S>, ItcError> {
        if self.in_use.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("Open refused: device already in use");
            return Err(ItcError::AlreadyInUse);
        }

        let mut source = lock(&self.source);
        if let Err(e) = source.install(self.service.clone()) {
            self.in_use.store(false, Ordering::Release);
            return Err(e);
        }

        // CPUs idling since before the install only report once they wake
        if let Err(e) = source.wake_all_cpus() {
            warn!("Wake after install incomplete: {e}");
        }

        info!("✓ Device opened ({} idle source)", source.name());
        Ok(Reader { session: self, released: false })
    }

    fn read_snapshot(&self) -> Result<Snapshot, ItcError> {
        let present = self.service.present_cpus()?;
        self.snapshot_of(&present)
    }

    fn snapshot_of(&self, present: &[CpuId]) -> Result<Snapshot, ItcError> {
        lock(&self.source).flush()?;
        Ok(self.service.snapshot_of(present))
    }

    fn release(&self) -> SourceStats {
        if !self.is_open() {
            return SourceStats::default();
        }

        let mut source = lock(&self.source);
        let stats = source.uninstall().unwrap_or_else(|e| {
            warn!("Idle source uninstall reported: {e}");
            SourceStats::default()
        });

        // No CPU may still be inside hook code once release returns
        if let Err(e) = source.wake_all_cpus() {
            warn!("Wake barrier on release incomplete: {e}");
        }
        drop(source);

        self.service.settle();
        *lock(&self.last_stats) = Some(stats);
        self.in_use.store(false, Ordering::Release);

        info!("✓ Device released");
        stats
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle of the one open reader; releases the device when dropped
pub struct Reader<'a, S: IdleEventSource> {
    session: &'a DeviceSession<S>,
    released: bool,
}

impl<S: IdleEventSource> Reader<'_, S> {
    /// Bytes a read currently needs (present CPUs x record size)
    ///
    /// # Errors
    /// Returns an error if the topology cannot be queried
    pub fn required_len(&self) -> Result<usize, ItcError> {
        Ok(protocol::required_len(self.session.service.present_cpus()?.len()))
    }

    /// Fill `buf` with one record per present CPU, ascending
    ///
    /// Returns the number of bytes written; bytes past it are untouched.
    ///
    /// # Errors
    /// [`ItcError::InvalidArgument`] if `buf` cannot hold every present CPU
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ItcError> {
        let present = self.session.service.present_cpus()?;
        protocol::check_capacity(buf.len(), present.len())?;

        let snapshot = self.session.snapshot_of(&present)?;
        protocol::encode_into(&snapshot.durations(), buf)
    }

    /// Read into a caller-side destination of `capacity` bytes
    ///
    /// # Errors
    /// - [`ItcError::InvalidArgument`] if `capacity` is too small
    /// - [`ItcError::CopyFault`] if `out` fails; the snapshot was still taken
    pub fn read_to<W: Write>(&self, capacity: usize, out: &mut W) -> Result<usize, ItcError> {
        let present = self.session.service.present_cpus()?;
        protocol::check_capacity(capacity, present.len())?;

        let snapshot = self.session.snapshot_of(&present)?;
        protocol::write_to(&snapshot.durations(), out)
    }

    /// One read, decoded
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be taken
    pub fn read_records(&self) -> Result<Vec<DurationRecord>, ItcError> {
        let snapshot = self.session.read_snapshot()?;
        Ok(snapshot.durations().into_iter().map(DurationRecord::from_duration).collect())
    }

    /// One read with CPU ids and full resolution kept
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be taken
    pub fn snapshot(&self) -> Result<Snapshot, ItcError> {
        self.session.read_snapshot()
    }

    /// Device control requests are not supported
    ///
    /// # Errors
    /// Always [`ItcError::NotSupported`]
    pub fn ioctl(&self, cmd: u32, _arg: usize) -> Result<i32, ItcError> {
        Err(ItcError::NotSupported(format!("ioctl 0x{cmd:x}")))
    }

    /// Close the device, returning the source's counters
    pub fn release(mut self) -> SourceStats {
        self.released = true;
        self.session.release()
    }
}

impl<S: IdleEventSource> Drop for Reader<'_, S> {
    fn drop(&mut self) {
        if !self.released {
            self.session.release();
        }
    }
}
