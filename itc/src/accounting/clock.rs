//! Monotonic time sources
//!
//! Timestamps are durations since an arbitrary, fixed origin. Only
//! differences between two readings of the same clock are meaningful.

#![allow(unsafe_code)] // clock_gettime() requires unsafe

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Source of monotonic timestamps for the accounting service
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// `CLOCK_MONOTONIC`, the base `bpf_ktime_get_ns()` uses on the kernel side
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        // SAFETY: timespec is plain old data; CLOCK_MONOTONIC cannot fail with a valid pointer
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };

        #[allow(clippy::cast_sign_loss)]
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }
}

/// Clock that only moves when told to
///
/// Used by tests and by deterministic replays of recorded event streams.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn starting_at(start: Duration) -> Self {
        let clock = Self::new();
        clock.set(start);
        clock
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&self, at: Duration) {
        self.nanos.store(at.as_nanos() as u64, Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
