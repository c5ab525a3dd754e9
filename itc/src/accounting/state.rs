//! Per-CPU idle record and its duration arithmetic
//!
//! A [`CpuIdleState`] is plain data: it is only ever touched while the
//! accounting lock is held (see [`super::IdleAccountingService`]).

use std::time::Duration;

/// Idle bookkeeping for one CPU slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuIdleState {
    /// Sum of all completed idle intervals, plus any partial interval already
    /// folded in by a snapshot
    pub cumulative_sleep: Duration,

    /// Start of the running interval (only meaningful while `sleeping`)
    ///
    /// Advanced to the snapshot instant whenever a snapshot folds the partial
    /// interval in, so the same time is never counted twice.
    pub sleep_started_at: Duration,

    /// Between an idle-enter and its idle-exit
    pub sleeping: bool,
}

impl CpuIdleState {
    /// Idle-enter: start a new interval at `now`
    ///
    /// A second enter without an exit restarts the interval.
    pub fn enter(&mut self, now: Duration) {
        self.sleep_started_at = now;
        self.sleeping = true;
    }

    /// Idle-exit: close the running interval at `now`
    ///
    /// Returns the length of the interval that was added. An exit with no
    /// running interval adds nothing.
    pub fn exit(&mut self, now: Duration) -> Duration {
        if !self.sleeping {
            return Duration::ZERO;
        }

        let delta = now.saturating_sub(self.sleep_started_at);
        self.cumulative_sleep += delta;
        self.sleeping = false;
        delta
    }

    /// Fold the partial interval in without ending it, returning the total
    pub fn fold(&mut self, now: Duration) -> Duration {
        if self.sleeping {
            self.cumulative_sleep += now.saturating_sub(self.sleep_started_at);
            // Never move the baseline backwards: a late `now` contributes zero
            self.sleep_started_at = self.sleep_started_at.max(now);
        }
        self.cumulative_sleep
    }

    /// Total as seen at `now`, without modifying the record
    #[must_use]
    pub fn observed(&self, now: Duration) -> Duration {
        if self.sleeping {
            self.cumulative_sleep + now.saturating_sub(self.sleep_started_at)
        } else {
            self.cumulative_sleep
        }
    }
}
