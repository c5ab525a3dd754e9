//! Idle accounting service
//!
//! One [`IdleAccountingService`] per process, shared as `Arc` between the
//! event source (writers, one per CPU) and the device session (the single
//! reader). A single mutex guards the whole slot array: every enter/exit and
//! every snapshot are serialized against each other, so a snapshot never
//! observes half of an update.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use serde::Serialize;

use super::clock::Clock;
use super::state::CpuIdleState;
use crate::config::ServiceConfig;
use crate::domain::{CpuId, ItcError};
use crate::topology::CpuTopology;

/// Cumulative idle time of one CPU at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuIdle {
    pub cpu: u32,
    #[serde(rename = "idle_ns", serialize_with = "serialize_nanos")]
    pub idle: Duration,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_nanos<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    #[allow(clippy::cast_possible_truncation)]
    s.serialize_u64(d.as_nanos() as u64)
}

/// Point-in-time totals for every present CPU, ascending by CPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Clock reading the partial intervals were folded at
    #[serde(rename = "taken_at_ns", serialize_with = "serialize_nanos")]
    pub taken_at: Duration,
    pub cpus: Vec<CpuIdle>,
}

impl Snapshot {
    /// Idle total for `cpu`, if it was present
    #[must_use]
    pub fn idle_of(&self, cpu: CpuId) -> Option<Duration> {
        self.cpus.iter().find(|c| c.cpu == cpu.0).map(|c| c.idle)
    }

    #[must_use]
    pub fn durations(&self) -> Vec<Duration> {
        self.cpus.iter().map(|c| c.idle).collect()
    }
}

/// Per-CPU idle accounting guarded by one lock
pub struct IdleAccountingService {
    slots: Mutex<Vec<CpuIdleState>>,
    clock: Arc<dyn Clock>,
    topology: Arc<dyn CpuTopology>,
}

impl IdleAccountingService {
    /// Create the slot array, one zeroed record per possible CPU slot
    pub fn new(
        config: &ServiceConfig,
        clock: Arc<dyn Clock>,
        topology: Arc<dyn CpuTopology>,
    ) -> Self {
        debug!("Idle accounting: {} CPU slots", config.max_cpus);
        Self {
            slots: Mutex::new(vec![CpuIdleState::default(); config.max_cpus]),
            clock,
            topology,
        }
    }

    /// Number of CPU slots (the configured maximum CPU count)
    pub fn slot_count(&self) -> usize {
        self.lock().len()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Present CPUs that have a slot, ascending
    ///
    /// CPUs beyond the slot bound are dropped: they cannot have been accounted.
    ///
    /// # Errors
    /// Returns an error if the topology cannot be queried
    pub fn present_cpus(&self) -> Result<Vec<CpuId>, ItcError> {
        let mut cpus = self.topology.present_cpus()?;
        let slots = self.slot_count();
        cpus.sort_unstable();
        cpus.dedup();
        cpus.retain(|cpu| {
            let fits = cpu.index() < slots;
            if !fits {
                debug!("Ignoring present {cpu}: beyond the {slots} configured slots");
            }
            fits
        });
        Ok(cpus)
    }

    // ------------------------------------------------------------------------
    // Writers (idle path)
    // ------------------------------------------------------------------------

    /// Idle-enter on `cpu`, timestamped now
    pub fn on_idle_enter(&self, cpu: CpuId) {
        let now = self.clock.now();
        self.on_idle_enter_at(cpu, now);
    }

    /// Idle-exit on `cpu`, timestamped now
    pub fn on_idle_exit(&self, cpu: CpuId) {
        let now = self.clock.now();
        self.on_idle_exit_at(cpu, now);
    }

    /// Idle-enter on `cpu` at an event-supplied timestamp
    pub fn on_idle_enter_at(&self, cpu: CpuId, at: Duration) {
        let mut slots = self.lock();
        match slots.get_mut(cpu.index()) {
            Some(state) => state.enter(at),
            None => trace!("Idle enter on {cpu} ignored: no slot"),
        }
    }

    /// Idle-exit on `cpu` at an event-supplied timestamp
    pub fn on_idle_exit_at(&self, cpu: CpuId, at: Duration) {
        let mut slots = self.lock();
        match slots.get_mut(cpu.index()) {
            Some(state) => {
                state.exit(at);
            }
            None => trace!("Idle exit on {cpu} ignored: no slot"),
        }
    }

    // ------------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------------

    /// Fold in-progress intervals and copy out the totals of `cpus`
    ///
    /// `cpus` must be ascending (as returned by [`Self::present_cpus`]); CPUs
    /// without a slot report zero. The clock is read while the lock is held so
    /// every CPU is folded at the same instant.
    pub fn snapshot_of(&self, cpus: &[CpuId]) -> Snapshot {
        let mut slots = self.lock();
        let now = self.clock.now();

        let cpus = cpus
            .iter()
            .map(|&cpu| CpuIdle {
                cpu: cpu.0,
                idle: slots.get_mut(cpu.index()).map_or(Duration::ZERO, |state| state.fold(now)),
            })
            .collect();

        Snapshot { taken_at: now, cpus }
    }

    /// Snapshot of every present CPU
    ///
    /// # Errors
    /// Returns an error if the topology cannot be queried
    pub fn snapshot(&self) -> Result<Snapshot, ItcError> {
        let cpus = self.present_cpus()?;
        Ok(self.snapshot_of(&cpus))
    }

    /// Close every interval that is still open
    ///
    /// Called once the hook is gone: a slot still marked sleeping would never
    /// see its exit, and would keep accruing time on later reads. Returns the
    /// number of slots that were settled.
    pub fn settle(&self) -> usize {
        let mut slots = self.lock();
        let now = self.clock.now();
        let mut settled = 0;

        for state in slots.iter_mut().filter(|s| s.sleeping) {
            state.exit(now);
            settled += 1;
        }

        if settled > 0 {
            debug!("Settled {settled} CPUs still marked idle");
        }
        settled
    }

    /// Copy of one slot's record
    pub fn cpu_state(&self, cpu: CpuId) -> Option<CpuIdleState> {
        self.lock().get(cpu.index()).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CpuIdleState>> {
        // A panic while holding the lock can only have interrupted one slot's
        // plain-data update; the array stays usable.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for IdleAccountingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleAccountingService").field("slots", &self.slot_count()).finish()
    }
}
