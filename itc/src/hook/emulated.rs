//! # Emulated Idle Host
//!
//! An in-process stand-in for a kernel idle loop, used where tracepoints are
//! not available (unprivileged runs, CI, tests).
//!
//! Each emulated CPU is a thread running:
//!
//! ```text
//! loop {
//!     acknowledge wake epoch
//!     queued work?  run it (busy)
//!     otherwise     run the slot's idle handler (or wait on the doorbell)
//! }
//! ```
//!
//! [`HaltIdle`] is the host's native idle routine: it blocks on the CPU's
//! doorbell until rung or until the next tick. [`EmulatedIdleSource`] wraps
//! whatever is registered using [`super::intercept`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::intercept::{self, IdleHandler, IdleHandlerSlot, Interception};
use super::{IdleEventSource, SourceStats};
use crate::accounting::IdleAccountingService;
use crate::config::WAKE_TIMEOUT;
use crate::domain::{CpuId, ItcError};
use crate::topology::FixedTopology;

/// Longest a CPU stays in [`HaltIdle`] without being rung (the timer tick)
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-CPU wakeup line
#[derive(Default)]
struct Doorbell {
    rung: Mutex<bool>,
    bell: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        *lock(&self.rung) = true;
        self.bell.notify_all();
    }

    /// Wait until rung or `timeout`; consumes the ring
    fn wait(&self, timeout: Duration) {
        let guard = lock(&self.rung);
        let (mut rung, _) = self
            .bell
            .wait_timeout_while(guard, timeout, |rung| !*rung)
            .unwrap_or_else(PoisonError::into_inner);
        *rung = false;
    }
}

struct CpuLine {
    doorbell: Doorbell,
    work: Mutex<VecDeque<Duration>>,
}

struct HostShared {
    cpus: Vec<CpuLine>,
    slot: IdleHandlerSlot,
    tick: Duration,
    stop: AtomicBool,
    epoch: AtomicU64,
    acks: Mutex<Vec<u64>>,
    acked: Condvar,
}

impl HostShared {
    fn line(&self, cpu: CpuId) -> Option<&CpuLine> {
        self.cpus.get(cpu.index())
    }

    fn acknowledge(&self, cpu: CpuId) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let mut acks = lock(&self.acks);
        if let Some(seen) = acks.get_mut(cpu.index()) {
            if *seen < epoch {
                *seen = epoch;
                self.acked.notify_all();
            }
        }
    }

    fn run_cpu(&self, cpu: CpuId) {
        let Some(line) = self.line(cpu) else { return };
        debug!("Emulated {cpu} online");

        while !self.stop.load(Ordering::SeqCst) {
            self.acknowledge(cpu);

            let job = lock(&line.work).pop_front();
            if let Some(busy) = job {
                thread::sleep(busy);
                continue;
            }

            if !self.slot.run_idle(cpu) {
                // Nothing registered: wait without anyone accounting it
                line.doorbell.wait(self.tick);
            }
        }

        debug!("Emulated {cpu} offline");
    }
}

/// The host's native idle routine: halt until rung or the next tick
///
/// Holds the host weakly: the host's own slot registers one of these.
#[derive(Clone)]
pub struct HaltIdle {
    shared: Weak<HostShared>,
}

impl IdleHandler for HaltIdle {
    fn idle(&self, cpu: CpuId) {
        let Some(shared) = self.shared.upgrade() else { return };
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        if let Some(line) = shared.line(cpu) {
            line.doorbell.wait(shared.tick);
        }
    }
}

/// A set of emulated CPUs sharing one idle handler slot
pub struct EmulatedHost {
    shared: Arc<HostShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl EmulatedHost {
    /// Host with `cpus` CPUs and [`HaltIdle`] registered as its idle handler
    ///
    /// # Errors
    /// Returns an error if a CPU thread cannot be spawned
    pub fn start(cpus: u32) -> Result<Arc<Self>, ItcError> {
        Self::start_with(cpus, DEFAULT_TICK, true)
    }

    /// Host whose idle handler slot starts out empty
    ///
    /// Interception then needs a fallback routine such as [`Self::halt_idle`].
    ///
    /// # Errors
    /// Returns an error if a CPU thread cannot be spawned
    pub fn start_without_handler(cpus: u32) -> Result<Arc<Self>, ItcError> {
        Self::start_with(cpus, DEFAULT_TICK, false)
    }

    /// # Errors
    /// Returns an error if a CPU thread cannot be spawned
    pub fn start_with(cpus: u32, tick: Duration, register_halt: bool) -> Result<Arc<Self>, ItcError> {
        let shared = Arc::new(HostShared {
            cpus: (0..cpus)
                .map(|_| CpuLine { doorbell: Doorbell::default(), work: Mutex::new(VecDeque::new()) })
                .collect(),
            slot: IdleHandlerSlot::new(),
            tick,
            stop: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            acks: Mutex::new(vec![0; cpus as usize]),
            acked: Condvar::new(),
        });

        if register_halt {
            shared.slot.replace(Some(Arc::new(HaltIdle { shared: Arc::downgrade(&shared) })));
        }

        let host = Arc::new(Self { shared, threads: Mutex::new(Vec::new()) });

        for cpu in (0..cpus).map(CpuId) {
            let shared = host.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("emu-cpu-{}", cpu.0))
                .spawn(move || shared.run_cpu(cpu))?;
            lock(&host.threads).push(handle);
        }

        info!("✓ Emulated host started with {cpus} CPUs");
        Ok(host)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn cpu_count(&self) -> u32 {
        self.shared.cpus.len() as u32
    }

    /// Present CPUs of this host
    pub fn topology(&self) -> FixedTopology {
        FixedTopology::with_count(self.cpu_count())
    }

    pub fn slot(&self) -> &IdleHandlerSlot {
        &self.shared.slot
    }

    /// A handle to the native idle routine, for use as a fallback
    pub fn halt_idle(&self) -> Arc<dyn IdleHandler> {
        Arc::new(HaltIdle { shared: Arc::downgrade(&self.shared) })
    }

    /// Queue `busy` time on `cpu` and kick it out of idle
    pub fn submit(&self, cpu: CpuId, busy: Duration) {
        match self.shared.line(cpu) {
            Some(line) => {
                lock(&line.work).push_back(busy);
                line.doorbell.ring();
            }
            None => warn!("Work for {cpu} dropped: host has {} CPUs", self.cpu_count()),
        }
    }

    /// Ring every CPU and wait until each has gone round its loop
    ///
    /// # Errors
    /// [`ItcError::WakeTimeout`] if some CPUs did not come back in time
    pub fn wake_all(&self, timeout: Duration) -> Result<(), ItcError> {
        let target = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for line in &self.shared.cpus {
            line.doorbell.ring();
        }

        let deadline = Instant::now() + timeout;
        let mut acks = lock(&self.shared.acks);
        loop {
            let acknowledged = acks.iter().filter(|&&seen| seen >= target).count();
            if acknowledged == acks.len() {
                debug!("Wake barrier passed on {acknowledged} emulated CPUs");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline || self.shared.stop.load(Ordering::SeqCst) {
                return Err(ItcError::WakeTimeout { acknowledged, expected: acks.len() });
            }

            acks = self
                .shared
                .acked
                .wait_timeout(acks, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop and join every CPU thread
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for line in &self.shared.cpus {
            line.doorbell.ring();
        }

        let threads = std::mem::take(&mut *lock(&self.threads));
        if threads.is_empty() {
            return;
        }
        for handle in threads {
            if handle.join().is_err() {
                warn!("Emulated CPU thread panicked");
            }
        }
        debug!("Emulated host stopped");
    }
}

impl Drop for EmulatedHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`IdleEventSource`] that intercepts an [`EmulatedHost`]'s idle handler
pub struct EmulatedIdleSource {
    host: Arc<EmulatedHost>,
    fallback: Option<Arc<dyn IdleHandler>>,
    wake_timeout: Duration,
    interception: Option<Interception>,
}

impl EmulatedIdleSource {
    pub fn new(host: Arc<EmulatedHost>) -> Self {
        Self { host, fallback: None, wake_timeout: WAKE_TIMEOUT, interception: None }
    }

    /// Idle routine to wrap when the host has none registered
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn IdleHandler>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn with_wake_timeout(mut self, timeout: Duration) -> Self {
        self.wake_timeout = timeout;
        self
    }

    pub fn host(&self) -> &Arc<EmulatedHost> {
        &self.host
    }

    pub fn is_installed(&self) -> bool {
        self.interception.is_some()
    }
}

impl IdleEventSource for EmulatedIdleSource {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn install(&mut self, sink: Arc<IdleAccountingService>) -> Result<(), ItcError> {
        if self.interception.is_some() {
            return Ok(());
        }
        self.interception = intercept::intercept(self.host.slot(), sink, self.fallback.as_ref())?;
        Ok(())
    }

    fn uninstall(&mut self) -> Result<SourceStats, ItcError> {
        let Some(interception) = self.interception.take() else {
            return Ok(SourceStats::default());
        };

        let periods = intercept::restore(self.host.slot(), interception);
        Ok(SourceStats { delivered: periods * 2, ..SourceStats::default() })
    }

    fn wake_all_cpus(&self) -> Result<(), ItcError> {
        self.host.wake_all(self.wake_timeout)
    }
}
