//! One-level idle handler interception
//!
//! A host idles by calling whatever [`IdleHandler`] is registered in its
//! [`IdleHandlerSlot`]. Interception swaps that registration for an
//! [`InterceptingIdle`] that reports enter/exit around a call to the
//! handler it displaced, and later puts the displaced handler back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::accounting::IdleAccountingService;
use crate::domain::{CpuId, ItcError};

/// Routine a CPU runs when it has nothing to do
///
/// Returns when the CPU is woken (interrupt, tick, doorbell).
pub trait IdleHandler: Send + Sync {
    fn idle(&self, cpu: CpuId);

    /// True for handlers that report to an accounting service
    fn is_interceptor(&self) -> bool {
        false
    }
}

type Handler = Arc<dyn IdleHandler>;

fn same_handler(a: &Handler, b: &Handler) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// The host's active idle handler registration
///
/// Empty means the host has no replaceable idle routine of its own.
#[derive(Default)]
pub struct IdleHandlerSlot {
    active: RwLock<Option<Handler>>,
}

impl IdleHandlerSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(handler: Handler) -> Self {
        Self { active: RwLock::new(Some(handler)) }
    }

    /// Handler CPUs will run on their next trip through the idle loop
    #[must_use]
    pub fn current(&self) -> Option<Handler> {
        self.read().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_none()
    }

    /// Unconditionally register `handler`, returning what was there
    pub fn replace(&self, handler: Option<Handler>) -> Option<Handler> {
        std::mem::replace(&mut *self.write(), handler)
    }

    /// Run one idle period on `cpu`; false if no handler is registered
    pub fn run_idle(&self, cpu: CpuId) -> bool {
        // Clone out so the lock is not held while idling
        match self.current() {
            Some(handler) => {
                handler.idle(cpu);
                true
            }
            None => false,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Handler>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Handler>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for IdleHandlerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleHandlerSlot").field("registered", &!self.is_empty()).finish()
    }
}

/// Wrapper that accounts one idle period around the displaced handler
pub struct InterceptingIdle {
    previous: Handler,
    sink: Arc<IdleAccountingService>,
    periods: AtomicU64,
}

impl InterceptingIdle {
    pub fn new(previous: Handler, sink: Arc<IdleAccountingService>) -> Self {
        Self { previous, sink, periods: AtomicU64::new(0) }
    }

    /// Completed idle periods seen by this wrapper
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }
}

impl IdleHandler for InterceptingIdle {
    fn idle(&self, cpu: CpuId) {
        self.sink.on_idle_enter(cpu);
        self.previous.idle(cpu);
        self.sink.on_idle_exit(cpu);
        self.periods.fetch_add(1, Ordering::Relaxed);
    }

    fn is_interceptor(&self) -> bool {
        true
    }
}

/// An installed wrapper and the registration it displaced
pub struct Interception {
    wrapper: Arc<InterceptingIdle>,
    displaced: Option<Handler>,
}

impl Interception {
    pub fn wrapper(&self) -> &Arc<InterceptingIdle> {
        &self.wrapper
    }

    /// Whether the slot was empty before (the fallback routine was wrapped)
    pub fn used_fallback(&self) -> bool {
        self.displaced.is_none()
    }
}

/// Swap the slot's handler for an accounting wrapper
///
/// The wrapper calls the registered handler, or `fallback` when the slot is
/// empty. Returns `Ok(None)` without touching the slot if the active handler
/// already intercepts.
///
/// # Errors
/// [`ItcError::NoIdleMechanism`] if the slot is empty and there is no fallback
pub fn intercept(
    slot: &IdleHandlerSlot,
    sink: Arc<IdleAccountingService>,
    fallback: Option<&Handler>,
) -> Result<Option<Interception>, ItcError> {
    let mut active = slot.write();

    if active.as_ref().is_some_and(|h| h.is_interceptor()) {
        warn!("Idle handler is already intercepted; leaving it in place");
        return Ok(None);
    }

    let displaced = active.clone();
    let previous = match (&displaced, fallback) {
        (Some(handler), _) => handler.clone(),
        (None, Some(fallback)) => {
            debug!("No idle handler registered, wrapping the fallback routine");
            fallback.clone()
        }
        (None, None) => {
            return Err(ItcError::NoIdleMechanism(
                "no idle handler registered and no fallback idle routine configured".to_string(),
            ))
        }
    };

    let wrapper = Arc::new(InterceptingIdle::new(previous, sink));
    *active = Some(wrapper.clone() as Handler);
    info!("✓ Idle handler intercepted");

    Ok(Some(Interception { wrapper, displaced }))
}

/// Put back the handler `interception` displaced
///
/// Only done if the slot still holds our wrapper; someone else's later
/// registration is left alone. Returns the wrapper's completed idle periods.
pub fn restore(slot: &IdleHandlerSlot, interception: Interception) -> u64 {
    let mut active = slot.write();
    let ours = interception.wrapper.clone() as Handler;

    if active.as_ref().is_some_and(|h| same_handler(h, &ours)) {
        *active = interception.displaced;
        info!("✓ Idle handler restored");
    } else {
        warn!("Idle handler was replaced while intercepted; not restoring");
    }

    interception.wrapper.periods()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::accounting::ManualClock;
    use crate::config::ServiceConfig;
    use crate::topology::FixedTopology;

    struct Sleepy {
        clock: Arc<ManualClock>,
        calls: AtomicU64,
    }

    impl IdleHandler for Sleepy {
        fn idle(&self, _cpu: CpuId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.clock.advance(Duration::from_millis(10));
        }
    }

    fn fixture() -> (Arc<IdleAccountingService>, Arc<Sleepy>) {
        let clock = Arc::new(ManualClock::new());
        let service = Arc::new(IdleAccountingService::new(
            &ServiceConfig { max_cpus: 2 },
            clock.clone(),
            Arc::new(FixedTopology::with_count(2)),
        ));
        let sleepy = Arc::new(Sleepy { clock, calls: AtomicU64::new(0) });
        (service, sleepy)
    }

    #[test]
    fn test_wrapper_accounts_and_delegates() {
        let (service, sleepy) = fixture();
        let slot = IdleHandlerSlot::with_handler(sleepy.clone());

        let interception = intercept(&slot, service.clone(), None).unwrap().unwrap();
        assert!(!interception.used_fallback());

        assert!(slot.run_idle(CpuId(1)));
        assert!(slot.run_idle(CpuId(1)));

        assert_eq!(sleepy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.snapshot().unwrap().idle_of(CpuId(1)), Some(Duration::from_millis(20)));

        assert_eq!(restore(&slot, interception), 2);
        let current = slot.current().unwrap();
        assert!(same_handler(&current, &(sleepy as Handler)));
    }

    #[test]
    fn test_double_intercept_is_noop() {
        let (service, sleepy) = fixture();
        let slot = IdleHandlerSlot::with_handler(sleepy);

        let first = intercept(&slot, service.clone(), None).unwrap();
        assert!(first.is_some());
        assert!(intercept(&slot, service, None).unwrap().is_none());
        assert!(slot.current().unwrap().is_interceptor());
    }

    #[test]
    fn test_empty_slot_uses_fallback_and_restores_empty() {
        let (service, sleepy) = fixture();
        let slot = IdleHandlerSlot::new();
        let fallback: Handler = sleepy.clone();

        let interception = intercept(&slot, service, Some(&fallback)).unwrap().unwrap();
        assert!(interception.used_fallback());
        assert!(slot.run_idle(CpuId(0)));
        assert_eq!(sleepy.calls.load(Ordering::SeqCst), 1);

        restore(&slot, interception);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_empty_slot_without_fallback_fails() {
        let (service, _) = fixture();
        let slot = IdleHandlerSlot::new();
        let err = intercept(&slot, service, None).err().unwrap();
        assert!(matches!(err, ItcError::NoIdleMechanism(_)));
        assert!(slot.is_empty());
    }

    #[test]
    fn test_restore_leaves_foreign_handler() {
        let (service, sleepy) = fixture();
        let slot = IdleHandlerSlot::with_handler(sleepy.clone());
        let interception = intercept(&slot, service, None).unwrap().unwrap();

        let foreign: Handler = Arc::new(Sleepy { clock: sleepy.clock.clone(), calls: AtomicU64::new(0) });
        slot.replace(Some(foreign.clone()));
        restore(&slot, interception);

        assert!(same_handler(&slot.current().unwrap(), &foreign));
    }
}
