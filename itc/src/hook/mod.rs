//! # Idle Event Sources
//!
//! An [`IdleEventSource`] observes every CPU's transitions into and out of
//! idle and forwards them to the [`IdleAccountingService`]:
//!
//! ```text
//!   CPU n idle loop ──enter──▶ ┌──────────────────┐
//!                   ◀──exit─── │ IdleEventSource  │──▶ IdleAccountingService
//!                              └──────────────────┘      (one lock)
//! ```
//!
//! Two adapters exist:
//!
//! - [`EbpfIdleSource`] - kernel tracepoints (`power/cpu_idle`, or a
//!   configured fallback) delivered through a ring buffer
//! - [`EmulatedIdleSource`] - an in-process host whose active idle handler is
//!   swapped for an [`InterceptingIdle`] wrapper and restored afterwards
//!
//! After [`IdleEventSource::uninstall`] returns, no new event reaches the
//! sink; [`IdleEventSource::wake_all_cpus`] then forces every CPU through
//! its idle loop once so nothing is left executing hook code.

pub mod ebpf;
pub mod emulated;
pub mod intercept;
pub mod wake;

use std::sync::Arc;

pub use ebpf::{EbpfIdleSource, SourceStats};
pub use emulated::{EmulatedHost, EmulatedIdleSource, HaltIdle};
pub use intercept::{IdleHandler, IdleHandlerSlot, InterceptingIdle};
pub use wake::broadcast_wake;

use crate::accounting::IdleAccountingService;
use crate::domain::ItcError;

/// Platform mechanism that reports idle enter/exit per CPU
pub trait IdleEventSource: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start delivering events to `sink`
    ///
    /// # Errors
    /// [`ItcError::NoIdleMechanism`] if the host offers nothing to hook,
    /// or a load/attach error from the adapter
    fn install(&mut self, sink: Arc<IdleAccountingService>) -> Result<(), ItcError>;

    /// Stop delivering events and put the host back as it was
    ///
    /// Calling it while not installed returns the empty stats.
    ///
    /// # Errors
    /// Returns an error if the host refused the restore; the source is
    /// considered uninstalled regardless
    fn uninstall(&mut self) -> Result<SourceStats, ItcError>;

    /// Force every CPU out of idle at least once and wait until they have
    ///
    /// # Errors
    /// [`ItcError::WakeTimeout`] if some CPUs did not acknowledge in time
    fn wake_all_cpus(&self) -> Result<(), ItcError>;

    /// Deliver events still in flight
    ///
    /// # Errors
    /// Returns an error if the adapter's delivery path is gone
    fn flush(&self) -> Result<(), ItcError> {
        Ok(())
    }
}
