//! Per-CPU idle accounting
//!
//! - [`state`]: the per-CPU record and its interval arithmetic
//! - [`service`]: the lock-guarded slot array shared by writers and the reader
//! - [`clock`]: monotonic time sources

pub mod clock;
pub mod service;
pub mod state;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use service::{CpuIdle, IdleAccountingService, Snapshot};
pub use state::CpuIdleState;
