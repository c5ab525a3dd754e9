//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines data structures and constants shared between the kernel-side idle
//! hooks and the userspace accounting service. All types use `#[repr(C)]` for
//! consistent memory layout across the kernel/userspace boundary.
//!
//! ## Hook Points
//!
//! 1. **Primary** - `power/cpu_idle`: fires on every idle-state entry and exit
//! 2. **Fallback** - `sched/sched_switch`: switching to/from the idle task (pid 0)
//!
//! ## Key Types
//!
//! - [`IdleEvent`] - Event record passed via ring buffer
//! - [`CpuIdleArgs`] - Tracepoint arguments from `cpu_idle`
//! - [`SchedSwitchArgs`] - Tracepoint arguments from `sched_switch`

#![no_std]

// ============================================================================
// Event Kind Constants
// ============================================================================

/// CPU is about to stop doing useful work
///
/// Emitted by: `cpu_idle_hook` (state != `PWR_EVENT_EXIT`),
/// `sched_switch_idle_hook` (`next_pid` == 0)
pub const IDLE_ENTER: u32 = 1;

/// CPU has resumed useful work
///
/// Emitted by: `cpu_idle_hook` (state == `PWR_EVENT_EXIT`),
/// `sched_switch_idle_hook` (`prev_pid` == 0)
pub const IDLE_EXIT: u32 = 2;

/// `cpu_idle` state value meaning "leaving idle"
///
/// Defined by the kernel as `PWR_EVENT_EXIT` (`(u32)-1`).
pub const PWR_EVENT_EXIT: u32 = u32::MAX;

/// Pid of the per-CPU idle task (`swapper/N`)
pub const IDLE_TASK_PID: i32 = 0;

// ============================================================================
// Hook Source Constants
// ============================================================================

/// Event produced by the `power/cpu_idle` tracepoint
pub const SOURCE_CPU_IDLE: u8 = 1;

/// Event produced by the `sched/sched_switch` fallback
pub const SOURCE_SCHED_SWITCH: u8 = 2;

// ============================================================================
// Counter Indices (`IDLE_COUNTERS` per-CPU array)
// ============================================================================

/// Events successfully written to the ring buffer
pub const COUNTER_EMITTED: u32 = 0;

/// Events lost because the ring buffer was full
pub const COUNTER_DROPPED: u32 = 1;

/// Number of slots in the `IDLE_COUNTERS` map
pub const COUNTER_SLOTS: u32 = 2;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from eBPF to userspace via ring buffer
///
/// One event per idle transition. Userspace applies events to the accounting
/// service in ring-buffer order, which preserves per-CPU ordering.
///
/// **Memory Layout**: `#[repr(C)]`, 24 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleEvent {
    /// Timestamp in nanoseconds (from `bpf_ktime_get_ns()`)
    ///
    /// `CLOCK_MONOTONIC` base, so userspace can compare it with
    /// `clock_gettime(CLOCK_MONOTONIC)` when folding in-progress intervals.
    pub timestamp_ns: u64,

    /// CPU whose idle state changed (0-based)
    pub cpu_id: u32,

    /// [`IDLE_ENTER`] or [`IDLE_EXIT`]
    pub kind: u32,

    /// Hook that produced the event ([`SOURCE_CPU_IDLE`] or [`SOURCE_SCHED_SWITCH`])
    pub source: u8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],
}

impl IdleEvent {
    /// Size of one event as written by the kernel side
    pub const SIZE: usize = core::mem::size_of::<Self>();

    #[must_use]
    pub const fn new(timestamp_ns: u64, cpu_id: u32, kind: u32, source: u8) -> Self {
        Self { timestamp_ns, cpu_id, kind, source, _padding: [0; 7] }
    }

    #[must_use]
    pub const fn is_enter(&self) -> bool {
        self.kind == IDLE_ENTER
    }

    #[must_use]
    pub const fn is_exit(&self) -> bool {
        self.kind == IDLE_EXIT
    }
}

/// Tracepoint arguments for `power/cpu_idle`
///
/// Layout defined by the Linux kernel tracepoint ABI:
/// `/sys/kernel/tracing/events/power/cpu_idle/format`
#[repr(C)]
pub struct CpuIdleArgs {
    /// Common tracepoint fields (type, flags, preempt count, pid)
    #[allow(clippy::pub_underscore_fields)]
    pub __unused__: u64,

    /// Target idle state index, or [`PWR_EVENT_EXIT`] when leaving idle
    pub state: u32,

    /// CPU entering or leaving idle
    pub cpu_id: u32,
}

/// Tracepoint arguments for `sched/sched_switch`
///
/// Layout defined by the Linux kernel tracepoint ABI:
/// `/sys/kernel/tracing/events/sched/sched_switch/format`
///
/// Only the pids matter for idle detection: the idle task always runs with
/// pid [`IDLE_TASK_PID`].
#[repr(C)]
pub struct SchedSwitchArgs {
    /// Common tracepoint fields
    #[allow(clippy::pub_underscore_fields)]
    pub __unused__: u64,

    /// Command name of the thread being switched out
    pub prev_comm: [u8; 16],

    /// Thread ID (PID) of the thread being switched out
    pub prev_pid: i32,

    /// Priority of the thread being switched out
    pub prev_prio: i32,

    /// State of the thread being switched out
    pub prev_state: i64,

    /// Command name of the thread being switched in
    pub next_comm: [u8; 16],

    /// Thread ID (PID) of the thread being switched in
    pub next_pid: i32,

    /// Priority of the thread being switched in
    pub next_prio: i32,
}

#[cfg(feature = "user")]
use aya::Pod;

// Required for reading events out of the ring buffer as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for IdleEvent {}
