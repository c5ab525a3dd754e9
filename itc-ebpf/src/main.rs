//! # eBPF Kernel-Side Idle Hooks
//!
//! eBPF programs that run inside the Linux kernel and report every idle
//! transition of every CPU to userspace.
//!
//! ## Programs
//!
//! - **Tracepoint**: `cpu_idle_hook` - `power/cpu_idle`, the formal idle notification
//! - **Tracepoint**: `sched_switch_idle_hook` - fallback for kernels without
//!   `cpu_idle`; treats switches to/from the idle task as idle enter/exit
//!
//! Userspace attaches exactly one of them per session.
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (16MB) of [`IdleEvent`]s
//! - `IDLE_COUNTERS` - Per-CPU emitted/dropped counters
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, gen::bpf_get_smp_processor_id},
    macros::{map, tracepoint},
    maps::{PerCpuArray, RingBuf},
    programs::TracePointContext,
    EbpfContext,
};
use aya_log_ebpf::error;
use itc_common::{
    CpuIdleArgs, IdleEvent, SchedSwitchArgs, COUNTER_DROPPED, COUNTER_EMITTED, COUNTER_SLOTS,
    IDLE_ENTER, IDLE_EXIT, IDLE_TASK_PID, PWR_EVENT_EXIT, SOURCE_CPU_IDLE, SOURCE_SCHED_SWITCH,
};

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending idle transitions to userspace
///
/// - **Size**: 16MB
/// - **Usage**: Kernel writes with `EVENTS.output()`, userspace drains it every
///   few milliseconds and before each snapshot read
///
/// Idle transitions are frequent on large machines (thousands per second per
/// CPU), so the buffer is sized for several seconds of backlog.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// Per-CPU diagnostic counters, indexed by `COUNTER_*`
///
/// Per-CPU slots avoid lost updates from concurrent increments.
#[map]
static IDLE_COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(COUNTER_SLOTS, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: `power/cpu_idle` tracepoint
/// Fires when a CPU enters an idle state and again when it leaves
#[tracepoint]
pub fn cpu_idle_hook(ctx: TracePointContext) -> u32 {
    match try_cpu_idle(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_cpu_idle(ctx: &TracePointContext) -> Result<(), i64> {
    // Layout from /sys/kernel/tracing/events/power/cpu_idle/format
    let args: *const CpuIdleArgs = ctx.as_ptr() as *const CpuIdleArgs;
    let state = unsafe { (*args).state };
    let cpu_id = unsafe { (*args).cpu_id };

    let kind = if state == PWR_EVENT_EXIT { IDLE_EXIT } else { IDLE_ENTER };

    emit(ctx, cpu_id, kind, SOURCE_CPU_IDLE)
}

/// Hook: `sched/sched_switch` tracepoint (fallback)
/// The idle task leaving the CPU is an exit, the idle task arriving is an enter
#[tracepoint]
pub fn sched_switch_idle_hook(ctx: TracePointContext) -> u32 {
    match try_sched_switch_idle(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sched_switch_idle(ctx: &TracePointContext) -> Result<(), i64> {
    let args: *const SchedSwitchArgs = ctx.as_ptr() as *const SchedSwitchArgs;
    let prev_pid = unsafe { (*args).prev_pid };
    let next_pid = unsafe { (*args).next_pid };

    if prev_pid != IDLE_TASK_PID && next_pid != IDLE_TASK_PID {
        return Ok(());
    }

    let cpu_id = unsafe { bpf_get_smp_processor_id() };

    if prev_pid == IDLE_TASK_PID {
        emit(ctx, cpu_id, IDLE_EXIT, SOURCE_SCHED_SWITCH)?;
    }
    if next_pid == IDLE_TASK_PID {
        emit(ctx, cpu_id, IDLE_ENTER, SOURCE_SCHED_SWITCH)?;
    }

    Ok(())
}

fn emit(ctx: &TracePointContext, cpu_id: u32, kind: u32, source: u8) -> Result<(), i64> {
    let timestamp_ns = unsafe { bpf_ktime_get_ns() };
    let event = IdleEvent::new(timestamp_ns, cpu_id, kind, source);

    match unsafe { EVENTS.output(&event, 0) } {
        Ok(()) => {
            bump(COUNTER_EMITTED);
            Ok(())
        }
        Err(e) => {
            bump(COUNTER_DROPPED);
            error!(ctx, "itc: ring buffer full, dropped idle event for cpu {}", cpu_id);
            Err(e)
        }
    }
}

// Helper: increment this CPU's slot of a diagnostic counter
fn bump(index: u32) {
    if let Some(counter) = IDLE_COUNTERS.get_ptr_mut(index) {
        unsafe { *counter += 1 };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
