//! Typed configuration
//!
//! Built from the command line (see [`crate::cli::Args`]) or constructed
//! directly by library users. Every field has a working default.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::Tracepoint;

/// Upper bound on CPU slots when the host's `possible` list cannot be read
pub const DEFAULT_MAX_CPUS: usize = 4096;

/// Where `cargo xtask build-ebpf` leaves the kernel-side object
pub const DEFAULT_EBPF_OBJECT: &str = "target/bpfel-unknown-none/release/itc";

/// Tracefs mount points, newest layout first
pub const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// How often the eBPF worker drains the ring buffer between reads
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// How long the wake barrier waits for every CPU to answer
pub const WAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Accounting service settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Number of per-CPU slots; events and present CPUs beyond it are ignored
    pub max_cpus: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { max_cpus: DEFAULT_MAX_CPUS }
    }
}

/// eBPF event source settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EbpfConfig {
    /// Compiled `itc-ebpf` object
    pub object_path: PathBuf,

    /// Explicit hook point used when `power/cpu_idle` is not exposed
    ///
    /// Only needed on kernels without the formal idle notification; without
    /// it such hosts fail to open with `NoIdleMechanism`.
    pub fallback: Option<Tracepoint>,

    /// Tracefs mount points probed for tracepoint availability
    pub tracefs_roots: Vec<PathBuf>,

    /// Ring buffer drain period of the worker thread
    pub drain_interval: Duration,

    /// Wake barrier timeout
    pub wake_timeout: Duration,
}

impl Default for EbpfConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_EBPF_OBJECT),
            fallback: None,
            tracefs_roots: TRACEFS_ROOTS.iter().map(PathBuf::from).collect(),
            drain_interval: DRAIN_INTERVAL,
            wake_timeout: WAKE_TIMEOUT,
        }
    }
}
