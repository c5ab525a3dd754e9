//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::{EbpfConfig, ServiceConfig, DEFAULT_EBPF_OBJECT};
use crate::domain::Tracepoint;

/// Where idle events come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Kernel idle tracepoints through the eBPF object (requires root)
    Ebpf,
    /// In-process CPU threads with an interceptable idle handler
    Emulated,
}

/// Snapshot rendering on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Cumulative idle seconds per CPU
    Text,
    /// One JSON object per snapshot
    Json,
    /// Packed 16-byte records, as a device read returns them
    Raw,
}

#[derive(Parser, Debug)]
#[command(
    name = "itc",
    about = "Per-CPU cumulative idle time collector",
    after_help = "\
EXAMPLES:
    sudo itc                                 Idle seconds per CPU, once a second
    sudo itc --format json --count 10        Ten JSON snapshots
    sudo itc --format raw --count 1 | xxd    One raw device payload
    itc --backend emulated --emulated-cpus 4 No privileges needed"
)]
pub struct Args {
    /// Idle event source
    #[arg(long, value_enum, default_value = "ebpf")]
    pub backend: Backend,

    /// Milliseconds between snapshots
    #[arg(short, long, default_value = "1000", value_name = "MS")]
    pub interval: u64,

    /// Stop after N snapshots (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    pub count: u64,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0", value_name = "SECS")]
    pub duration: u64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Number of per-CPU slots (default: the host's possible CPU count)
    #[arg(long, value_name = "N")]
    pub max_cpus: Option<usize>,

    /// Tracepoint to use when power/cpu_idle is unavailable (e.g. sched/sched_switch)
    #[arg(long, value_name = "CAT/NAME")]
    pub fallback_tracepoint: Option<Tracepoint>,

    /// Compiled kernel-side object (built with `cargo xtask build-ebpf`)
    #[arg(long, value_name = "PATH", default_value = DEFAULT_EBPF_OBJECT)]
    pub ebpf_object: PathBuf,

    /// CPUs of the emulated host
    #[arg(long, default_value = "4", value_name = "N")]
    pub emulated_cpus: u32,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.max(1))
    }

    /// Run time limit, `None` when unlimited
    #[must_use]
    pub fn time_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    /// Snapshot limit, `None` when unlimited
    #[must_use]
    pub fn snapshot_limit(&self) -> Option<u64> {
        (self.count > 0).then_some(self.count)
    }

    /// Service settings, falling back to `default_slots` when `--max-cpus` is absent
    #[must_use]
    pub fn service_config(&self, default_slots: usize) -> ServiceConfig {
        ServiceConfig { max_cpus: self.max_cpus.unwrap_or(default_slots) }
    }

    #[must_use]
    pub fn ebpf_config(&self) -> EbpfConfig {
        EbpfConfig {
            object_path: self.ebpf_object.clone(),
            fallback: self.fallback_tracepoint.clone(),
            ..EbpfConfig::default()
        }
    }
}
