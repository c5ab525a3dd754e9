//! # itc - Per-CPU Idle Time Collector
//!
//! itc keeps a cumulative idle-time total for every CPU and hands a
//! consistent snapshot of all of them to one reader at a time, in a fixed
//! 16-byte-per-CPU layout.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Kernel / Emulated Host                       │
//! │  • Tracepoints: power/cpu_idle (or sched/sched_switch)          │
//! │  • Emulated CPUs: interceptable idle handler slot               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ idle enter / exit per CPU
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        itc (This Crate)                         │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐    │
//! │  │     Hook     │──▶│    Accounting    │◀──│    Device    │    │
//! │  │ (IdleEvent-  │   │ (one lock, per-  │   │ (session +   │    │
//! │  │   Source)    │   │   CPU records)   │   │  protocol)   │    │
//! │  └──────────────┘   └──────────────────┘   └──────┬───────┘    │
//! │                                                    │            │
//! │                                                    ▼            │
//! │                                             ┌──────────────┐   │
//! │                                             │    Output    │   │
//! │                                             │ (text/json/  │   │
//! │                                             │     raw)     │   │
//! │                                             └──────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`accounting`]: per-CPU idle records behind a single lock, snapshots
//! - [`hook`]: idle event sources (eBPF, emulated host) and the wake barrier
//! - [`device`]: single-reader session and the read payload layout
//! - [`topology`]: present/possible CPU sets from sysfs
//! - [`preflight`]: privilege, kernel and tracefs checks for the eBPF backend
//! - [`output`], [`diagnostics`]: what the binary prints
//! - [`cli`], [`config`]: command line and typed settings
//! - [`domain`]: core types (`CpuId`, `Tracepoint`) and [`domain::ItcError`]
//!
//! ## Typical Usage
//!
//! ```bash
//! # Idle seconds per CPU, once a second
//! sudo ./itc
//!
//! # Ten JSON snapshots at 500ms
//! sudo ./itc --format json --interval 500 --count 10
//!
//! # No privileges: emulated CPUs
//! ./itc --backend emulated --emulated-cpus 8
//! ```

pub mod accounting;
pub mod cli;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod domain;
pub mod hook;
pub mod output;
pub mod preflight;
pub mod topology;
