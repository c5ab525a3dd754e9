//! # itc - Main Entry Point
//!
//! Opens the idle device once, prints a snapshot every interval until the
//! count or duration limit (or Ctrl+C), then releases the device and prints
//! the idle source's counters.
//!
//! - **eBPF** (default, root): kernel idle tracepoints
//! - **Emulated** (`--backend emulated`): in-process CPUs, no privileges

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use itc::accounting::{IdleAccountingService, MonotonicClock};
use itc::cli::{Args, Backend, OutputFormat};
use itc::config::DEFAULT_MAX_CPUS;
use itc::device::DeviceSession;
use itc::diagnostics::print_source_diagnostics;
use itc::domain::ItcError;
use itc::hook::{EbpfIdleSource, EmulatedHost, EmulatedIdleSource, IdleEventSource};
use itc::output::SnapshotPrinter;
use itc::preflight::run_preflight_checks;
use itc::topology::SysfsTopology;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_BUSY: i32 = 16;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if matches!(err.downcast_ref::<ItcError>(), Some(ItcError::AlreadyInUse)) {
        return EXIT_BUSY;
    }

    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    match args.backend {
        Backend::Ebpf => run_ebpf(&args).await,
        Backend::Emulated => run_emulated(&args).await,
    }
}

async fn run_ebpf(args: &Args) -> Result<()> {
    let config = args.ebpf_config();
    run_preflight_checks(&config)?;

    let topology = Arc::new(SysfsTopology::new());
    let slots = topology.slot_count().unwrap_or_else(|e| {
        warn!("{e}; assuming {DEFAULT_MAX_CPUS} CPU slots");
        DEFAULT_MAX_CPUS
    });

    let service = Arc::new(IdleAccountingService::new(
        &args.service_config(slots),
        Arc::new(MonotonicClock),
        topology.clone(),
    ));
    let source = EbpfIdleSource::new(config, topology);

    collect(&DeviceSession::new(service, source), args).await
}

async fn run_emulated(args: &Args) -> Result<()> {
    let host = EmulatedHost::start(args.emulated_cpus).context("Failed to start emulated host")?;
    let topology = Arc::new(host.topology());

    let service = Arc::new(IdleAccountingService::new(
        &args.service_config(args.emulated_cpus as usize),
        Arc::new(MonotonicClock),
        topology,
    ));
    let source = EmulatedIdleSource::new(host.clone());

    let result = collect(&DeviceSession::new(service, source), args).await;
    host.shutdown();
    result
}

/// Hold the device open and print snapshots until a limit or Ctrl+C
async fn collect<S: IdleEventSource>(session: &DeviceSession<S>, args: &Args) -> Result<()> {
    let quiet = args.quiet || args.format == OutputFormat::Raw;

    let reader = session.open().context("Failed to open idle device")?;
    let cpus = session.service().present_cpus()?;

    if !quiet {
        println!("itc v{}", env!("CARGO_PKG_VERSION"));
        println!("backend: {:?}", args.backend);
        println!("cpus: {}", cpus.len());
        println!("read size: {} bytes", reader.required_len()?);
        println!();
    }

    let mut printer = SnapshotPrinter::new(args.format, std::io::stdout().lock());

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let interval = args.interval();
    let mut taken = 0u64;
    let mut exit_reason = "interrupted";

    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = &mut ctrl_c => break,
        }

        printer.emit(reader.snapshot()?)?;
        taken += 1;

        if args.snapshot_limit().is_some_and(|limit| taken >= limit) {
            exit_reason = "snapshot count reached";
            break;
        }
        if args.time_limit().is_some_and(|limit| started.elapsed() >= limit) {
            exit_reason = "duration limit reached";
            break;
        }
    }

    let mut out = printer.into_inner();
    out.flush().context("Failed to flush output")?;
    drop(out);

    let stats = reader.release();
    info!("Stopped after {taken} snapshots: {exit_reason}");

    if !quiet {
        println!("\n{taken} snapshots in {:.1}s ({exit_reason})", started.elapsed().as_secs_f64());
        print_source_diagnostics(session.source_name(), &stats);
    }

    Ok(())
}
