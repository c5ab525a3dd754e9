use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Where the object lands; itc loads it from here by default
const EBPF_OBJECT: &str = "target/bpfel-unknown-none/release/itc";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel-side idle hooks (itc-ebpf)
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
    /// Build the hooks and the collector, then run it as root
    Run {
        /// Command prefix used to gain privileges
        #[arg(long, default_value = "sudo -E")]
        runner: String,
        /// Arguments passed through to itc
        #[arg(last = true)]
        itc_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
        Cmd::Run { runner, itc_args } => run(&runner, &itc_args)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Always release: debug builds pull in formatting code (LowerHex) the
    // BPF linker rejects; LTO removes it.
    let status = Command::new("cargo")
        .args(["+nightly", "build", "--package", "itc-ebpf", "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to build eBPF program")?;

    if !status.success() {
        bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF program built successfully");
    println!("  Target: {target}");
    println!("  Object: {EBPF_OBJECT}");

    Ok(())
}

fn run(runner: &str, itc_args: &[String]) -> Result<()> {
    build_ebpf("bpfel-unknown-none", true)?;

    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "itc"])
        .status()
        .context("Failed to build itc")?;
    if !status.success() {
        bail!("Failed to build itc");
    }

    let mut parts = runner.split_whitespace();
    let mut cmd = match parts.next() {
        Some(program) => {
            let mut cmd = Command::new(program);
            cmd.args(parts).arg("target/release/itc");
            cmd
        }
        None => Command::new("target/release/itc"),
    };

    let status = cmd.args(itc_args).status().context("Failed to run itc")?;
    if !status.success() {
        bail!("itc exited with {status}");
    }
    Ok(())
}
