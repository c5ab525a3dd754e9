//! Pre-flight checks for the eBPF backend
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::config::EbpfConfig;

/// Minimum kernel version: BPF ring buffers arrived in 5.8
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed requirement, with instructions
pub fn run_preflight_checks(config: &EbpfConfig) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_tracefs(&config.tracefs_roots)?;
    check_object_exists(&config.object_path)?;
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would do on 5.8+, but checking them needs more
    // than libc offers; require root
    bail!(
        "Permission denied: itc requires root privileges to load eBPF programs.\n\n\
         Run with: sudo itc ...\n\
         Or without privileges: itc --backend emulated"
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some(version) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             itc requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// `(major, minor)` of a release string such as `5.15.0-generic`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check that some tracefs mount exposes events
fn check_tracefs(roots: &[PathBuf]) -> Result<()> {
    if roots.iter().any(|root| root.join("events").is_dir()) {
        return Ok(());
    }

    let tried: Vec<String> = roots.iter().map(|r| r.display().to_string()).collect();
    bail!(
        "tracefs not found (tried {}).\n\n\
         Mount it with: sudo mount -t tracefs nodev /sys/kernel/tracing",
        tried.join(", ")
    );
}

/// Check that the kernel-side object was built
fn check_object_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "eBPF object not found: {}\n\n\
             Build it with: cargo xtask build-ebpf --release\n\
             Or point --ebpf-object at an existing build.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!("Not a file: {}\n\n--ebpf-object must point to the compiled object.", path.display());
    }
    Ok(())
}
