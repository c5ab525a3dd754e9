//! Cross-CPU wake barrier
//!
//! Scheduling a thread onto a CPU forces that CPU out of its idle loop. One
//! short-lived thread is pinned to every CPU; the barrier passes once each
//! has reported in from its CPU.

#![allow(unsafe_code)] // sched_setaffinity() requires unsafe

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, warn};

use crate::domain::{CpuId, ItcError};

/// Pin the calling thread to `cpu`
fn pin_to(cpu: CpuId) -> std::io::Result<()> {
    #[allow(clippy::cast_sign_loss)]
    if cpu.index() >= libc::CPU_SETSIZE as usize {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }

    // SAFETY: cpu_set_t is plain old data and zeroed is the empty set; the
    // index was checked against CPU_SETSIZE above
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu.index(), &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };

    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Wake every CPU in `cpus` and wait for all of them to answer
///
/// A CPU that cannot be pinned to (offline, outside the cgroup's cpuset)
/// still answers, but is reported at debug level.
///
/// # Errors
/// [`ItcError::WakeTimeout`] if not every CPU answered within `timeout`
pub fn broadcast_wake(cpus: &[CpuId], timeout: Duration) -> Result<(), ItcError> {
    let (tx, rx) = bounded::<(CpuId, bool)>(cpus.len());
    let expected = cpus.len();

    for &cpu in cpus {
        let tx = tx.clone();
        let spawned = thread::Builder::new().name(format!("itc-wake-{}", cpu.0)).spawn(move || {
            let pinned = match pin_to(cpu) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Could not pin wake thread to {cpu}: {e}");
                    false
                }
            };
            let _ = tx.send((cpu, pinned));
        });

        if let Err(e) = spawned {
            warn!("Failed to spawn wake thread for {cpu}: {e}");
        }
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut acknowledged = 0;
    let mut unpinned = 0;

    while acknowledged < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((_, pinned)) => {
                acknowledged += 1;
                if !pinned {
                    unpinned += 1;
                }
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                return Err(ItcError::WakeTimeout { acknowledged, expected });
            }
        }
    }

    if unpinned > 0 {
        warn!("Wake barrier: {unpinned} of {expected} CPUs could not be targeted directly");
    }
    debug!("Wake barrier passed on {expected} CPUs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{CpuTopology, SysfsTopology};

    #[test]
    fn test_empty_set_passes() {
        broadcast_wake(&[], Duration::from_millis(10)).unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_wake_present_cpus() {
        let cpus = SysfsTopology::new().present_cpus().expect("Failed to read present CPUs");
        broadcast_wake(&cpus, Duration::from_secs(10)).unwrap();
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_unreachable_cpu_still_answers() {
        // Far beyond any real CPU: pinning fails, the thread still reports in
        broadcast_wake(&[CpuId(1000)], Duration::from_secs(5)).unwrap();
    }
}
