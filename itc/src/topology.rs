//! CPU topology
//!
//! Answers which CPUs are *present* (installed, possibly offline) and how
//! many slots the host could ever have (*possible*), from the
//! `/sys/devices/system/cpu` lists.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{CpuId, ItcError};

/// Default sysfs directory holding the `present`/`possible`/`online` lists
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Source of the present CPU set
pub trait CpuTopology: Send + Sync {
    /// Present CPUs in ascending order, without duplicates
    ///
    /// # Errors
    /// Returns an error if the host cannot be queried
    fn present_cpus(&self) -> Result<Vec<CpuId>, ItcError>;
}

/// Topology read from sysfs on every query, so CPU hotplug is picked up
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::with_root(SYSFS_CPU_ROOT)
    }
}

impl SysfsTopology {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the lists from another directory (tests, containers with a bind-mounted sysfs)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// CPUs the kernel could ever bring up (`possible`)
    ///
    /// # Errors
    /// Returns an error if the list cannot be read or parsed
    pub fn possible_cpus(&self) -> Result<Vec<CpuId>, ItcError> {
        self.read_list("possible")
    }

    /// CPUs currently online (`online`)
    ///
    /// # Errors
    /// Returns an error if the list cannot be read or parsed
    pub fn online_cpus(&self) -> Result<Vec<CpuId>, ItcError> {
        self.read_list("online")
    }

    /// Number of slots needed to cover every possible CPU id
    ///
    /// # Errors
    /// Returns an error if the `possible` list cannot be read or parsed
    pub fn slot_count(&self) -> Result<usize, ItcError> {
        Ok(self.possible_cpus()?.last().map_or(0, |cpu| cpu.index() + 1))
    }

    fn read_list(&self, name: &str) -> Result<Vec<CpuId>, ItcError> {
        let path = self.root.join(name);
        let content = fs::read_to_string(&path)
            .map_err(|e| ItcError::Topology(format!("failed to read {}: {e}", path.display())))?;
        parse_cpu_list(&content)
    }
}

impl CpuTopology for SysfsTopology {
    fn present_cpus(&self) -> Result<Vec<CpuId>, ItcError> {
        self.read_list("present")
    }
}

/// Topology with a fixed CPU set (emulated hosts and tests)
#[derive(Debug, Clone)]
pub struct FixedTopology {
    cpus: Vec<CpuId>,
}

impl FixedTopology {
    pub fn new(cpus: impl IntoIterator<Item = CpuId>) -> Self {
        let mut cpus: Vec<CpuId> = cpus.into_iter().collect();
        cpus.sort_unstable();
        cpus.dedup();
        Self { cpus }
    }

    /// CPUs `0..count`
    #[must_use]
    pub fn with_count(count: u32) -> Self {
        Self::new((0..count).map(CpuId))
    }
}

impl CpuTopology for FixedTopology {
    fn present_cpus(&self) -> Result<Vec<CpuId>, ItcError> {
        Ok(self.cpus.clone())
    }
}

/// Parse a kernel CPU list such as `0-3,8-11` or `5`
///
/// The result is sorted and de-duplicated. An empty list yields no CPUs.
///
/// # Errors
/// Returns [`ItcError::Topology`] on malformed input
pub fn parse_cpu_list(content: &str) -> Result<Vec<CpuId>, ItcError> {
    let content = content.trim();
    let mut cpus = Vec::new();

    if content.is_empty() {
        return Ok(cpus);
    }

    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|e| ItcError::Topology(format!("bad CPU id \"{s}\" in \"{content}\": {e}")))
    };

    for range in content.split(',') {
        if let Some((start, end)) = range.split_once('-') {
            // Range like "0-3"
            let start = parse(start)?;
            let end = parse(end)?;
            if end < start {
                return Err(ItcError::Topology(format!("descending CPU range \"{range}\"")));
            }
            cpus.extend((start..=end).map(CpuId));
        } else {
            // Single CPU like "5"
            cpus.push(CpuId(parse(range)?));
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges_and_singles() {
        let cpus = parse_cpu_list("0-3,8-9,5\n").unwrap();
        let ids: Vec<u32> = cpus.iter().map(|c| c.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 5, 8, 9]);
    }

    #[test]
    fn test_parse_single_cpu() {
        assert_eq!(parse_cpu_list("0").unwrap(), vec![CpuId(0)]);
        assert!(parse_cpu_list("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cpu_list("0-x").is_err());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a").is_err());
    }

    #[test]
    fn test_fixed_topology_sorted() {
        let topo = FixedTopology::new([CpuId(2), CpuId(0), CpuId(2)]);
        assert_eq!(topo.present_cpus().unwrap(), vec![CpuId(0), CpuId(2)]);
        assert_eq!(FixedTopology::with_count(3).present_cpus().unwrap().len(), 3);
    }

    #[test]
    fn test_sysfs_topology_from_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present"), "0-1,4\n").unwrap();
        fs::write(dir.path().join("possible"), "0-7\n").unwrap();

        let topo = SysfsTopology::with_root(dir.path());
        assert_eq!(topo.present_cpus().unwrap(), vec![CpuId(0), CpuId(1), CpuId(4)]);
        assert_eq!(topo.slot_count().unwrap(), 8);
        assert!(topo.online_cpus().is_err());
    }

    #[test]
    fn test_present_cpus_on_host() {
        // This test relies on /sys being available (Linux only)
        let result = SysfsTopology::new().present_cpus();

        #[cfg(target_os = "linux")]
        {
            let cpus = result.expect("Failed to read present CPUs");
            assert!(!cpus.is_empty(), "Should have at least one CPU");
            assert!(cpus.contains(&CpuId(0)));
            for pair in cpus.windows(2) {
                assert!(pair[0] < pair[1]);
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            assert!(result.is_err());
        }
    }
}
