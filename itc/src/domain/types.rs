//! Domain types providing compile-time safety and self-documentation

use std::fmt;
use std::str::FromStr;

/// CPU ID
///
/// Represents a logical CPU index (0, 1, 2, ...), the same numbering the
/// kernel uses in `/sys/devices/system/cpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Slot index in the per-CPU state array
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU:{}", self.0)
    }
}

impl From<u32> for CpuId {
    fn from(cpu: u32) -> Self {
        CpuId(cpu)
    }
}

/// Kernel tracepoint identifier (`category/name`)
///
/// Accepts both `power/cpu_idle` and the perf-style `power:cpu_idle` spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tracepoint {
    pub category: String,
    pub name: String,
}

impl Tracepoint {
    #[must_use]
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self { category: category.into(), name: name.into() }
    }
}

impl fmt::Display for Tracepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

impl FromStr for Tracepoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (category, name) = s
            .trim()
            .split_once(['/', ':'])
            .ok_or_else(|| format!("expected CATEGORY/NAME, got \"{s}\""))?;

        if category.is_empty() || name.is_empty() || name.contains(['/', ':']) {
            return Err(format!("expected CATEGORY/NAME, got \"{s}\""));
        }

        Ok(Self::new(category, name))
    }
}
