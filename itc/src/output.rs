//! Snapshot rendering for the binary
//!
//! - `text`: one line per CPU with cumulative idle seconds and, from the
//!   second snapshot on, the idle share of the last interval
//! - `json`: one JSON object per snapshot (JSON lines)
//! - `raw`: the packed device payload, for consumers of the read layout

// Time conversions lose precision for display
#![allow(clippy::cast_precision_loss)]

use std::io::Write;

use anyhow::{Context, Result};

use crate::accounting::Snapshot;
use crate::cli::OutputFormat;
use crate::device::protocol;

/// Idle share of `cpu` between two snapshots, in percent
#[must_use]
pub fn idle_percent(previous: &Snapshot, current: &Snapshot, cpu: u32) -> Option<f64> {
    let wall = current.taken_at.checked_sub(previous.taken_at)?;
    if wall.is_zero() {
        return None;
    }

    let before = previous.cpus.iter().find(|c| c.cpu == cpu)?.idle;
    let after = current.cpus.iter().find(|c| c.cpu == cpu)?.idle;
    let idle = after.saturating_sub(before);

    Some((idle.as_secs_f64() / wall.as_secs_f64() * 100.0).min(100.0))
}

/// Text block for one snapshot
#[must_use]
pub fn render_text(current: &Snapshot, previous: Option<&Snapshot>) -> String {
    let mut out = String::new();
    for cpu in &current.cpus {
        let line = match previous.and_then(|p| idle_percent(p, current, cpu.cpu)) {
            Some(pct) => {
                format!("cpu{:<4} {:>14.6} s idle  {pct:>6.2}%\n", cpu.cpu, cpu.idle.as_secs_f64())
            }
            None => format!("cpu{:<4} {:>14.6} s idle\n", cpu.cpu, cpu.idle.as_secs_f64()),
        };
        out.push_str(&line);
    }
    out
}

/// Writes successive snapshots in one format
pub struct SnapshotPrinter<W: Write> {
    format: OutputFormat,
    out: W,
    previous: Option<Snapshot>,
}

impl<W: Write> SnapshotPrinter<W> {
    pub fn new(format: OutputFormat, out: W) -> Self {
        Self { format, out, previous: None }
    }

    /// Write one snapshot
    ///
    /// # Errors
    /// Returns an error if the output cannot be written
    pub fn emit(&mut self, snapshot: Snapshot) -> Result<()> {
        match self.format {
            OutputFormat::Text => {
                let text = render_text(&snapshot, self.previous.as_ref());
                writeln!(self.out, "{text}").context("Failed to write snapshot")?;
            }
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, &snapshot)
                    .context("Failed to serialize snapshot")?;
                writeln!(self.out).context("Failed to write snapshot")?;
            }
            OutputFormat::Raw => {
                protocol::write_to(&snapshot.durations(), &mut self.out)?;
            }
        }

        self.out.flush().context("Failed to flush output")?;
        self.previous = Some(snapshot);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
