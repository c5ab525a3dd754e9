//! Event source diagnostics printed when a session ends

use log::warn;

use crate::hook::SourceStats;

/// Print the counters a released idle source reported
///
/// Kernel-side counters are zero for sources without a kernel side.
pub fn print_source_diagnostics(source: &str, stats: &SourceStats) {
    println!("\n🔍 {source} idle source:");
    println!("   - Events delivered: {}", stats.delivered);
    if stats.emitted > 0 || stats.dropped > 0 {
        println!("   - Events emitted by kernel: {}", stats.emitted);
        println!("   - Events dropped (ring buffer full): {}", stats.dropped);
    }
    if stats.malformed > 0 {
        println!("   - Malformed records: {}", stats.malformed);
    }

    if let Some(note) = loss_warning(stats) {
        warn!("{note}");
    }
}

/// Warning text when events were lost, since totals then undercount
#[must_use]
pub fn loss_warning(stats: &SourceStats) -> Option<String> {
    let lost = stats.dropped + stats.malformed;
    (lost > 0).then(|| format!("{lost} idle events lost; idle totals may undercount"))
}
