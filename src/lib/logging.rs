//! Logging utilities for formatted output.
//!
//! Consistent formatting for counts, durations and rates, an operation timer, and
//! summaries of what the output engine wrote.

use std::time::{Duration, Instant};

use crate::deferred::DeferredSummary;
use crate::sink::WriteCounts;

/// Formats a count with thousands separators.
///
/// ```
/// use fgstitch_lib::logging::format_count;
///
/// assert_eq!(format_count(1_234_567), "1,234,567");
/// assert_eq!(format_count(12), "12");
/// ```
#[must_use]
pub fn format_count(n: u64) -> String {
    let s = n.to_string();
    s.as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Formats a fraction (0.0-1.0) as a percentage with `decimals` places.
///
/// ```
/// use fgstitch_lib::logging::format_percent;
///
/// assert_eq!(format_percent(0.9543, 2), "95.43%");
/// assert_eq!(format_percent(1.0, 0), "100%");
/// ```
#[must_use]
pub fn format_percent(value: f64, decimals: usize) -> String {
    format!("{:.decimals$}%", value * 100.0, decimals = decimals)
}

/// Formats a duration in human-readable form (e.g. "45s", "2m 15s", "1h 30m").
///
/// ```
/// use fgstitch_lib::logging::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(135)), "2m 15s");
/// ```
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        if remaining_secs == 0 { format!("{mins}m") } else { format!("{mins}m {remaining_secs}s") }
    } else {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins == 0 { format!("{hours}h") } else { format!("{hours}h {mins}m") }
    }
}

/// Formats a processing rate, falling back to items/min for slow rates.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_rate(count: u64, duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 0.001 {
        return format!("{} records/s", format_count(count));
    }

    let rate = count as f64 / secs;
    if rate >= 1.0 {
        format!("{} records/s", format_count(rate as u64))
    } else {
        let per_min = count as f64 / (secs / 60.0);
        format!("{per_min:.1} records/min")
    }
}

/// Logs what the sinks accepted, flagged, dropped and rerouted.
#[allow(clippy::cast_precision_loss)]
pub fn log_write_summary(counts: &WriteCounts) {
    log::info!("Write Summary:");
    log::info!("  Alignments submitted: {}", format_count(counts.non_consensus));
    log::info!("  Consensus records submitted: {}", format_count(counts.consensus));
    if counts.dropped_duplicates > 0 {
        log::info!("  Duplicates removed: {}", format_count(counts.dropped_duplicates));
    }
    log::info!("  Deferred (unplaced or non-primary): {}", format_count(counts.deferred));

    if counts.unsorted > 0 {
        let fraction = counts.unsorted as f64 / counts.emitted().max(1) as f64;
        log::info!(
            "  Outside the position window: {} ({})",
            format_count(counts.unsorted),
            format_percent(fraction, 2)
        );
    }
}

/// Logs the outcome of the deferred-record pass.
pub fn log_deferred_summary(summary: &DeferredSummary) {
    log::info!(
        "Deferred records: {} read, {} unmapped with their mate, {} supplementary dropped",
        format_count(summary.records_read),
        format_count(summary.unmapped),
        format_count(summary.supplementary_dropped)
    );
}

/// Operation timing helper.
///
/// ```no_run
/// use fgstitch_lib::logging::OperationTimer;
///
/// let timer = OperationTimer::new("Stitching partitions");
/// // ... do work ...
/// timer.log_completion(10_000);
/// ```
pub struct OperationTimer {
    operation: String,
    start_time: Instant,
}

impl OperationTimer {
    /// Creates a new operation timer and logs the start.
    #[must_use]
    pub fn new(operation: &str) -> Self {
        log::info!("{operation} ...");
        Self { operation: operation.to_string(), start_time: Instant::now() }
    }

    /// Logs the completion with record count and rate.
    pub fn log_completion(&self, count: u64) {
        let duration = self.start_time.elapsed();
        log::info!(
            "{} completed: {} records in {} ({})",
            self.operation,
            format_count(count),
            format_duration(duration),
            format_rate(count, duration)
        );
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
