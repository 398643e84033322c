//! Progress logging at fixed record intervals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::info;

use crate::logging::{format_count, format_duration};

/// Thread-safe counter that logs whenever the count crosses a multiple of its interval.
///
/// ```
/// use fgstitch_lib::progress::ProgressTracker;
///
/// let tracker = ProgressTracker::new("Routed").with_interval(100);
/// for _ in 0..250 {
///     tracker.record(1, || Some("chr1:1,000".to_string())); // logs at 100 and 200
/// }
/// tracker.log_final(); // "Routed 250 records (complete) ..."
/// assert_eq!(tracker.count(), 250);
/// ```
pub struct ProgressTracker {
    interval: u64,
    message: String,
    count: AtomicU64,
    start: Instant,
}

impl ProgressTracker {
    /// Creates a tracker logging every 1,000,000 records.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            interval: 1_000_000,
            message: message.into(),
            count: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Adds `additional` to the count, logging once per interval boundary crossed.
    ///
    /// `location` describes where the scan is and is only evaluated when logging.
    /// Returns `true` when the new count lies exactly on a boundary.
    pub fn record<F>(&self, additional: u64, location: F) -> bool
    where
        F: FnOnce() -> Option<String>,
    {
        let prev = self.count.fetch_add(additional, Ordering::Relaxed);
        let count = prev + additional;

        let crossed = count / self.interval - prev / self.interval;
        if crossed > 0 {
            let milestone = (count / self.interval) * self.interval;
            let at = location().map(|l| format!(" at {l}")).unwrap_or_default();
            info!(
                "{} {} records{} ({})",
                self.message,
                format_count(milestone),
                at,
                format_duration(self.start.elapsed())
            );
        }
        count > 0 && count.is_multiple_of(self.interval)
    }

    /// Logs the final count unless the last [`ProgressTracker::record`] already did.
    pub fn log_final(&self) {
        let count = self.count();
        if count > 0 && !count.is_multiple_of(self.interval) {
            info!(
                "{} {} records (complete) ({})",
                self.message,
                format_count(count),
                format_duration(self.start.elapsed())
            );
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
