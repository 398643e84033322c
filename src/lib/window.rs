//! Position-window reordering cache.
//!
//! Records for one partition arrive roughly in genomic order, with a bounded lag. The
//! cache holds them in an ordered map and releases every record strictly below a moving
//! "writable" threshold once enough of them have accumulated, so the emitted stream is
//! non-decreasing in position while memory stays bounded by the window width.
//!
//! Thresholds tracked per partition:
//!
//! - `last_written_position`: highest position already emitted.
//! - `upper_writable_position`: records strictly below this are eligible to flush.
//! - `upper_bound_position`: records above this are not accepted.
//!
//! `last_written_position <= upper_writable_position <= upper_bound_position` always holds.
//! Emitting a record below `last_written_position` means the caller fed records out of the
//! agreed order; the cache panics rather than write an unsorted file.
//!
//! # Example
//!
//! ```
//! use fgstitch_lib::builder::RecordBuilder;
//! use fgstitch_lib::window::{PositionWindowCache, WindowConfig};
//!
//! let config = WindowConfig { min_write_count: 2, ..WindowConfig::default() };
//! let mut cache = PositionWindowCache::new(config, Vec::new());
//! cache.initialise_start_position(0, 100);
//! cache.set_upper_writable_position(200);
//!
//! for pos in [120, 110] {
//!     let record = RecordBuilder::mapped_read().sequence("ACGT").alignment_start(pos).build();
//!     assert!(cache.can_write_record(&record));
//!     cache.add_record(record).unwrap();
//! }
//!
//! let written = cache.into_output();
//! assert_eq!(written.len(), 2);
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use log::debug;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::keys::{CoordinateKey, OrderedKey};
use crate::record::informative_position;
use crate::validation::{validate_below, validate_positive};

/// Default width, in bases, of the acceptance window above the scan position.
pub const DEFAULT_POSITION_BUFFER: usize = 500;

/// Default lag, in bases, between the scan position and the writable threshold.
pub const DEFAULT_READ_POS_CACHE_BUFFER: usize = 30;

/// Default number of eligible records required before a flush happens.
pub const DEFAULT_MIN_WRITE_COUNT: usize = 10;

/// Tuning for a [`PositionWindowCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Width of the acceptance window above the region start or scan position.
    pub position_buffer: usize,
    /// Safety margin subtracted from the scan position to get the writable threshold.
    /// Must exceed the largest position lag expected from upstream (e.g. long clips).
    pub read_pos_cache_buffer: usize,
    /// Minimum number of eligible records that triggers a flush.
    pub min_write_count: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            position_buffer: DEFAULT_POSITION_BUFFER,
            read_pos_cache_buffer: DEFAULT_READ_POS_CACHE_BUFFER,
            min_write_count: DEFAULT_MIN_WRITE_COUNT,
        }
    }
}

impl WindowConfig {
    /// Checks the settings are usable.
    ///
    /// # Errors
    /// Returns an error if `min_write_count` is zero or the writable margin is not smaller
    /// than the window width.
    pub fn validate(&self) -> crate::errors::Result<()> {
        validate_positive(self.min_write_count, "min-write-count")?;
        validate_below(
            self.read_pos_cache_buffer,
            self.position_buffer,
            "read-pos-cache-buffer",
            "position-buffer",
        )
    }
}

/// Destination for records released by the cache, in release order.
pub trait WindowOutput {
    /// Writes one record.
    ///
    /// # Errors
    /// Returns an error if the underlying write fails.
    fn emit(&mut self, record: RecordBuf) -> Result<()>;
}

impl WindowOutput for Vec<RecordBuf> {
    fn emit(&mut self, record: RecordBuf) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Running totals for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Records emitted to the output.
    pub records_written: u64,
    /// Number of flushes that emitted at least one record.
    pub flushes: u64,
    /// Largest number of records held at once.
    pub peak_cached: usize,
}

/// Bounded reordering buffer for one partition.
pub struct PositionWindowCache<W: WindowOutput> {
    config: WindowConfig,
    output: W,
    contig: Option<usize>,
    last_written_position: usize,
    upper_bound_position: usize,
    upper_writable_position: usize,
    min_cached_position: Option<usize>,
    records: BTreeMap<OrderedKey, RecordBuf>,
    /// Records currently cached strictly below `upper_writable_position`.
    eligible: usize,
    next_seq: u64,
    stats: WindowStats,
}

impl<W: WindowOutput> PositionWindowCache<W> {
    /// Creates an empty cache writing to `output`.
    pub fn new(config: WindowConfig, output: W) -> Self {
        Self {
            config,
            output,
            contig: None,
            last_written_position: 0,
            upper_bound_position: 0,
            upper_writable_position: 0,
            min_cached_position: None,
            records: BTreeMap::new(),
            eligible: 0,
            next_seq: 1,
            stats: WindowStats::default(),
        }
    }

    /// Starts (or restarts) the window at `pos` on `contig`.
    ///
    /// Moving to another contig resets the last written position. On the same contig the
    /// thresholds never drop below what has already been written.
    pub fn initialise_start_position(&mut self, contig: usize, pos: usize) {
        debug_assert!(
            self.contig == Some(contig) || self.records.is_empty(),
            "window must be flushed before changing contig"
        );
        if self.contig != Some(contig) {
            self.last_written_position = 0;
        }
        self.contig = Some(contig);
        self.min_cached_position = Some(pos);
        self.upper_writable_position = pos.max(self.last_written_position);
        self.upper_bound_position =
            pos.saturating_add(self.config.position_buffer).max(self.upper_writable_position);
        self.recount_eligible();
        self.check_invariant();
    }

    /// Raises the acceptance ceiling. Lower values are ignored.
    pub fn set_upper_bound_position(&mut self, pos: usize) {
        self.upper_bound_position = self.upper_bound_position.max(pos);
    }

    /// Raises the writable threshold to `pos - read_pos_cache_buffer`. Lower values are ignored.
    ///
    /// # Panics
    /// Panics if the new threshold would exceed the acceptance ceiling.
    pub fn set_upper_writable_position(&mut self, pos: usize) {
        let candidate = pos.saturating_sub(self.config.read_pos_cache_buffer);
        if candidate > self.upper_writable_position {
            self.upper_writable_position = candidate;
            self.recount_eligible();
        }
        self.check_invariant();
    }

    /// True if the record may enter the window.
    ///
    /// Rejects records on another contig, records with no position and records outside
    /// `[last_written_position, upper_bound_position]`.
    #[must_use]
    pub fn can_write_record(&self, record: &RecordBuf) -> bool {
        let Some(contig) = self.contig else {
            return false;
        };
        match informative_position(record) {
            Some((record_contig, pos)) => {
                record_contig == contig
                    && pos >= self.last_written_position
                    && pos <= self.upper_bound_position
            }
            None => false,
        }
    }

    /// Caches a record, flushing the eligible range once it holds `min_write_count` records.
    ///
    /// Callers check [`Self::can_write_record`] first.
    ///
    /// # Errors
    /// Returns an error if a triggered flush fails to write.
    ///
    /// # Panics
    /// Panics if a triggered flush would emit below the last written position.
    pub fn add_record(&mut self, record: RecordBuf) -> Result<()> {
        let coordinate = CoordinateKey::from_record(&record);
        let pos = coordinate.pos;
        let key = OrderedKey::new(coordinate, self.next_seq);
        self.next_seq += 1;

        self.records.insert(key, record);
        self.min_cached_position = Some(self.min_cached_position.map_or(pos, |m| m.min(pos)));
        if pos < self.upper_writable_position {
            self.eligible += 1;
        }
        self.stats.peak_cached = self.stats.peak_cached.max(self.records.len());

        self.flush_if_ready()?;
        Ok(())
    }

    /// Flushes the eligible range if it has reached `min_write_count`. Returns whether it did.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn flush_if_ready(&mut self) -> Result<bool> {
        if self.eligible < self.config.min_write_count {
            return Ok(false);
        }
        let Some(contig) = self.contig else {
            return Ok(false);
        };
        let rest = self.records.split_off(&OrderedKey::sentinel(contig, self.upper_writable_position));
        let ready = std::mem::replace(&mut self.records, rest);
        self.eligible = 0;
        self.emit(ready)?;
        Ok(true)
    }

    /// Emits everything cached, regardless of thresholds.
    ///
    /// Afterwards both thresholds are at least the last written position.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn flush(&mut self) -> Result<()> {
        let ready = std::mem::take(&mut self.records);
        self.eligible = 0;
        self.emit(ready)?;
        self.upper_writable_position = self.upper_writable_position.max(self.last_written_position);
        self.upper_bound_position = self.upper_bound_position.max(self.upper_writable_position);
        self.check_invariant();
        Ok(())
    }

    fn emit(&mut self, ready: BTreeMap<OrderedKey, RecordBuf>) -> Result<()> {
        let Some((first, _)) = ready.first_key_value() else {
            return Ok(());
        };
        let min_position = first.position();
        if min_position < self.last_written_position {
            panic!(
                "Ordering violation on contig {:?}: attempted to write a record at position {} \
                 below last written position {}",
                self.contig, min_position, self.last_written_position
            );
        }

        let count = ready.len();
        for (key, record) in ready {
            self.last_written_position = self.last_written_position.max(key.position());
            self.output.emit(record)?;
        }

        self.stats.records_written += count as u64;
        self.stats.flushes += 1;
        self.min_cached_position = self.records.first_key_value().map(|(k, _)| k.position());
        debug!(
            "Flushed {} records from position {} to {} ({} still cached)",
            count,
            min_position,
            self.last_written_position,
            self.records.len()
        );
        Ok(())
    }

    fn recount_eligible(&mut self) {
        self.eligible = match self.contig {
            Some(contig) => self
                .records
                .range(..OrderedKey::sentinel(contig, self.upper_writable_position))
                .count(),
            None => 0,
        };
    }

    fn check_invariant(&self) {
        assert!(
            self.last_written_position <= self.upper_writable_position
                && self.upper_writable_position <= self.upper_bound_position,
            "Window invariant violated: last written {} / writable {} / upper bound {}",
            self.last_written_position,
            self.upper_writable_position,
            self.upper_bound_position
        );
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contig(&self) -> Option<usize> {
        self.contig
    }

    #[must_use]
    pub fn last_written_position(&self) -> usize {
        self.last_written_position
    }

    #[must_use]
    pub fn upper_bound_position(&self) -> usize {
        self.upper_bound_position
    }

    #[must_use]
    pub fn upper_writable_position(&self) -> usize {
        self.upper_writable_position
    }

    #[must_use]
    pub fn min_cached_position(&self) -> Option<usize> {
        self.min_cached_position
    }

    #[must_use]
    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    /// Borrows the output.
    pub fn output_mut(&mut self) -> &mut W {
        &mut self.output
    }

    /// Consumes the cache and returns its output. Anything still cached is discarded, so
    /// call [`Self::flush`] first.
    pub fn into_output(self) -> W {
        debug_assert!(self.records.is_empty(), "cache dropped with {} records", self.records.len());
        self.output
    }
}
