//! Second pass over records that bypassed position partitioning.
//!
//! The deferred stream is written unsorted during the main pass. Once every partition
//! sink has closed it is sorted, re-scanned to propagate unmapping from excluded regions
//! onto mates, and written as a coordinate-sorted file ready to merge into the final
//! output.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::AHashMap;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use noodles::sam::Header;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::bam_io::{create_bam_reader, create_bam_writer, finish_bam_writer};
use crate::errors::StitchError;
use crate::header::{SortOrder, with_sort_order};
use crate::logging::OperationTimer;
use crate::merge::sort_bam;
use crate::partition::PrimaryContigs;
use crate::record::{informative_position, is_fully_unmapped, mate_position, unmap_record};
use crate::tool::{AlignmentTool, sort_with_retry};

/// Genomic regions whose alignments are unmapped by policy.
///
/// Intervals are 1-based and inclusive, kept sorted and merged per contig.
#[derive(Debug, Clone, Default)]
pub struct UnmapRegions {
    by_contig: AHashMap<usize, Vec<(usize, usize)>>,
}

impl UnmapRegions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an interval, merging it with any it overlaps or touches.
    pub fn insert(&mut self, contig: usize, start: usize, end: usize) {
        if end < start {
            return;
        }
        let intervals = self.by_contig.entry(contig).or_default();
        intervals.push((start, end));
        intervals.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(intervals.len());
        for &(s, e) in intervals.iter() {
            match merged.last_mut() {
                Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        *intervals = merged;
    }

    /// Loads regions from a BED file, resolving contig names against `header`.
    ///
    /// BED coordinates are 0-based half-open. Comment, `track` and `browser` lines are
    /// skipped, as are contigs absent from the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line is malformed.
    pub fn from_bed(path: &Path, header: &Header) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open unmap regions: {}", path.display()))?;
        let references = header.reference_sequences();
        let mut regions = Self::new();
        let mut skipped = 0usize;

        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            let line = line.trim_end();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }

            let malformed = |reason: &str| StitchError::InvalidFileFormat {
                file_type: "BED".to_string(),
                path: path.display().to_string(),
                reason: format!("line {}: {reason}", line_number + 1),
            };

            let mut fields = line.split('\t');
            let (Some(name), Some(start), Some(end)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(malformed("expected at least three tab-separated fields").into());
            };
            let start: usize = start.parse().map_err(|_| malformed("invalid start"))?;
            let end: usize = end.parse().map_err(|_| malformed("invalid end"))?;
            if end < start {
                return Err(malformed("end is before start").into());
            }

            match references.get_index_of(name.as_bytes()) {
                Some(contig) => regions.insert(contig, start + 1, end),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("Skipped {skipped} unmap regions on contigs missing from the header");
        }
        info!("Loaded {} unmap regions from {}", regions.len(), path.display());
        Ok(regions)
    }

    /// True if `(contig, pos)` falls inside an excluded region.
    #[must_use]
    pub fn contains(&self, contig: usize, pos: usize) -> bool {
        let Some(intervals) = self.by_contig.get(&contig) else {
            return false;
        };
        let idx = intervals.partition_point(|&(start, _)| start <= pos);
        idx > 0 && pos <= intervals[idx - 1].1
    }

    /// Number of merged intervals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_contig.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_contig.values().all(Vec::is_empty)
    }
}

/// What happens to a record under the unmap policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapAction {
    Keep,
    Unmap,
    Drop,
}

impl UnmapAction {
    fn for_record(record: &RecordBuf) -> Self {
        if record.flags().is_supplementary() { Self::Drop } else { Self::Unmap }
    }
}

/// Decides the action for a record whose own position may lie in an excluded region.
#[must_use]
pub fn own_position_action(record: &RecordBuf, regions: &UnmapRegions) -> UnmapAction {
    match informative_position(record) {
        Some((contig, pos)) if regions.contains(contig, pos) => UnmapAction::for_record(record),
        _ => UnmapAction::Keep,
    }
}

/// Decides the action for a deferred record whose mate may lie in an excluded region.
///
/// Only placement-deferred records are considered: fully unmapped, flagged unmapped, or
/// on a non-primary contig.
#[must_use]
pub fn mate_action(
    record: &RecordBuf,
    regions: &UnmapRegions,
    primary: &PrimaryContigs,
) -> UnmapAction {
    let placement_deferred = is_fully_unmapped(record)
        || record.flags().is_unmapped()
        || informative_position(record).is_some_and(|(contig, _)| !primary.is_primary(contig));
    if !placement_deferred {
        return UnmapAction::Keep;
    }
    match mate_position(record) {
        Some((contig, pos)) if regions.contains(contig, pos) => UnmapAction::for_record(record),
        _ => UnmapAction::Keep,
    }
}

/// Counts from one deferred pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeferredSummary {
    pub records_read: u64,
    pub unmapped: u64,
    pub supplementary_dropped: u64,
    pub records_written: u64,
}

/// Sorts the deferred stream at `input` and writes the propagated result to `output`.
///
/// The sort runs through `tool` when one is configured (with one single-threaded retry),
/// otherwise in memory. The sorted copy is written to `scratch` and removed afterwards.
/// Records unmapped by propagation are written after all other records.
///
/// # Errors
/// Returns an error if sorting fails or any file cannot be read or written.
pub fn process_deferred(
    input: &Path,
    output: &Path,
    scratch: &Path,
    tool: Option<&dyn AlignmentTool>,
    regions: &UnmapRegions,
    primary: &PrimaryContigs,
    threads: usize,
) -> Result<DeferredSummary> {
    let timer = OperationTimer::new("Processing deferred records");
    let sorted = scratch.join("deferred.sorted.bam");
    match tool {
        Some(tool) => sort_with_retry(tool, input, &sorted, threads)?,
        None => {
            sort_bam(input, &sorted, threads)?;
        }
    }

    let (mut reader, header) = create_bam_reader(&sorted, threads)?;
    let output_header = with_sort_order(&header, SortOrder::Coordinate)?;
    let mut writer = create_bam_writer(output, &output_header, threads)?;

    let mut summary = DeferredSummary::default();
    let mut newly_unmapped = Vec::new();
    for result in reader.record_bufs(&header) {
        let mut record =
            result.with_context(|| format!("Failed to read record from {}", sorted.display()))?;
        summary.records_read += 1;

        match mate_action(&record, regions, primary) {
            UnmapAction::Keep => {
                writer
                    .write_alignment_record(&output_header, &record)
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                summary.records_written += 1;
            }
            UnmapAction::Unmap => {
                unmap_record(&mut record);
                summary.unmapped += 1;
                newly_unmapped.push(record);
            }
            UnmapAction::Drop => summary.supplementary_dropped += 1,
        }
    }

    debug!("Appending {} records unmapped with their mates", newly_unmapped.len());
    for record in &newly_unmapped {
        writer
            .write_alignment_record(&output_header, record)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        summary.records_written += 1;
    }
    finish_bam_writer(writer, output)?;

    std::fs::remove_file(&sorted)
        .with_context(|| format!("Failed to remove {}", sorted.display()))?;
    timer.log_completion(summary.records_read);
    Ok(summary)
}
