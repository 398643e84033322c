//! In-process sort, k-way merge and concatenation of BAM files.
//!
//! Used when no external tool is configured. Records are ordered by [`CoordinateKey`];
//! records with equal keys keep the order of their inputs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::info;
use noodles::sam::Header;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;
use rayon::prelude::*;

use crate::bam_io::{
    BamReader, append_bam, create_bam_reader, create_bam_writer, finish_bam_writer,
};
use crate::header::{SortOrder, with_sort_order};
use crate::keys::CoordinateKey;
use crate::logging::OperationTimer;

/// Sorts a BAM file in memory by coordinate. Returns the number of records written.
///
/// # Errors
/// Returns an error if the input cannot be read or the output cannot be written.
pub fn sort_bam(input: &Path, output: &Path, threads: usize) -> Result<u64> {
    let timer = OperationTimer::new("Sorting in memory");
    let (mut reader, header) = create_bam_reader(input, threads)?;

    let mut keyed: Vec<(CoordinateKey, RecordBuf)> = reader
        .record_bufs(&header)
        .map(|result| result.map(|record| (CoordinateKey::from_record(&record), record)))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to read records from {}", input.display()))?;

    // Stable, so equal keys keep their input order.
    keyed.par_sort_by(|a, b| a.0.cmp(&b.0));

    let output_header = with_sort_order(&header, SortOrder::Coordinate)?;
    let mut writer = create_bam_writer(output, &output_header, threads)?;
    for (_, record) in &keyed {
        writer
            .write_alignment_record(&output_header, record)
            .with_context(|| format!("Failed to write record to {}", output.display()))?;
    }
    finish_bam_writer(writer, output)?;

    let count = keyed.len() as u64;
    timer.log_completion(count);
    Ok(count)
}

struct HeapEntry {
    key: CoordinateKey,
    record: RecordBuf,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then_with(|| self.source.cmp(&other.source))
    }
}

struct MergeSource {
    path: PathBuf,
    reader: BamReader,
    header: Header,
}

impl MergeSource {
    fn next(&mut self) -> Result<Option<(CoordinateKey, RecordBuf)>> {
        let mut record = RecordBuf::default();
        let n = self
            .reader
            .read_record_buf(&self.header, &mut record)
            .with_context(|| format!("Failed to read record from {}", self.path.display()))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some((CoordinateKey::from_record(&record), record)))
    }
}

/// Merges coordinate-sorted BAMs into one sorted BAM. Returns the number of records.
///
/// The output header is `header` if given, otherwise the first input's header; either
/// way it is marked `SO:coordinate`. All inputs must share the same reference sequences.
///
/// # Errors
/// Returns an error if there are no inputs, the references differ, or any I/O fails.
pub fn merge_sorted_bams(
    inputs: &[PathBuf],
    output: &Path,
    header: Option<&Header>,
    threads: usize,
) -> Result<u64> {
    let timer = OperationTimer::new("Merging sorted files");
    let mut sources = open_sources(inputs)?;
    let base = match header {
        Some(h) => h.clone(),
        None => sources[0].header.clone(),
    };
    let output_header = with_sort_order(&base, SortOrder::Coordinate)?;

    let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::with_capacity(sources.len());
    for (source, reader) in sources.iter_mut().enumerate() {
        if let Some((key, record)) = reader.next()? {
            heap.push(Reverse(HeapEntry { key, record, source }));
        }
    }

    let mut writer = create_bam_writer(output, &output_header, threads)?;
    let mut merged = 0u64;
    while let Some(Reverse(entry)) = heap.pop() {
        writer
            .write_alignment_record(&output_header, &entry.record)
            .with_context(|| format!("Failed to write record to {}", output.display()))?;
        merged += 1;

        if let Some((key, record)) = sources[entry.source].next()? {
            heap.push(Reverse(HeapEntry { key, record, source: entry.source }));
        }
    }
    finish_bam_writer(writer, output)?;

    info!("Merged {} files into {}", inputs.len(), output.display());
    timer.log_completion(merged);
    Ok(merged)
}

/// Concatenates BAMs in the given order. Returns the number of records.
///
/// The output header is `header` if given, otherwise the first input's header.
///
/// # Errors
/// Returns an error if there are no inputs, the references differ, or any I/O fails.
pub fn concatenate_bams(
    inputs: &[PathBuf],
    output: &Path,
    header: Option<&Header>,
    threads: usize,
) -> Result<u64> {
    let sources = open_sources(inputs)?;
    let output_header = match header {
        Some(h) => h.clone(),
        None => sources[0].header.clone(),
    };
    drop(sources);

    let mut writer = create_bam_writer(output, &output_header, threads)?;
    let mut copied = 0u64;
    for input in inputs {
        copied += append_bam(input, &mut writer, &output_header, threads)?;
    }
    finish_bam_writer(writer, output)?;

    info!("Concatenated {} files ({} records) into {}", inputs.len(), copied, output.display());
    Ok(copied)
}

fn open_sources(inputs: &[PathBuf]) -> Result<Vec<MergeSource>> {
    if inputs.is_empty() {
        bail!("No input files to combine");
    }

    let mut sources = Vec::with_capacity(inputs.len());
    for path in inputs {
        let (reader, header) = create_bam_reader(path, 1)?;
        if let Some(first) = sources.first() {
            check_same_references(first, path, &header)?;
        }
        sources.push(MergeSource { path: path.clone(), reader, header });
    }
    Ok(sources)
}

fn check_same_references(first: &MergeSource, path: &Path, header: &Header) -> Result<()> {
    let expected: Vec<_> = first.header.reference_sequences().keys().collect();
    let actual: Vec<_> = header.reference_sequences().keys().collect();
    if expected != actual {
        bail!(
            "Reference sequences of {} do not match those of {}",
            path.display(),
            first.path.display()
        );
    }
    Ok(())
}
