//! Input BAM generation for integration tests.
//!
//! Records are produced in "worker order": roughly increasing by position, with a bounded
//! backwards jitter, the way an upstream aligner or realigner hands them over.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use fgstitch_lib::builder::{RecordBuilder, header_with_contigs, write_bam};
use noodles::sam::Header;
use noodles::sam::alignment::record_buf::RecordBuf;

/// Contig length used by [`create_test_header`].
pub const CONTIG_LEN: usize = 50_000;

/// Three primary-looking contigs plus one decoy.
#[must_use]
pub fn create_test_header() -> Header {
    header_with_contigs(&[
        ("chr1", CONTIG_LEN),
        ("chr2", CONTIG_LEN),
        ("chr3", CONTIG_LEN),
        ("chrUn_decoy", 2_000),
    ])
}

/// A 10-base forward read.
#[must_use]
pub fn mapped_read(name: &str, contig: usize, pos: usize) -> RecordBuf {
    RecordBuilder::mapped_read()
        .name(name)
        .sequence("ACGTACGTAC")
        .reference_sequence_id(contig)
        .alignment_start(pos)
        .build()
}

/// A read with no placement at all.
#[must_use]
pub fn unplaced_read(name: &str) -> RecordBuf {
    RecordBuilder::new().name(name).sequence("ACGTACGTAC").unmapped(true).build()
}

/// Records spaced `spacing` bases apart on `contig`, each shifted back by up to
/// `max_jitter` bases so the stream is only approximately sorted.
#[must_use]
pub fn jittered_records(
    prefix: &str,
    contig: usize,
    count: usize,
    spacing: usize,
    max_jitter: usize,
) -> Vec<RecordBuf> {
    (0..count)
        .map(|i| {
            let base = max_jitter + 1 + i * spacing;
            let jitter = if max_jitter == 0 { 0 } else { (i * 37 + 11) % (max_jitter + 1) };
            let pos = (base - jitter).min(CONTIG_LEN - 10);
            mapped_read(&format!("{prefix}{i}"), contig, pos)
        })
        .collect()
}

/// A mix of jittered reads on every primary contig, a few far-out-of-order reads, decoy
/// reads and unplaced reads.
#[must_use]
pub fn mixed_records() -> Vec<RecordBuf> {
    let mut records = Vec::new();
    for contig in 0..3 {
        records.extend(jittered_records(&format!("c{contig}-"), contig, 400, 110, 20));
        records.push(mapped_read(&format!("late{contig}"), contig, 50));
    }
    records.push(mapped_read("decoy1", 3, 100));
    records.push(mapped_read("decoy2", 3, 40));
    records.push(unplaced_read("unplaced1"));
    records.push(unplaced_read("unplaced2"));
    records
}

/// Writes `records` in the given order to `<dir>/<name>`.
///
/// # Panics
///
/// Panics if the file cannot be written.
pub fn write_input(dir: &Path, name: &str, header: &Header, records: &[RecordBuf]) -> PathBuf {
    let path = dir.join(name);
    write_bam(&path, header, records).expect("Failed to write input BAM");
    path
}
