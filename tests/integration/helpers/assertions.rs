//! Custom assertion helpers for integration tests.
//!
//! These helpers check the properties every assembled output must have: coordinate
//! order, a complete record set and an index when one was promised.

#![allow(dead_code)]

use std::path::Path;

use fgstitch_lib::bam_io::bai_path;
use fgstitch_lib::keys::CoordinateKey;
use noodles::sam::alignment::record_buf::RecordBuf;

/// Asserts that records are non-decreasing by (reference, position), with records
/// lacking a reference last.
///
/// # Panics
///
/// Panics at the first pair out of order.
pub fn assert_coordinate_sorted(records: &[RecordBuf]) {
    let keys: Vec<(usize, usize)> = records
        .iter()
        .map(CoordinateKey::from_record)
        .map(|k| (k.tid, k.pos))
        .collect();
    for (i, pair) in keys.windows(2).enumerate() {
        assert!(
            pair[0] <= pair[1],
            "Records {} and {} out of order: {:?} > {:?} ({:?}, {:?})",
            i,
            i + 1,
            pair[0],
            pair[1],
            records[i].name(),
            records[i + 1].name()
        );
    }
}

/// Sorted read names, for comparing record sets regardless of order.
#[must_use]
pub fn sorted_names(records: &[RecordBuf]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .map(|r| r.name().map(ToString::to_string).unwrap_or_default())
        .collect();
    names.sort();
    names
}

/// Asserts that both slices hold the same records by name, in any order.
///
/// # Panics
///
/// Panics if the name multisets differ.
pub fn assert_same_records(expected: &[RecordBuf], actual: &[RecordBuf]) {
    assert_eq!(expected.len(), actual.len(), "Record count mismatch");
    assert_eq!(sorted_names(expected), sorted_names(actual), "Record names differ");
}

/// Asserts that `<bam>.bai` exists and is non-empty.
///
/// # Panics
///
/// Panics if the index is missing or empty.
pub fn assert_indexed(bam: &Path) {
    let index = bai_path(bam);
    let len = std::fs::metadata(&index)
        .unwrap_or_else(|e| panic!("Missing index {}: {e}", index.display()))
        .len();
    assert!(len > 0, "Index {} is empty", index.display());
}

/// Asserts that no interim files were left next to `output`.
///
/// # Panics
///
/// Panics if the directory holds anything other than the input, output and index.
pub fn assert_no_interim_files(dir: &Path, keep: &[&str]) {
    let leftovers: Vec<String> = std::fs::read_dir(dir)
        .expect("Failed to list directory")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !keep.contains(&name.as_str()))
        .collect();
    assert!(leftovers.is_empty(), "Unexpected interim files: {leftovers:?}");
}
