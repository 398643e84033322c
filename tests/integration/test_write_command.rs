//! End-to-end tests for the `write` and `index` commands through the binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use fgstitch_lib::bam_io::bai_path;
use fgstitch_lib::builder::read_bam;
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::{
    assert_coordinate_sorted, assert_indexed, assert_no_interim_files, assert_same_records,
    create_test_header, mixed_records, write_input,
};

fn fgstitch_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fgstitch"))
}

fn samtools_available() -> bool {
    Command::new("samtools").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
}

fn run_write(input: &Path, output: &Path, extra: &[&str]) -> Output {
    Command::new(fgstitch_binary_path())
        .arg("write")
        .arg("-i")
        .arg(input)
        .arg("-o")
        .arg(output)
        .args(extra)
        .output()
        .expect("Failed to run fgstitch write")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "fgstitch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[rstest]
#[case::stitch_one(&["--multi-file", "--partitions", "1"])]
#[case::stitch_many(&["--multi-file", "--partitions", "5", "--threads", "2"])]
#[case::external_merge(&["--multi-file", "--partitions", "3", "--strategy", "external-merge"])]
#[case::small_window(&[
    "--multi-file",
    "--partitions",
    "4",
    "--position-buffer",
    "60",
    "--read-pos-cache-buffer",
    "5",
    "--min-write-count",
    "1",
])]
fn test_write_partitioned_produces_sorted_indexed_output(#[case] extra: &[&str]) {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records = mixed_records();
    let input = write_input(temp_dir.path(), "input.bam", &header, &records);
    let output = temp_dir.path().join("output.bam");

    assert_success(&run_write(&input, &output, extra));

    let (out_header, written) = read_bam(&output).unwrap();
    assert_same_records(&records, &written);
    assert_coordinate_sorted(&written);
    assert_indexed(&output);
    assert_eq!(out_header.reference_sequences().len(), header.reference_sequences().len());
    assert!(out_header.programs().as_ref().contains_key(&b"fgstitch"[..]));
    assert_no_interim_files(temp_dir.path(), &["input.bam", "output.bam", "output.bam.bai"]);
}

#[test]
fn test_write_shared_without_tool_keeps_every_record() {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records = mixed_records();
    let input = write_input(temp_dir.path(), "input.bam", &header, &records);
    let output = temp_dir.path().join("output.bam");

    assert_success(&run_write(&input, &output, &["--partitions", "3", "--threads", "2"]));

    let (_, written) = read_bam(&output).unwrap();
    assert_same_records(&records, &written);
    assert!(!bai_path(&output).exists(), "unsorted output must not be indexed");
}

#[test]
#[ignore = "requires samtools"]
fn test_write_shared_with_samtools_sorts_and_indexes() {
    if !samtools_available() {
        eprintln!("Skipping: samtools not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records = mixed_records();
    let input = write_input(temp_dir.path(), "input.bam", &header, &records);
    let output = temp_dir.path().join("output.bam");

    assert_success(&run_write(&input, &output, &["--partitions", "3", "--samtools", "samtools"]));

    let (_, written) = read_bam(&output).unwrap();
    assert_same_records(&records, &written);
    assert_coordinate_sorted(&written);
    assert_indexed(&output);
}

#[test]
fn test_write_restricted_contigs_defers_the_rest() {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records = mixed_records();
    let input = write_input(temp_dir.path(), "input.bam", &header, &records);
    let output = temp_dir.path().join("output.bam");

    let extra = ["--multi-file", "--partitions", "2", "--contigs", "chr1,chr2"];
    assert_success(&run_write(&input, &output, &extra));

    let (_, written) = read_bam(&output).unwrap();
    assert_same_records(&records, &written);
    assert_coordinate_sorted(&written);
}

#[test]
fn test_write_keep_interim_retains_directory() {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let input = write_input(temp_dir.path(), "input.bam", &header, &mixed_records());
    let output = temp_dir.path().join("output.bam");

    let extra = ["--multi-file", "--partitions", "3", "--strategy", "external-merge"];
    assert_success(&run_write(&input, &output, &[&extra[..], &["--keep-interim"]].concat()));

    let interim = temp_dir.path().join("output.bam.interim");
    assert!(interim.is_dir());
    assert!(interim.join("deferred.bam").exists());
    assert_indexed(&output);
}

#[test]
fn test_write_no_output_writes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let input = write_input(temp_dir.path(), "input.bam", &header, &mixed_records());
    let output = temp_dir.path().join("output.bam");

    assert_success(&run_write(&input, &output, &["--multi-file", "--no-output"]));
    assert!(!output.exists());
    assert_no_interim_files(temp_dir.path(), &["input.bam"]);
}

#[test]
fn test_write_remove_duplicates() {
    use fgstitch_lib::builder::RecordBuilder;

    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records: Vec<_> = (0..20)
        .map(|i| {
            RecordBuilder::mapped_read()
                .name(&format!("r{i}"))
                .sequence("ACGTACGTAC")
                .alignment_start(100 + i * 50)
                .duplicate(i % 4 == 0)
                .build()
        })
        .collect();
    let input = write_input(temp_dir.path(), "input.bam", &header, &records);
    let output = temp_dir.path().join("output.bam");

    assert_success(&run_write(&input, &output, &["--multi-file", "--remove-duplicates"]));

    let (_, written) = read_bam(&output).unwrap();
    assert_eq!(written.len(), 15);
    assert!(written.iter().all(|r| !r.flags().is_duplicate()));
}

#[test]
fn test_index_command() {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let input = write_input(temp_dir.path(), "input.bam", &header, &mixed_records());
    let output = temp_dir.path().join("output.bam");
    assert_success(&run_write(&input, &output, &["--multi-file"]));

    std::fs::remove_file(bai_path(&output)).unwrap();
    let result = Command::new(fgstitch_binary_path())
        .args(["index", "-i"])
        .arg(&output)
        .output()
        .unwrap();
    assert_success(&result);
    assert_indexed(&output);
}

#[rstest]
#[case::zero_partitions(&["--partitions", "0"])]
#[case::bad_window(&["--position-buffer", "10", "--read-pos-cache-buffer", "10"])]
#[case::unknown_contig(&["--contigs", "chrNope"])]
#[case::missing_bed(&["--unmap-regions", "/nonexistent/regions.bed"])]
fn test_write_rejects_bad_arguments(#[case] extra: &[&str]) {
    let temp_dir = TempDir::new().unwrap();
    let header = create_test_header();
    let input = write_input(temp_dir.path(), "input.bam", &header, &mixed_records());
    let output = temp_dir.path().join("output.bam");

    let result = run_write(&input, &output, extra);
    assert!(!result.status.success());
    assert!(!output.exists());
}
