//! Error path integration tests.
//!
//! These tests verify that invalid configuration, missing files and misuse of the sink
//! API fail with the expected structured errors.

use std::sync::Arc;

use fgstitch_lib::StitchError;
use fgstitch_lib::coordinator::{AssemblyStrategy, OutputConfig, OutputCoordinator};
use fgstitch_lib::deferred::UnmapRegions;
use fgstitch_lib::merge::merge_sorted_bams;
use fgstitch_lib::partition::{PartitionPlan, PrimaryContigs};
use fgstitch_lib::record::DuplicateStatus;
use fgstitch_lib::window::WindowConfig;
use tempfile::TempDir;

use crate::helpers::{create_test_header, mapped_read};

// ==================== Configuration ====================

#[test]
fn test_unknown_primary_contig() {
    let header = create_test_header();
    let names = ["chr1".to_string(), "chrZ".to_string()];
    let err = PrimaryContigs::from_header(&header, Some(&names[..])).unwrap_err();
    assert!(matches!(err, StitchError::ReferenceNotFound { ref ref_name } if ref_name == "chrZ"));
}

#[test]
fn test_zero_partitions() {
    let header = create_test_header();
    let primary = PrimaryContigs::all(&header);
    let err = PartitionPlan::plan(&header, &primary, 0).unwrap_err();
    assert!(matches!(
        err,
        StitchError::InvalidParameter { ref parameter, .. } if parameter == "partitions"
    ));
}

#[test]
fn test_invalid_window_rejected_by_coordinator() {
    let dir = TempDir::new().unwrap();
    let header = create_test_header();
    let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
    let config = OutputConfig {
        window: WindowConfig {
            position_buffer: 20,
            read_pos_cache_buffer: 30,
            min_write_count: 1,
        },
        ..OutputConfig::new(dir.path().join("out.bam"))
    };
    let err = OutputCoordinator::new(config, header, primary, 2).err().unwrap();
    assert!(err.to_string().contains("read-pos-cache-buffer"));
    assert!(!dir.path().join("out.bam").exists());
}

#[test]
fn test_malformed_bed() {
    let dir = TempDir::new().unwrap();
    let bed = dir.path().join("bad.bed");
    std::fs::write(&bed, "chr1\t100\t200\nchr1\tnot-a-number\t300\n").unwrap();
    let err = UnmapRegions::from_bed(&bed, &create_test_header()).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));
}

// ==================== Sinks ====================

#[test]
fn test_sink_cannot_be_taken_twice() {
    let dir = TempDir::new().unwrap();
    let header = create_test_header();
    let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
    let config = OutputConfig {
        multi_file: true,
        strategy: AssemblyStrategy::ExternalMerge,
        ..OutputConfig::new(dir.path().join("out.bam"))
    };
    let coordinator = OutputCoordinator::new(config, header, primary, 2).unwrap();

    let sink = coordinator.sink_for(0).unwrap();
    assert!(coordinator.sink_for(0).is_err());
    assert!(coordinator.sink_for(2).is_err());
    coordinator.complete_partition(0, sink).unwrap();
    coordinator.finish().unwrap();
}

#[test]
fn test_submit_after_close_is_sink_closed() {
    let dir = TempDir::new().unwrap();
    let header = create_test_header();
    let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
    let coordinator =
        OutputCoordinator::new(OutputConfig::new(dir.path().join("out.bam")), header, primary, 1)
            .unwrap();

    let mut sink = coordinator.sink_for(0).unwrap();
    sink.close().unwrap();
    let err = sink.submit(mapped_read("r", 0, 10), DuplicateStatus::None).unwrap_err();
    assert!(matches!(err.downcast_ref::<StitchError>(), Some(StitchError::SinkClosed { .. })));
    coordinator.complete_partition(0, sink).unwrap();
    coordinator.finish().unwrap();
}

// ==================== Files ====================

#[test]
fn test_merge_missing_input() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.bam");
    let result = merge_sorted_bams(&[missing], &dir.path().join("out.bam"), None, 1);
    assert!(result.is_err());
}
