//! Excluded-region handling across the scan and the deferred pass.

use std::sync::Arc;

use fgstitch_lib::bam_io::create_bam_reader;
use fgstitch_lib::builder::{RecordBuilder, read_bam};
use fgstitch_lib::coordinator::{OutputConfig, OutputCoordinator};
use fgstitch_lib::deferred::UnmapRegions;
use fgstitch_lib::partition::{PartitionPlan, PrimaryContigs};
use fgstitch_lib::pipeline::run_pipeline;
use noodles::sam::alignment::record_buf::RecordBuf;
use tempfile::TempDir;

use crate::helpers::{assert_coordinate_sorted, create_test_header, mapped_read, write_input};

fn paired(
    name: &str,
    contig: Option<usize>,
    pos: Option<usize>,
    mate: (usize, usize),
) -> RecordBuf {
    let mut builder = RecordBuilder::new()
        .name(name)
        .sequence("ACGTACGTAC")
        .paired(true)
        .mate_reference_sequence_id(mate.0)
        .mate_alignment_start(mate.1);
    builder = match (contig, pos) {
        (Some(contig), Some(pos)) => {
            builder.reference_sequence_id(contig).alignment_start(pos).mapping_quality(60)
        }
        _ => builder.unmapped(true),
    };
    builder.build()
}

fn names_without_reference(records: &[RecordBuf]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .filter(|r| r.reference_sequence_id().is_none())
        .filter_map(|r| r.name().map(ToString::to_string))
        .collect();
    names.sort();
    names
}

#[test]
fn test_regions_unmap_records_and_their_deferred_mates() {
    let dir = TempDir::new().unwrap();
    let header = create_test_header();

    let bed = dir.path().join("excluded.bed");
    std::fs::write(&bed, "track name=excluded\nchr1\t999\t2000\nchrNope\t1\t10\n").unwrap();
    let regions = UnmapRegions::from_bed(&bed, &header).unwrap();
    assert_eq!(regions.len(), 1);

    let mut records = vec![mapped_read("before", 0, 500)];
    records.push(mapped_read("inside", 0, 1_500));
    records.push(
        RecordBuilder::mapped_read()
            .name("inside-supplementary")
            .sequence("ACGTACGTAC")
            .alignment_start(1_600)
            .supplementary(true)
            .build(),
    );
    records.push(paired("mate-inside", Some(0), Some(3_000), (0, 1_500)));
    records.push(mapped_read("after", 0, 5_000));
    records.push(paired("decoy-mate-inside", Some(3), Some(100), (0, 1_200)));
    records.push(paired("decoy-mate-outside", Some(3), Some(200), (0, 4_000)));
    records.push(paired("unplaced-mate-inside", None, None, (0, 1_800)));
    records.push(mapped_read("chr2", 1, 700));
    let input = write_input(dir.path(), "input.bam", &header, &records);

    let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
    let plan = PartitionPlan::plan(&header, &primary, 2).unwrap();
    let config = OutputConfig {
        multi_file: true,
        unmap_regions: regions.clone(),
        ..OutputConfig::new(dir.path().join("out.bam"))
    };
    let coordinator = OutputCoordinator::new(config, header.clone(), primary, plan.len()).unwrap();
    let (mut reader, header) = create_bam_reader(&input, 1).unwrap();
    let routed = run_pipeline(&mut reader, &header, &plan, &coordinator, &regions, 8).unwrap();
    let summary = coordinator.finish().unwrap();

    assert_eq!(routed.records_read, 9);
    assert_eq!(routed.unmapped_by_policy, 1);
    assert_eq!(routed.dropped_by_policy, 1);
    assert_eq!(routed.mates_unmapped_by_policy, 1);
    let deferred = summary.deferred.unwrap();
    assert_eq!(deferred.unmapped, 2);
    assert_eq!(deferred.supplementary_dropped, 0);

    let (_, written) = read_bam(&dir.path().join("out.bam")).unwrap();
    assert_eq!(written.len(), 8);
    assert_coordinate_sorted(&written);
    assert_eq!(
        names_without_reference(&written),
        ["decoy-mate-inside", "inside", "unplaced-mate-inside"]
    );
    let kept = written.iter().find(|r| r.name().is_some_and(|n| n == "decoy-mate-outside"));
    assert_eq!(kept.and_then(RecordBuf::reference_sequence_id), Some(3));

    // The mapped mate of an excluded read stays in place but no longer points at it.
    let mate = written.iter().find(|r| r.name().is_some_and(|n| n == "mate-inside")).unwrap();
    assert!(!mate.flags().is_unmapped());
    assert!(mate.flags().is_mate_unmapped());
    assert_eq!(mate.reference_sequence_id(), Some(0));
    assert_eq!(mate.alignment_start().map(usize::from), Some(3_000));
    assert!(mate.mate_reference_sequence_id().is_none());
    assert!(mate.mate_alignment_start().is_none());
    assert_eq!(mate.template_length(), 0);
}

#[test]
fn test_empty_regions_change_nothing() {
    let dir = TempDir::new().unwrap();
    let header = create_test_header();
    let records = vec![mapped_read("a", 0, 1_500), paired("b", Some(3), Some(10), (0, 1_200))];
    let input = write_input(dir.path(), "input.bam", &header, &records);

    let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
    let plan = PartitionPlan::plan(&header, &primary, 1).unwrap();
    let config = OutputConfig { multi_file: true, ..OutputConfig::new(dir.path().join("out.bam")) };
    let coordinator = OutputCoordinator::new(config, header.clone(), primary, 1).unwrap();
    let (mut reader, header) = create_bam_reader(&input, 1).unwrap();
    let regions = UnmapRegions::new();
    run_pipeline(&mut reader, &header, &plan, &coordinator, &regions, 8).unwrap();
    coordinator.finish().unwrap();

    let (_, written) = read_bam(&dir.path().join("out.bam")).unwrap();
    assert!(names_without_reference(&written).is_empty());
}
