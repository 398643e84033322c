//! Library-level tests driving the output coordinator from concurrent workers.
//!
//! Workers here call the sink API directly (region announcements, scan position,
//! duplicate groups) rather than going through the pipeline, and complete their
//! partitions in an order that differs from the genomic one.

use std::sync::Arc;

use fgstitch_lib::builder::{RecordBuilder, read_bam};
use fgstitch_lib::coordinator::{AssemblyStrategy, OutputConfig, OutputCoordinator};
use fgstitch_lib::partition::{Partition, PartitionPlan, PrimaryContigs};
use fgstitch_lib::record::{DuplicateGroup, DuplicateStatus, MI_TAG};
use fgstitch_lib::sink::RecordSink;
use fgstitch_lib::window::WindowConfig;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::alignment::record_buf::data::field::Value;
use proptest::prelude::*;
use rstest::rstest;
use tempfile::TempDir;

use crate::helpers::{
    assert_coordinate_sorted, assert_indexed, assert_same_records, create_test_header,
    jittered_records, mapped_read, unplaced_read,
};

/// Feeds records to a sink the way a worker scanning `partition` would.
fn feed(sink: &mut dyn RecordSink, partition: &Partition, records: Vec<RecordBuf>) {
    let mut current = None;
    for record in records {
        let placed = record.reference_sequence_id().zip(record.alignment_start());
        if let Some((contig, pos)) = placed.map(|(c, p)| (c, usize::from(p))) {
            if let Some(region) = partition.regions.iter().position(|r| r.contains(contig, pos)) {
                if current.is_none_or(|c| region > c) {
                    let r = &partition.regions[region];
                    sink.begin_region(r.contig, r.start).unwrap();
                    current = Some(region);
                }
                if current == Some(region) {
                    sink.advance(pos).unwrap();
                }
            }
        }
        sink.submit(record, DuplicateStatus::None).unwrap();
    }
}

struct Fixture {
    dir: TempDir,
    header: noodles::sam::Header,
    primary: Arc<PrimaryContigs>,
    plan: PartitionPlan,
}

impl Fixture {
    fn new() -> Self {
        let header = create_test_header();
        let primary = Arc::new(PrimaryContigs::from_header(&header, None).unwrap());
        let plan = PartitionPlan::plan(&header, &primary, 3).unwrap();
        Self { dir: TempDir::new().unwrap(), header, primary, plan }
    }

    fn config(&self, strategy: AssemblyStrategy) -> OutputConfig {
        OutputConfig {
            multi_file: true,
            strategy,
            threads: 2,
            window: WindowConfig { min_write_count: 3, ..WindowConfig::default() },
            ..OutputConfig::new(self.dir.path().join("out.bam"))
        }
    }

    fn coordinator(&self, strategy: AssemblyStrategy) -> OutputCoordinator {
        OutputCoordinator::new(
            self.config(strategy),
            self.header.clone(),
            Arc::clone(&self.primary),
            self.plan.len(),
        )
        .unwrap()
    }
}

/// One contig per partition with the test header, so partition `i` gets contig `i`.
fn partition_records(index: usize) -> Vec<RecordBuf> {
    let mut records = jittered_records(&format!("p{index}-"), index, 300, 150, 25);
    records.push(mapped_read(&format!("p{index}-late"), index, 10));
    records.push(mapped_read(&format!("p{index}-decoy"), 3, 100 + index));
    records.push(unplaced_read(&format!("p{index}-unplaced")));
    records
}

#[rstest]
#[case::stitch_reverse(AssemblyStrategy::Stitch, [2, 1, 0])]
#[case::stitch_middle_first(AssemblyStrategy::Stitch, [1, 2, 0])]
#[case::stitch_in_order(AssemblyStrategy::Stitch, [0, 1, 2])]
#[case::external_merge(AssemblyStrategy::ExternalMerge, [2, 0, 1])]
fn test_completion_order_does_not_change_output(
    #[case] strategy: AssemblyStrategy,
    #[case] order: [usize; 3],
) {
    let fixture = Fixture::new();
    assert_eq!(fixture.plan.len(), 3);
    let coordinator = fixture.coordinator(strategy);

    let mut expected = Vec::new();
    let mut sinks: Vec<_> = (0..3).map(|i| Some(coordinator.sink_for(i).unwrap())).collect();
    for index in order {
        let mut sink = sinks[index].take().unwrap();
        let records = partition_records(index);
        expected.extend(records.iter().cloned());
        feed(sink.as_mut(), &fixture.plan.partitions()[index], records);
        coordinator.complete_partition(index, sink).unwrap();
    }
    let summary = coordinator.finish().unwrap();

    let output = fixture.dir.path().join("out.bam");
    let (_, written) = read_bam(&output).unwrap();
    assert_same_records(&expected, &written);
    assert_coordinate_sorted(&written);
    assert_indexed(&output);
    assert!(summary.sorted);
    assert_eq!(summary.partitions, 3);
    assert_eq!(summary.counts.submitted(), expected.len() as u64);
    // Three late reads fell behind their window; three decoys and three unplaced reads
    // never entered one.
    assert_eq!(summary.counts.unsorted, 3);
    assert_eq!(summary.counts.deferred, 6);
}

#[test]
fn test_workers_on_threads() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator(AssemblyStrategy::Stitch);

    std::thread::scope(|scope| {
        for partition in fixture.plan.partitions() {
            let coordinator = &coordinator;
            scope.spawn(move || {
                let mut sink = coordinator.sink_for(partition.index).unwrap();
                feed(sink.as_mut(), partition, partition_records(partition.index));
                coordinator.complete_partition(partition.index, sink).unwrap();
            });
        }
    });
    coordinator.finish().unwrap();

    let (_, written) = read_bam(&fixture.dir.path().join("out.bam")).unwrap();
    let expected: Vec<_> = (0..3).flat_map(partition_records).collect();
    assert_same_records(&expected, &written);
    assert_coordinate_sorted(&written);
}

#[test]
fn test_duplicate_groups_are_stamped_and_counted() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator(AssemblyStrategy::Stitch);
    let partition = &fixture.plan.partitions()[0];

    let mut sink = coordinator.sink_for(0).unwrap();
    sink.begin_region(0, 1).unwrap();
    sink.advance(100).unwrap();
    let group = DuplicateGroup {
        group_id: Some("7".to_string()),
        consensus: Some(
            RecordBuilder::mapped_read()
                .name("consensus")
                .sequence("ACGTACGT")
                .alignment_start(100)
                .build(),
        ),
        members: vec![
            (mapped_read("keep", 0, 100), DuplicateStatus::Primary),
            (mapped_read("dup", 0, 101), DuplicateStatus::Duplicate),
        ],
    };
    sink.submit_duplicate_group(group).unwrap();
    let tail = (0..20).map(|i| mapped_read(&format!("tail-{i}"), 0, 1_000 + i * 200)).collect();
    feed(sink.as_mut(), partition, tail);
    coordinator.complete_partition(0, sink).unwrap();
    let summary = coordinator.finish().unwrap();

    assert_eq!(summary.counts.consensus, 1);
    assert_eq!(summary.counts.non_consensus, 22);

    let (_, written) = read_bam(&fixture.dir.path().join("out.bam")).unwrap();
    let grouped: Vec<_> = written
        .iter()
        .filter(|r| matches!(r.data().get(&MI_TAG), Some(Value::String(id)) if id == "7"))
        .collect();
    assert_eq!(grouped.len(), 3);
    let dup = written.iter().find(|r| r.name().is_some_and(|n| n == "dup")).unwrap();
    assert!(dup.flags().is_duplicate());
    let keep = written.iter().find(|r| r.name().is_some_and(|n| n == "keep")).unwrap();
    assert!(!keep.flags().is_duplicate());
}

#[test]
fn test_closed_sink_rejects_records() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator(AssemblyStrategy::ExternalMerge);
    let mut sink = coordinator.sink_for(1).unwrap();
    sink.close().unwrap();
    sink.close().unwrap();
    assert!(sink.submit(mapped_read("r", 1, 10), DuplicateStatus::None).is_err());
    coordinator.complete_partition(1, sink).unwrap();
    coordinator.finish().unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any bounded-lag input, with any window settings, yields a complete sorted file.
    #[test]
    fn prop_any_lag_yields_sorted_complete_output(
        offsets in prop::collection::vec(0usize..400, 1..120),
        read_pos_cache_buffer in 1usize..60,
        min_write_count in 1usize..8,
    ) {
        let fixture = Fixture::new();
        let config = OutputConfig {
            window: WindowConfig {
                position_buffer: 200,
                read_pos_cache_buffer,
                min_write_count,
            },
            ..fixture.config(AssemblyStrategy::Stitch)
        };
        let coordinator = OutputCoordinator::new(
            config,
            fixture.header.clone(),
            Arc::clone(&fixture.primary),
            fixture.plan.len(),
        )
        .unwrap();

        let records: Vec<_> = offsets
            .iter()
            .enumerate()
            .map(|(i, off)| mapped_read(&format!("r{i}"), 0, 1 + i * 50 + off))
            .collect();
        let mut sink = coordinator.sink_for(0).unwrap();
        feed(sink.as_mut(), &fixture.plan.partitions()[0], records.clone());
        coordinator.complete_partition(0, sink).unwrap();
        coordinator.finish().unwrap();

        let (_, written) = read_bam(&fixture.dir.path().join("out.bam")).unwrap();
        prop_assert_eq!(written.len(), records.len());
        assert_same_records(&records, &written);
        assert_coordinate_sorted(&written);
    }
}
