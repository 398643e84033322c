//! Drives a BAM through the output engine.
//!
//! A single scanner reads the input and routes each record to the worker that owns its
//! partition over a bounded channel. Every worker owns exactly one sink for its whole
//! life: it announces region starts and scan progress to the sink, submits records with
//! the status carried by their duplicate flag, and hands the sink back to the
//! coordinator as soon as its channel drains. Records without a partition go to the
//! last worker, whose sink forwards them to the deferred stream.

use std::any::Any;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use noodles::sam::Header;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::bam_io::BamReader;
use crate::coordinator::OutputCoordinator;
use crate::deferred::{UnmapAction, UnmapRegions, own_position_action};
use crate::logging::{OperationTimer, format_count};
use crate::partition::{Partition, PartitionPlan};
use crate::progress::ProgressTracker;
use crate::record::{
    DuplicateStatus, informative_position, mate_position, unmap_mate, unmap_record,
};
use crate::sink::RecordSink;

/// Records buffered per worker channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

/// Hands out one sink per partition and takes each back once its worker is done.
pub trait PartitionSinks: Sync {
    fn partition_count(&self) -> usize;

    /// # Errors
    /// Fails if the sink for `index` cannot be provided.
    fn sink_for(&self, index: usize) -> Result<Box<dyn RecordSink>>;

    /// # Errors
    /// Fails if the sink cannot be closed or its output cannot be queued for assembly.
    fn complete_partition(&self, index: usize, sink: Box<dyn RecordSink>) -> Result<()>;
}

impl PartitionSinks for OutputCoordinator {
    fn partition_count(&self) -> usize {
        OutputCoordinator::partition_count(self)
    }

    fn sink_for(&self, index: usize) -> Result<Box<dyn RecordSink>> {
        OutputCoordinator::sink_for(self, index)
    }

    fn complete_partition(&self, index: usize, sink: Box<dyn RecordSink>) -> Result<()> {
        OutputCoordinator::complete_partition(self, index, sink)
    }
}

/// Counts from one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub records_read: u64,
    /// Records routed to each partition's worker, by partition index.
    pub routed: Vec<u64>,
    /// Records without a partition (unplaced or non-primary).
    pub unpartitioned: u64,
    /// Records unmapped because they lie in an excluded region.
    pub unmapped_by_policy: u64,
    /// Supplementary records dropped because they lie in an excluded region.
    pub dropped_by_policy: u64,
    /// Partitioned records whose mate lies in an excluded region.
    pub mates_unmapped_by_policy: u64,
}

/// Reads every record from `reader` and writes it through the sinks `sinks` hands out.
///
/// `sinks` (normally an [`OutputCoordinator`]) must have one partition per entry in
/// `plan`. Call [`OutputCoordinator::finish`] afterwards to assemble the final file; skip
/// it when this returns an error.
///
/// # Errors
/// Returns an error if reading fails, a worker fails or panics, or a sink rejects a
/// record.
pub fn run_pipeline(
    reader: &mut BamReader,
    header: &Header,
    plan: &PartitionPlan,
    sinks: &dyn PartitionSinks,
    regions: &UnmapRegions,
    queue_capacity: usize,
) -> Result<PipelineSummary> {
    if plan.len() != sinks.partition_count() {
        return Err(anyhow!(
            "Partition plan has {} partitions but the coordinator expects {}",
            plan.len(),
            sinks.partition_count()
        ));
    }
    let timer = OperationTimer::new("Writing records");

    let summary = std::thread::scope(|scope| -> Result<PipelineSummary> {
        let mut senders = Vec::with_capacity(plan.len());
        let mut workers = Vec::with_capacity(plan.len());
        for partition in plan.partitions() {
            let (tx, rx) = crossbeam_channel::bounded(queue_capacity.max(1));
            let sink = sinks.sink_for(partition.index)?;
            senders.push(tx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("partition-{}", partition.index))
                    .spawn_scoped(scope, move || {
                        let sink = run_worker(partition, &rx, sink)?;
                        sinks.complete_partition(partition.index, sink)
                    })?,
            );
        }

        let scanned = scan(reader, header, plan, regions, &senders);
        drop(senders);

        // A worker failure explains a failed send in the scanner, so it is reported first.
        let mut worker_failure = None;
        for (index, worker) in workers.into_iter().enumerate() {
            let result = worker.join().unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                Err(anyhow!("Worker for partition {index} panicked: {message}"))
            });
            if let Err(e) = result {
                worker_failure.get_or_insert(e.context(format!("Partition {index} failed")));
            }
        }
        match worker_failure {
            Some(e) => Err(e),
            None => scanned,
        }
    })?;

    timer.log_completion(summary.records_read);
    info!(
        "Routed {} records to partitions and {} elsewhere; region policy unmapped {}, \
         dropped {}, cleared {} mates",
        format_count(summary.routed.iter().sum()),
        format_count(summary.unpartitioned),
        format_count(summary.unmapped_by_policy),
        format_count(summary.dropped_by_policy),
        format_count(summary.mates_unmapped_by_policy)
    );
    Ok(summary)
}

fn scan(
    reader: &mut BamReader,
    header: &Header,
    plan: &PartitionPlan,
    regions: &UnmapRegions,
    senders: &[Sender<RecordBuf>],
) -> Result<PipelineSummary> {
    let progress = ProgressTracker::new("Read");
    let mut summary = PipelineSummary { routed: vec![0; plan.len()], ..PipelineSummary::default() };
    let unpartitioned_target = plan.len() - 1;

    for result in reader.record_bufs(header) {
        let mut record = result.context("Failed to read input record")?;
        summary.records_read += 1;

        match own_position_action(&record, regions) {
            UnmapAction::Keep => {}
            UnmapAction::Unmap => {
                unmap_record(&mut record);
                summary.unmapped_by_policy += 1;
            }
            UnmapAction::Drop => {
                summary.dropped_by_policy += 1;
                continue;
            }
        }

        let position = informative_position(&record);
        let target = match position.and_then(|(contig, pos)| plan.partition_for(contig, pos)) {
            Some(index) => {
                // Placement-deferred records are left to the deferred pass.
                if !record.flags().is_unmapped()
                    && mate_position(&record).is_some_and(|(c, p)| regions.contains(c, p))
                {
                    unmap_mate(&mut record);
                    summary.mates_unmapped_by_policy += 1;
                }
                summary.routed[index] += 1;
                index
            }
            None => {
                summary.unpartitioned += 1;
                unpartitioned_target
            }
        };
        senders[target]
            .send(record)
            .map_err(|_| anyhow!("Worker for partition {target} stopped accepting records"))?;

        progress.record(1, || {
            let (contig, pos) = position?;
            let name = header.reference_sequences().get_index(contig)?.0;
            Some(format!("{name}:{}", format_count(pos as u64)))
        });
    }
    progress.log_final();
    Ok(summary)
}

/// Feeds one partition's records to its sink, tracking which region the scan is in.
fn run_worker(
    partition: &Partition,
    records: &Receiver<RecordBuf>,
    mut sink: Box<dyn RecordSink>,
) -> Result<Box<dyn RecordSink>> {
    let mut current_region: Option<usize> = None;
    let mut submitted = 0u64;

    for record in records {
        if let Some((contig, pos)) = informative_position(&record) {
            if let Some(region) = partition.regions.iter().position(|r| r.contains(contig, pos)) {
                // Regions are in genomic order; a record for an earlier region is left to
                // the window, which defers it.
                if current_region.is_none_or(|current| region > current) {
                    let r = &partition.regions[region];
                    sink.begin_region(r.contig, r.start)?;
                    current_region = Some(region);
                }
                if current_region == Some(region) {
                    sink.advance(pos)?;
                }
            }
        }
        let status = DuplicateStatus::from_flags(record.flags());
        sink.submit(record, status)?;
        submitted += 1;
    }

    debug!("Partition {} received {} records", partition.index, format_count(submitted));
    Ok(sink)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
