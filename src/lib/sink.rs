//! Record sinks.
//!
//! A sink accepts records with a decided duplicate status and routes them to an output:
//!
//! - [`SynchronizedSink`]: one physical BAM shared by every worker through
//!   [`SharedSinkHandle`]s. Each write takes a lock; the file is sorted later.
//! - [`PartitionSink`]: owned by a single worker; records pass through a
//!   [`PositionWindowCache`] so the partition file comes out coordinate sorted.
//! - [`NoOpSink`]: counts records and discards them.
//!
//! Records that cannot be placed by position (no position, or a non-primary contig) go
//! to the shared [`DeferredStream`], as do records a partition window rejects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use noodles::sam::Header;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record_buf::RecordBuf;

use crate::bam_io::{BamWriter, SharedBamWriter, create_bam_writer, finish_bam_writer};
use crate::errors::StitchError;
use crate::partition::PrimaryContigs;
use crate::record::{
    DuplicateGroup, DuplicateStatus, RecordOrigin, apply_status, informative_position,
    set_group_id,
};
use crate::window::{PositionWindowCache, WindowConfig, WindowOutput, WindowStats};

/// Snapshot of a sink's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    /// Input alignments submitted (including dropped duplicates).
    pub non_consensus: u64,
    /// Consensus records submitted.
    pub consensus: u64,
    /// Records a partition window rejected and wrote to the deferred stream instead.
    pub unsorted: u64,
    /// Records without a usable position sent to the deferred stream.
    pub deferred: u64,
    /// Duplicates counted but not written.
    pub dropped_duplicates: u64,
}

impl WriteCounts {
    /// Total records submitted.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.non_consensus + self.consensus
    }

    /// Records that reached some output.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.submitted() - self.dropped_duplicates
    }
}

impl std::ops::AddAssign for WriteCounts {
    fn add_assign(&mut self, other: Self) {
        self.non_consensus += other.non_consensus;
        self.consensus += other.consensus;
        self.unsorted += other.unsorted;
        self.deferred += other.deferred;
        self.dropped_duplicates += other.dropped_duplicates;
    }
}

/// Atomic counters owned by a sink; [`SinkCounters::snapshot`] reads them.
#[derive(Debug, Default)]
pub struct SinkCounters {
    non_consensus: AtomicU64,
    consensus: AtomicU64,
    unsorted: AtomicU64,
    deferred: AtomicU64,
    dropped_duplicates: AtomicU64,
}

impl SinkCounters {
    fn count_submitted(&self, origin: RecordOrigin) {
        match origin {
            RecordOrigin::Alignment => self.non_consensus.fetch_add(1, Ordering::Relaxed),
            RecordOrigin::Consensus => self.consensus.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn count_dropped(&self) {
        self.dropped_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn count_unsorted(&self) {
        self.unsorted.fetch_add(1, Ordering::Relaxed);
    }

    fn count_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> WriteCounts {
        WriteCounts {
            non_consensus: self.non_consensus.load(Ordering::Relaxed),
            consensus: self.consensus.load(Ordering::Relaxed),
            unsorted: self.unsorted.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped_duplicates: self.dropped_duplicates.load(Ordering::Relaxed),
        }
    }
}

/// Output of a closed partition sink, handed to final assembly.
pub struct PartitionOutput {
    /// Partition index.
    pub index: usize,
    /// Path of the partition's BAM.
    pub path: PathBuf,
    /// The still-open writer, when the partition's file is the final output.
    pub writer: Option<BamWriter>,
    /// Records written to the partition file.
    pub records: u64,
}

impl std::fmt::Debug for PartitionOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionOutput")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .field("records", &self.records)
            .finish()
    }
}

/// The shared stream of records that bypass position partitioning.
#[derive(Clone)]
pub struct DeferredStream {
    writer: Arc<SharedBamWriter>,
    primary: Arc<PrimaryContigs>,
}

impl DeferredStream {
    /// Creates the deferred BAM at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create(
        path: &Path,
        header: &Header,
        primary: Arc<PrimaryContigs>,
        threads: usize,
    ) -> Result<Self> {
        let writer = SharedBamWriter::create(path, header, threads, "deferred")?;
        Ok(Self { writer: Arc::new(writer), primary })
    }

    /// True if the record has no position or sits on a non-primary contig.
    #[must_use]
    pub fn should_defer(&self, record: &RecordBuf) -> bool {
        match informative_position(record) {
            Some((contig, _)) => !self.primary.is_primary(contig),
            None => true,
        }
    }

    /// Writes one record.
    ///
    /// # Errors
    /// Returns an error if the stream is closed or the write fails.
    pub fn write(&self, record: &RecordBuf) -> Result<()> {
        self.writer.write(record)
    }

    /// Closes the stream. Returns `false` if it was already closed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be finished.
    pub fn close(&self) -> Result<bool> {
        self.writer.close()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.writer.records_written()
    }
}

/// Accepts decided records and routes them to an output.
///
/// Implementations are selected by topology; callers only see this trait.
pub trait RecordSink: Send {
    /// Submits an input alignment with its decided status.
    ///
    /// # Errors
    /// Fails if the sink is closed or the write fails.
    fn submit(&mut self, record: RecordBuf, status: DuplicateStatus) -> Result<()> {
        self.submit_as(record, status, RecordOrigin::Alignment)
    }

    /// Submits a record, counting it under `origin`.
    ///
    /// Duplicates are flagged, or counted and dropped when duplicate removal is enabled.
    ///
    /// # Errors
    /// Fails if the sink is closed or the write fails.
    fn submit_as(
        &mut self,
        record: RecordBuf,
        status: DuplicateStatus,
        origin: RecordOrigin,
    ) -> Result<()>;

    /// Submits a duplicate group: its consensus record (if any) and then each member.
    ///
    /// The group identifier, when present, is stamped into every record's `MI` tag.
    ///
    /// # Errors
    /// Fails on the first record that cannot be submitted.
    fn submit_duplicate_group(&mut self, group: DuplicateGroup) -> Result<()> {
        let DuplicateGroup { group_id, consensus, members } = group;

        if let Some(mut consensus) = consensus {
            if let Some(id) = group_id.as_deref() {
                set_group_id(&mut consensus, id);
            }
            self.submit_as(consensus, DuplicateStatus::Primary, RecordOrigin::Consensus)?;
        }
        for (mut record, status) in members {
            if let Some(id) = group_id.as_deref() {
                set_group_id(&mut record, id);
            }
            self.submit(record, status)?;
        }
        Ok(())
    }

    /// Announces that the worker starts scanning a region at `start` on `contig`.
    ///
    /// # Errors
    /// Fails if buffered records cannot be written.
    fn begin_region(&mut self, _contig: usize, _start: usize) -> Result<()> {
        Ok(())
    }

    /// Announces that the worker's scan has reached `position` on the current contig.
    ///
    /// # Errors
    /// Fails if buffered records cannot be written.
    fn advance(&mut self, _position: usize) -> Result<()> {
        Ok(())
    }

    /// Flushes buffered records and releases the output. A second call does nothing.
    ///
    /// # Errors
    /// Fails if the output cannot be finished.
    fn close(&mut self) -> Result<()>;

    /// Current counter values.
    fn counts(&self) -> WriteCounts;

    /// Partition output produced by [`RecordSink::close`], if this sink has one.
    fn take_partition_output(&mut self) -> Option<PartitionOutput> {
        None
    }
}

/// Drops every record, keeping counts.
#[derive(Debug, Default)]
pub struct NoOpSink {
    counters: SinkCounters,
    drop_duplicates: bool,
    closed: bool,
}

impl NoOpSink {
    #[must_use]
    pub fn new(drop_duplicates: bool) -> Self {
        Self { counters: SinkCounters::default(), drop_duplicates, closed: false }
    }
}

impl RecordSink for NoOpSink {
    fn submit_as(
        &mut self,
        mut record: RecordBuf,
        status: DuplicateStatus,
        origin: RecordOrigin,
    ) -> Result<()> {
        if self.closed {
            return Err(StitchError::SinkClosed { sink: "no-op" }.into());
        }
        self.counters.count_submitted(origin);
        if !apply_status(&mut record, status, self.drop_duplicates) {
            self.counters.count_dropped();
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn counts(&self) -> WriteCounts {
        self.counters.snapshot()
    }
}

/// One physical output shared by all workers; each write takes the writer's lock.
pub struct SynchronizedSink {
    writer: SharedBamWriter,
    deferred: DeferredStream,
    counters: SinkCounters,
    drop_duplicates: bool,
}

impl SynchronizedSink {
    /// Creates the shared output file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create(
        path: &Path,
        header: &Header,
        deferred: DeferredStream,
        drop_duplicates: bool,
        threads: usize,
    ) -> Result<Arc<Self>> {
        let writer = SharedBamWriter::create(path, header, threads, "shared")?;
        Ok(Arc::new(Self { writer, deferred, counters: SinkCounters::default(), drop_duplicates }))
    }

    fn submit_shared(
        &self,
        mut record: RecordBuf,
        status: DuplicateStatus,
        origin: RecordOrigin,
    ) -> Result<()> {
        if self.writer.is_closed() {
            return Err(StitchError::SinkClosed { sink: "shared" }.into());
        }
        self.counters.count_submitted(origin);
        if !apply_status(&mut record, status, self.drop_duplicates) {
            self.counters.count_dropped();
            return Ok(());
        }
        if self.deferred.should_defer(&record) {
            self.counters.count_deferred();
            return self.deferred.write(&record);
        }
        self.writer.write(&record)
    }

    /// Closes the shared file. Returns `false` if it was already closed.
    ///
    /// # Errors
    /// Returns an error if the file cannot be finished.
    pub fn close(&self) -> Result<bool> {
        self.writer.close()
    }

    #[must_use]
    pub fn counts(&self) -> WriteCounts {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.writer.records_written()
    }
}

/// A worker's handle onto a [`SynchronizedSink`].
///
/// Closing a handle detaches it; the shared file itself is closed once by its owner.
pub struct SharedSinkHandle {
    sink: Arc<SynchronizedSink>,
    detached: bool,
}

impl SharedSinkHandle {
    #[must_use]
    pub fn new(sink: Arc<SynchronizedSink>) -> Self {
        Self { sink, detached: false }
    }
}

impl RecordSink for SharedSinkHandle {
    fn submit_as(
        &mut self,
        record: RecordBuf,
        status: DuplicateStatus,
        origin: RecordOrigin,
    ) -> Result<()> {
        if self.detached {
            return Err(StitchError::SinkClosed { sink: "shared" }.into());
        }
        self.sink.submit_shared(record, status, origin)
    }

    fn close(&mut self) -> Result<()> {
        self.detached = true;
        Ok(())
    }

    /// Counts for the whole shared sink, across all handles.
    fn counts(&self) -> WriteCounts {
        self.sink.counts()
    }
}

/// Writes window output to a partition BAM.
struct PartitionWriter {
    header: Header,
    writer: BamWriter,
    path: PathBuf,
}

impl WindowOutput for PartitionWriter {
    fn emit(&mut self, record: RecordBuf) -> Result<()> {
        self.writer
            .write_alignment_record(&self.header, &record)
            .with_context(|| format!("Failed to write record to {}", self.path.display()))
    }
}

/// Per-partition sink owned by exactly one worker.
pub struct PartitionSink {
    index: usize,
    cache: Option<PositionWindowCache<PartitionWriter>>,
    deferred: DeferredStream,
    counters: SinkCounters,
    drop_duplicates: bool,
    keep_open: bool,
    output: Option<PartitionOutput>,
    stats: WindowStats,
}

impl PartitionSink {
    /// Creates the partition BAM at `path`.
    ///
    /// With `keep_open`, closing the sink leaves the writer open and hands it over in
    /// the [`PartitionOutput`] so later partitions can be appended to the same file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        index: usize,
        path: &Path,
        header: &Header,
        window: WindowConfig,
        deferred: DeferredStream,
        drop_duplicates: bool,
        keep_open: bool,
        threads: usize,
    ) -> Result<Self> {
        let writer = create_bam_writer(path, header, threads)?;
        let output = PartitionWriter { header: header.clone(), writer, path: path.to_path_buf() };
        Ok(Self {
            index,
            cache: Some(PositionWindowCache::new(window, output)),
            deferred,
            counters: SinkCounters::default(),
            drop_duplicates,
            keep_open,
            output: None,
            stats: WindowStats::default(),
        })
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Window statistics (final once the sink is closed).
    #[must_use]
    pub fn window_stats(&self) -> WindowStats {
        self.cache.as_ref().map_or(self.stats, PositionWindowCache::stats)
    }

    fn cache_mut(&mut self) -> Result<&mut PositionWindowCache<PartitionWriter>> {
        self.cache.as_mut().ok_or_else(|| StitchError::SinkClosed { sink: "partition" }.into())
    }
}

impl RecordSink for PartitionSink {
    fn submit_as(
        &mut self,
        mut record: RecordBuf,
        status: DuplicateStatus,
        origin: RecordOrigin,
    ) -> Result<()> {
        if self.cache.is_none() {
            return Err(StitchError::SinkClosed { sink: "partition" }.into());
        }
        self.counters.count_submitted(origin);
        if !apply_status(&mut record, status, self.drop_duplicates) {
            self.counters.count_dropped();
            return Ok(());
        }
        if self.deferred.should_defer(&record) {
            self.counters.count_deferred();
            return self.deferred.write(&record);
        }

        let Some(cache) = self.cache.as_mut() else {
            return Err(StitchError::SinkClosed { sink: "partition" }.into());
        };
        if cache.can_write_record(&record) {
            cache.add_record(record)
        } else {
            self.counters.count_unsorted();
            self.deferred.write(&record)
        }
    }

    fn begin_region(&mut self, contig: usize, start: usize) -> Result<()> {
        let cache = self.cache_mut()?;
        cache.flush()?;
        cache.initialise_start_position(contig, start);
        Ok(())
    }

    fn advance(&mut self, position: usize) -> Result<()> {
        let cache = self.cache_mut()?;
        let buffer = cache.config().position_buffer;
        cache.set_upper_bound_position(position.saturating_add(buffer));
        cache.set_upper_writable_position(position);
        cache.flush_if_ready()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut cache) = self.cache.take() else {
            return Ok(());
        };
        cache.flush()?;
        self.stats = cache.stats();
        let PartitionWriter { writer, path, .. } = cache.into_output();

        let writer = if self.keep_open {
            Some(writer)
        } else {
            finish_bam_writer(writer, &path)?;
            None
        };
        self.output = Some(PartitionOutput {
            index: self.index,
            path,
            writer,
            records: self.stats.records_written,
        });
        Ok(())
    }

    fn counts(&self) -> WriteCounts {
        self.counters.snapshot()
    }

    fn take_partition_output(&mut self) -> Option<PartitionOutput> {
        self.output.take()
    }
}
