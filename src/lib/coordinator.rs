//! Partition output coordinator.
//!
//! Chooses the sink topology, hands sinks to workers, collects them when workers finish
//! and drives final assembly:
//!
//! | Topology | Tool | Assembly |
//! |---|---|---|
//! | shared | yes | sort (one retry), merge with deferred, index |
//! | shared | no | concatenate with deferred, left unsorted |
//! | partitioned, stitch | either | stitch in index order, merge with deferred, index |
//! | partitioned, external merge | yes | concatenate partitions, merge with deferred, index |
//! | partitioned, external merge | no | k-way merge of partitions and deferred, index |
//!
//! Any failure is fatal; there is no partial output mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use crossbeam_channel::Sender;
use log::{debug, info};
use noodles::sam::Header;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::bam_io::{bai_path, index_bam};
use crate::deferred::{DeferredSummary, UnmapRegions, process_deferred};
use crate::errors::StitchError;
use crate::header::{SortOrder, with_sort_order};
use crate::logging::{OperationTimer, log_deferred_summary, log_write_summary};
use crate::merge::{concatenate_bams, merge_sorted_bams};
use crate::partition::PrimaryContigs;
use crate::sink::{
    DeferredStream, NoOpSink, PartitionOutput, PartitionSink, RecordSink, SharedSinkHandle,
    SynchronizedSink, WriteCounts,
};
use crate::stitcher::{StitchSummary, Stitcher, spawn_stitcher};
use crate::tool::{AlignmentTool, Samtools, sort_with_retry};
use crate::validation::validate_positive;
use crate::window::WindowConfig;

/// How per-partition outputs become the final file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AssemblyStrategy {
    /// Append partitions to partition 0's writer in index order as they complete.
    #[default]
    #[value(name = "stitch")]
    Stitch,

    /// Concatenate partitions after all complete, then merge with deferred records.
    #[value(name = "external-merge")]
    ExternalMerge,
}

/// Output configuration consumed by the coordinator.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Final output BAM.
    pub output: PathBuf,
    /// When false every record is counted and discarded.
    pub enabled: bool,
    /// One sink per partition instead of a single shared sink.
    pub multi_file: bool,
    pub threads: usize,
    /// Keep interim files in `<output>.interim/` instead of deleting them.
    pub keep_interim: bool,
    /// samtools-compatible executable for sort, merge and index.
    pub tool_path: Option<PathBuf>,
    pub strategy: AssemblyStrategy,
    pub drop_duplicates: bool,
    pub window: WindowConfig,
    /// Parent directory for the temporary interim directory.
    pub interim_dir: Option<PathBuf>,
    pub unmap_regions: UnmapRegions,
}

impl OutputConfig {
    #[must_use]
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            enabled: true,
            multi_file: false,
            threads: 1,
            keep_interim: false,
            tool_path: None,
            strategy: AssemblyStrategy::default(),
            drop_duplicates: false,
            window: WindowConfig::default(),
            interim_dir: None,
            unmap_regions: UnmapRegions::default(),
        }
    }

    /// # Errors
    /// Returns an error if the thread count or window settings are invalid.
    pub fn validate(&self) -> crate::errors::Result<()> {
        validate_positive(self.threads, "threads")?;
        self.window.validate()
    }

    fn retained_interim_dir(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_owned();
        name.push(".interim");
        PathBuf::from(name)
    }
}

/// What the coordinator produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSummary {
    /// The final file, if output was enabled.
    pub output: Option<PathBuf>,
    /// Its index, if one was written.
    pub index: Option<PathBuf>,
    /// True when the final file is coordinate sorted.
    pub sorted: bool,
    pub partitions: usize,
    pub counts: WriteCounts,
    pub deferred: Option<DeferredSummary>,
}

enum InterimDir {
    Temporary(TempDir),
    Retained(PathBuf),
}

impl InterimDir {
    fn create(config: &OutputConfig) -> Result<Self> {
        if config.keep_interim {
            let dir = config.retained_interim_dir();
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create interim directory {}", dir.display()))?;
            return Ok(Self::Retained(dir));
        }
        let base = match &config.interim_dir {
            Some(dir) => dir.clone(),
            None => config
                .output
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        };
        let dir = tempfile::Builder::new()
            .prefix("fgstitch.")
            .tempdir_in(&base)
            .with_context(|| format!("Failed to create temp directory in {}", base.display()))?;
        Ok(Self::Temporary(dir))
    }

    fn path(&self) -> &Path {
        match self {
            Self::Temporary(dir) => dir.path(),
            Self::Retained(dir) => dir,
        }
    }

    fn cleanup(self) -> Result<()> {
        match self {
            Self::Temporary(dir) => {
                let path = dir.path().to_path_buf();
                dir.close().with_context(|| {
                    format!("Failed to remove interim files in {}", path.display())
                })
            }
            Self::Retained(dir) => {
                info!("Interim files retained in {}", dir.display());
                Ok(())
            }
        }
    }
}

struct PartitionedState {
    sinks: Mutex<Vec<Option<PartitionSink>>>,
    completions: Option<Sender<PartitionOutput>>,
    stitcher: Option<JoinHandle<Result<StitchSummary>>>,
    outputs: Mutex<Vec<PartitionOutput>>,
}

enum Topology {
    Disabled,
    Shared(Arc<SynchronizedSink>),
    Partitioned(PartitionedState),
}

/// Owns the sinks for one run and assembles their outputs.
pub struct OutputCoordinator {
    config: OutputConfig,
    /// Input header (with any program record already added).
    header: Header,
    sorted_header: Header,
    primary: Arc<PrimaryContigs>,
    partition_count: usize,
    interim: Option<InterimDir>,
    deferred: Option<DeferredStream>,
    topology: Topology,
    tool: Option<Box<dyn AlignmentTool>>,
    counts: Mutex<WriteCounts>,
}

impl OutputCoordinator {
    /// Creates the interim directory and every sink the configured topology needs.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a file cannot be created.
    pub fn new(
        config: OutputConfig,
        header: Header,
        primary: Arc<PrimaryContigs>,
        partition_count: usize,
    ) -> Result<Self> {
        config.validate()?;
        validate_positive(partition_count, "partitions")?;
        let sorted_header = with_sort_order(&header, SortOrder::Coordinate)?;
        let tool: Option<Box<dyn AlignmentTool>> = config
            .tool_path
            .as_ref()
            .map(|path| Box::new(Samtools::new(path)) as Box<dyn AlignmentTool>);

        if !config.enabled {
            info!("Output disabled; records will be counted and discarded");
            return Ok(Self {
                config,
                header,
                sorted_header,
                primary,
                partition_count,
                interim: None,
                deferred: None,
                topology: Topology::Disabled,
                tool,
                counts: Mutex::new(WriteCounts::default()),
            });
        }

        let interim = InterimDir::create(&config)?;
        let deferred = DeferredStream::create(
            &interim.path().join("deferred.bam"),
            &header,
            Arc::clone(&primary),
            1,
        )?;

        let topology = if config.multi_file {
            Topology::Partitioned(Self::create_partitioned(
                &config,
                &sorted_header,
                interim.path(),
                &deferred,
                partition_count,
            )?)
        } else {
            info!("Writing to a single shared output");
            let shared = SynchronizedSink::create(
                &interim.path().join("shared.bam"),
                &header,
                deferred.clone(),
                config.drop_duplicates,
                config.threads,
            )?;
            Topology::Shared(shared)
        };

        Ok(Self {
            config,
            header,
            sorted_header,
            primary,
            partition_count,
            interim: Some(interim),
            deferred: Some(deferred),
            topology,
            tool,
            counts: Mutex::new(WriteCounts::default()),
        })
    }

    fn create_partitioned(
        config: &OutputConfig,
        sorted_header: &Header,
        interim: &Path,
        deferred: &DeferredStream,
        partition_count: usize,
    ) -> Result<PartitionedState> {
        info!("Writing {} partition outputs ({:?} assembly)", partition_count, config.strategy);
        let stitch = config.strategy == AssemblyStrategy::Stitch;

        let mut sinks = Vec::with_capacity(partition_count);
        for index in 0..partition_count {
            // Under stitching, partition 0's file is the base the others are appended to.
            // It only moves to the output path once assembly succeeds.
            let base = stitch && index == 0;
            let path = if base {
                interim.join("stitched.bam")
            } else {
                interim.join(format!("part{index:04}.bam"))
            };
            let sink = PartitionSink::create(
                index,
                &path,
                sorted_header,
                config.window,
                deferred.clone(),
                config.drop_duplicates,
                base,
                if base { config.threads } else { 1 },
            )?;
            sinks.push(Some(sink));
        }

        let (completions, stitcher) = if stitch {
            let (tx, rx) = crossbeam_channel::unbounded();
            let stitcher = Stitcher::new(
                sorted_header.clone(),
                partition_count,
                config.keep_interim,
                config.threads,
            );
            (Some(tx), Some(spawn_stitcher(stitcher, rx)?))
        } else {
            (None, None)
        };

        Ok(PartitionedState {
            sinks: Mutex::new(sinks),
            completions,
            stitcher,
            outputs: Mutex::new(Vec::with_capacity(partition_count)),
        })
    }

    /// Replaces the external tool (normally samtools from the configured path).
    #[must_use]
    pub fn with_tool(mut self, tool: Box<dyn AlignmentTool>) -> Self {
        self.tool = Some(tool);
        self
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    #[must_use]
    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Hands out the sink for partition `index`. Each partition sink is handed out once.
    ///
    /// # Errors
    /// Returns an error if `index` is out of range or its sink was already taken.
    pub fn sink_for(&self, index: usize) -> Result<Box<dyn RecordSink>> {
        if index >= self.partition_count {
            return Err(StitchError::InvalidParameter {
                parameter: "partition".to_string(),
                reason: format!("{index} is out of range for {} partitions", self.partition_count),
            }
            .into());
        }
        match &self.topology {
            Topology::Disabled => Ok(Box::new(NoOpSink::new(self.config.drop_duplicates))),
            Topology::Shared(shared) => Ok(Box::new(SharedSinkHandle::new(Arc::clone(shared)))),
            Topology::Partitioned(state) => {
                let sink = state.sinks.lock()[index]
                    .take()
                    .ok_or_else(|| anyhow!("The sink for partition {index} was already taken"))?;
                Ok(Box::new(sink))
            }
        }
    }

    /// Closes a worker's sink and passes its output on to assembly.
    ///
    /// # Errors
    /// Returns an error if the sink cannot be closed or its output cannot be handed on.
    pub fn complete_partition(&self, index: usize, mut sink: Box<dyn RecordSink>) -> Result<()> {
        sink.close().with_context(|| format!("Failed to close sink for partition {index}"))?;

        match &self.topology {
            Topology::Disabled => *self.counts.lock() += sink.counts(),
            // Shared counts are read once from the shared sink.
            Topology::Shared(_) => {}
            Topology::Partitioned(state) => {
                *self.counts.lock() += sink.counts();
                let output = sink.take_partition_output().ok_or_else(|| {
                    StitchError::MissingPartitionOutput {
                        index,
                        reason: "the sink produced no output".to_string(),
                    }
                })?;
                Self::hand_on(state, output)?;
            }
        }
        debug!("Partition {index} complete");
        Ok(())
    }

    fn hand_on(state: &PartitionedState, output: PartitionOutput) -> Result<()> {
        match &state.completions {
            Some(tx) => {
                let index = output.index;
                tx.send(output)
                    .map_err(|_| anyhow!("Stitcher stopped before partition {index} was handed on"))
            }
            None => {
                state.outputs.lock().push(output);
                Ok(())
            }
        }
    }

    /// Completes partitions whose sinks were never handed out.
    fn complete_unclaimed(&self) -> Result<()> {
        let Topology::Partitioned(state) = &self.topology else {
            return Ok(());
        };
        let unclaimed: Vec<PartitionSink> =
            state.sinks.lock().iter_mut().filter_map(Option::take).collect();
        for sink in unclaimed {
            let index = sink.index();
            debug!("Partition {index} was never claimed; completing it empty");
            self.complete_partition(index, Box::new(sink))?;
        }
        Ok(())
    }

    /// Closes all outputs, processes deferred records and assembles the final file.
    ///
    /// # Errors
    /// Returns an error if any stage fails; the final file must then be considered invalid.
    pub fn finish(self) -> Result<OutputSummary> {
        self.complete_unclaimed()?;

        let Self {
            config,
            header,
            sorted_header,
            primary,
            partition_count,
            interim,
            deferred,
            topology,
            tool,
            counts,
        } = self;
        let mut counts = counts.into_inner();
        let tool = tool.as_deref();

        let (Some(interim), Some(deferred)) = (interim, deferred) else {
            log_write_summary(&counts);
            return Ok(OutputSummary {
                output: None,
                index: None,
                sorted: false,
                partitions: partition_count,
                counts,
                deferred: None,
            });
        };

        // Partition sinks are closed; close the shared stream before the deferred pass.
        let partitioned = match topology {
            Topology::Disabled => None,
            Topology::Shared(shared) => {
                shared.close()?;
                counts = shared.counts();
                None
            }
            Topology::Partitioned(state) => Some(state),
        };
        log_write_summary(&counts);

        deferred.close()?;
        let deferred_summary = if deferred.records_written() > 0 {
            let processed = interim.path().join("deferred.processed.bam");
            let summary = process_deferred(
                deferred.path(),
                &processed,
                interim.path(),
                tool,
                &config.unmap_regions,
                &primary,
                config.threads,
            )?;
            log_deferred_summary(&summary);
            Some((processed, summary))
        } else {
            debug!("No deferred records");
            None
        };
        let deferred_path = deferred_summary.as_ref().map(|(path, _)| path.clone());

        let assembly = Assembly {
            config: &config,
            header: &header,
            sorted_header: &sorted_header,
            interim: interim.path(),
            tool,
            deferred: deferred_path,
        };
        let (sorted, index) = match partitioned {
            None => assembly.assemble_shared()?,
            Some(state) => {
                let PartitionedState { completions, stitcher, outputs, .. } = state;
                // The stitcher sees the queue close once every sender is gone.
                drop(completions);
                match stitcher {
                    Some(handle) => {
                        let summary = handle
                            .join()
                            .map_err(|_| anyhow!("Stitcher thread panicked"))??;
                        assembly.assemble_stitched(&summary)?
                    }
                    None => assembly.assemble_partitions(outputs.into_inner(), partition_count)?,
                }
            }
        };

        interim.cleanup()?;
        info!("Wrote {}", config.output.display());
        Ok(OutputSummary {
            output: Some(config.output.clone()),
            index,
            sorted,
            partitions: partition_count,
            counts,
            deferred: deferred_summary.map(|(_, summary)| summary),
        })
    }
}

/// Final assembly inputs shared by every strategy.
struct Assembly<'a> {
    config: &'a OutputConfig,
    header: &'a Header,
    sorted_header: &'a Header,
    interim: &'a Path,
    tool: Option<&'a dyn AlignmentTool>,
    /// Processed deferred records, if there were any.
    deferred: Option<PathBuf>,
}

impl Assembly<'_> {
    fn output(&self) -> &Path {
        &self.config.output
    }

    fn with_deferred(&self, mut inputs: Vec<PathBuf>) -> Vec<PathBuf> {
        inputs.extend(self.deferred.iter().cloned());
        inputs
    }

    fn assemble_shared(&self) -> Result<(bool, Option<PathBuf>)> {
        let shared = self.interim.join("shared.bam");
        match self.tool {
            Some(tool) => {
                let sorted = self.interim.join("shared.sorted.bam");
                sort_with_retry(tool, &shared, &sorted, self.config.threads)?;
                self.merge_sorted(self.with_deferred(vec![sorted]))?;
                Ok((true, Some(self.index()?)))
            }
            None => {
                info!("No external tool configured; leaving the output unsorted");
                let unsorted_header = with_sort_order(self.header, SortOrder::Unsorted)?;
                concatenate_bams(
                    &self.with_deferred(vec![shared]),
                    self.output(),
                    Some(&unsorted_header),
                    self.config.threads,
                )?;
                Ok((false, None))
            }
        }
    }

    fn assemble_stitched(&self, summary: &StitchSummary) -> Result<(bool, Option<PathBuf>)> {
        info!("Stitched {} partitions into {}", summary.partitions, summary.path.display());
        self.merge_sorted(self.with_deferred(vec![summary.path.clone()]))?;
        Ok((true, Some(self.index()?)))
    }

    fn assemble_partitions(
        &self,
        mut outputs: Vec<PartitionOutput>,
        partition_count: usize,
    ) -> Result<(bool, Option<PathBuf>)> {
        outputs.sort_by_key(|o| o.index);
        for index in 0..partition_count {
            let Some(output) = outputs.get(index).filter(|o| o.index == index) else {
                return Err(StitchError::MissingPartitionOutput {
                    index,
                    reason: "the partition never completed".to_string(),
                }
                .into());
            };
            if !output.path.exists() {
                return Err(StitchError::MissingPartitionOutput {
                    index,
                    reason: format!("{} does not exist", output.path.display()),
                }
                .into());
            }
        }
        let paths: Vec<PathBuf> = outputs.into_iter().map(|o| o.path).collect();

        match self.tool {
            Some(tool) => {
                let combined = self.interim.join("combined.bam");
                tool.concatenate(&paths, &combined)?;
                self.merge_sorted(self.with_deferred(vec![combined]))?;
            }
            None => {
                merge_sorted_bams(
                    &self.with_deferred(paths),
                    self.output(),
                    Some(self.sorted_header),
                    self.config.threads,
                )?;
            }
        }
        Ok((true, Some(self.index()?)))
    }

    /// Merges coordinate-sorted inputs into the output, or moves a lone input into place.
    fn merge_sorted(&self, inputs: Vec<PathBuf>) -> Result<()> {
        if let [single] = inputs.as_slice() {
            return move_file(single, self.output());
        }
        match self.tool {
            Some(tool) => tool.merge(&inputs, self.output(), self.config.threads),
            None => merge_sorted_bams(
                &inputs,
                self.output(),
                Some(self.sorted_header),
                self.config.threads,
            )
            .map(|_| ()),
        }
    }

    fn index(&self) -> Result<PathBuf> {
        let timer = OperationTimer::new("Indexing output");
        let index = match self.tool {
            Some(tool) => {
                tool.index(self.output(), self.config.threads)?;
                bai_path(self.output())
            }
            None => index_bam(self.output())?,
        };
        if !index.exists() {
            return Err(StitchError::MissingFile {
                description: "BAM index".to_string(),
                path: index,
            }
            .into());
        }
        info!("Indexing output completed in {:.1}s", timer.elapsed().as_secs_f64());
        Ok(index)
    }
}

/// Renames `from` to `to`, copying when they are on different file systems.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from).with_context(|| format!("Failed to remove {}", from.display()))
}
