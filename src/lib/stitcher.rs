//! In-process ordered stitcher.
//!
//! Partition workers finish in any order and post their [`PartitionOutput`] on a
//! completion channel. The stitcher holds completed partitions until the one it needs
//! next arrives, then appends it to the final writer. Partition 0 is special: its open
//! writer already is the final output, so nothing is copied for it.
//!
//! ```
//! use fgstitch_lib::stitcher::StitchState;
//!
//! // Three partitions, none consumed yet.
//! assert_eq!(StitchState::for_progress(0, 3), StitchState::Waiting(0));
//! assert_eq!(StitchState::for_progress(3, 3), StitchState::Done);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::Receiver;
use log::{debug, info};
use noodles::sam::Header;

use crate::bam_io::{BamWriter, append_bam, finish_bam_writer};
use crate::errors::StitchError;
use crate::logging::format_count;
use crate::sink::PartitionOutput;

/// Where the stitcher is in its walk over partition indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchState {
    /// Blocked until the partition with this index completes.
    Waiting(usize),
    /// Every partition has been consumed.
    Done,
}

impl StitchState {
    #[must_use]
    pub fn for_progress(next_required: usize, total: usize) -> Self {
        if next_required >= total { Self::Done } else { Self::Waiting(next_required) }
    }
}

/// Result of a completed stitch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitchSummary {
    /// The stitched file (partition 0's path).
    pub path: PathBuf,
    pub partitions: usize,
    /// Records appended from partitions after the first.
    pub records_appended: u64,
}

/// Consumes partition outputs strictly in index order.
pub struct Stitcher {
    header: Header,
    total: usize,
    next_required: usize,
    pending: BTreeMap<usize, PartitionOutput>,
    writer: Option<BamWriter>,
    path: Option<PathBuf>,
    keep_interim: bool,
    threads: usize,
    records_appended: u64,
}

impl Stitcher {
    /// Creates a stitcher expecting `total` partitions. `header` is used to write
    /// appended records and must match the header of partition 0's writer.
    #[must_use]
    pub fn new(header: Header, total: usize, keep_interim: bool, threads: usize) -> Self {
        Self {
            header,
            total,
            next_required: 0,
            pending: BTreeMap::new(),
            writer: None,
            path: None,
            keep_interim,
            threads,
            records_appended: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> StitchState {
        StitchState::for_progress(self.next_required, self.total)
    }

    /// Number of completed partitions waiting on an earlier one.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accepts one completed partition and consumes every partition that is now ready.
    ///
    /// # Errors
    /// Returns an error for an out-of-range or repeated index, or if appending fails.
    pub fn accept(&mut self, output: PartitionOutput) -> Result<()> {
        let index = output.index;
        if index >= self.total {
            bail!("Partition {index} is out of range for {} partitions", self.total);
        }
        if index < self.next_required || self.pending.contains_key(&index) {
            bail!("Partition {index} completed more than once");
        }
        debug!("Partition {index} completed; waiting for {}", self.next_required);
        self.pending.insert(index, output);

        while let Some(output) = self.pending.remove(&self.next_required) {
            self.consume(output)?;
            self.next_required += 1;
        }
        Ok(())
    }

    fn consume(&mut self, output: PartitionOutput) -> Result<()> {
        let PartitionOutput { index, path, writer, records } = output;

        if index == 0 {
            let writer = writer.ok_or_else(|| StitchError::MissingPartitionOutput {
                index,
                reason: "the first partition must hand over its open writer".to_string(),
            })?;
            info!(
                "Stitching: partition 0 ({} records) is the base of {}",
                format_count(records),
                path.display()
            );
            self.writer = Some(writer);
            self.path = Some(path);
            return Ok(());
        }

        if let Some(writer) = writer {
            finish_bam_writer(writer, &path)?;
        }
        if !path.exists() {
            return Err(StitchError::MissingPartitionOutput {
                index,
                reason: format!("{} does not exist", path.display()),
            }
            .into());
        }

        let final_writer =
            self.writer.as_mut().ok_or_else(|| anyhow!("No writer for stitched output"))?;
        let copied = append_bam(&path, final_writer, &self.header, self.threads)
            .with_context(|| format!("Failed to stitch partition {index}"))?;
        self.records_appended += copied;
        info!("Stitching: appended partition {index} ({} records)", format_count(copied));

        if !self.keep_interim {
            remove_interim(&path)?;
        }
        Ok(())
    }

    /// Finishes the stitched file once every partition has been consumed.
    ///
    /// # Errors
    /// Returns an error if partitions are outstanding or the file cannot be finished.
    pub fn finish(self) -> Result<StitchSummary> {
        if let StitchState::Waiting(index) = self.state() {
            return Err(StitchError::MissingPartitionOutput {
                index,
                reason: "the partition never completed".to_string(),
            }
            .into());
        }
        let (Some(writer), Some(path)) = (self.writer, self.path) else {
            return Err(StitchError::MissingPartitionOutput {
                index: 0,
                reason: "no partitions were stitched".to_string(),
            }
            .into());
        };
        finish_bam_writer(writer, &path)?;
        Ok(StitchSummary { path, partitions: self.total, records_appended: self.records_appended })
    }

    /// Blocks on `completions` until every partition has been consumed.
    ///
    /// # Errors
    /// Returns an error if the channel closes early or stitching fails.
    pub fn run(mut self, completions: &Receiver<PartitionOutput>) -> Result<StitchSummary> {
        while let StitchState::Waiting(index) = self.state() {
            let output = completions.recv().map_err(|_| StitchError::MissingPartitionOutput {
                index,
                reason: "the completion queue closed before it arrived".to_string(),
            })?;
            self.accept(output)?;
        }
        self.finish()
    }
}

fn remove_interim(path: &Path) -> Result<()> {
    std::fs::remove_file(path)
        .with_context(|| format!("Failed to remove interim file {}", path.display()))
}

/// Runs a [`Stitcher`] on a dedicated thread.
///
/// # Errors
/// Returns an error if the thread cannot be spawned.
pub fn spawn_stitcher(
    stitcher: Stitcher,
    completions: Receiver<PartitionOutput>,
) -> Result<JoinHandle<Result<StitchSummary>>> {
    std::thread::Builder::new()
        .name("stitcher".to_string())
        .spawn(move || stitcher.run(&completions))
        .context("Failed to spawn stitcher thread")
}
