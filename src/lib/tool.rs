//! External sort/merge/index tool.
//!
//! The [`AlignmentTool`] trait wraps a samtools-compatible executable. Every call blocks
//! until the subprocess exits; its exit status is the only success signal and standard
//! error is kept for the diagnostic.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::errors::StitchError;

/// Number of attempts for the sort stage: the requested thread count, then one thread.
const SORT_ATTEMPTS: usize = 2;

/// Sort, merge, concatenate and index operations on BAM files.
pub trait AlignmentTool: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Coordinate-sorts `input` into `output`.
    ///
    /// # Errors
    /// Fails if the tool reports failure.
    fn sort(&self, input: &Path, output: &Path, threads: usize) -> Result<()>;

    /// Merges coordinate-sorted `inputs` into `output`, overwriting it.
    ///
    /// # Errors
    /// Fails if the tool reports failure.
    fn merge(&self, inputs: &[PathBuf], output: &Path, threads: usize) -> Result<()>;

    /// Concatenates `inputs` in order into `output`.
    ///
    /// # Errors
    /// Fails if the tool reports failure.
    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;

    /// Writes the coordinate index for `path`.
    ///
    /// # Errors
    /// Fails if the tool reports failure.
    fn index(&self, path: &Path, threads: usize) -> Result<()>;
}

/// Sorts with `tool`, retrying once with a single thread if the first attempt fails.
///
/// # Errors
/// Returns the last failure if every attempt fails.
pub fn sort_with_retry(
    tool: &dyn AlignmentTool,
    input: &Path,
    output: &Path,
    threads: usize,
) -> Result<()> {
    let mut attempt_threads = threads.max(1);
    let mut attempt = 1;
    loop {
        match tool.sort(input, output, attempt_threads) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < SORT_ATTEMPTS => {
                warn!(
                    "{} sort of {} failed with {} threads, retrying with 1 thread: {:#}",
                    tool.name(),
                    input.display(),
                    attempt_threads,
                    e
                );
                attempt += 1;
                attempt_threads = 1;
            }
            Err(e) => {
                return Err(e.context(format!(
                    "Sorting {} failed after {} attempts",
                    input.display(),
                    attempt
                )));
            }
        }
    }
}

/// A samtools executable.
#[derive(Debug, Clone)]
pub struct Samtools {
    executable: PathBuf,
}

impl Samtools {
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self { executable: executable.into() }
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn run(&self, stage: &'static str, args: Vec<OsString>) -> Result<()> {
        let command = std::iter::once(self.executable.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Running {command}");

        let output = Command::new(&self.executable)
            .args(&args)
            .output()
            .with_context(|| format!("Failed to launch {command}"))?;

        if output.status.success() {
            Ok(())
        } else {
            let status = output.status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(StitchError::ToolFailed { stage, command, status, stderr }.into())
        }
    }
}

impl AlignmentTool for Samtools {
    fn name(&self) -> &str {
        "samtools"
    }

    fn sort(&self, input: &Path, output: &Path, threads: usize) -> Result<()> {
        info!("Sorting {} with samtools ({} threads)", input.display(), threads);
        let args: Vec<OsString> = vec![
            "sort".into(),
            "-@".into(),
            threads.max(1).to_string().into(),
            "-o".into(),
            output.into(),
            input.into(),
        ];
        self.run("sort", args)
    }

    fn merge(&self, inputs: &[PathBuf], output: &Path, threads: usize) -> Result<()> {
        info!("Merging {} files into {} with samtools", inputs.len(), output.display());
        let mut args: Vec<OsString> = vec![
            "merge".into(),
            "-f".into(),
            "-@".into(),
            threads.max(1).to_string().into(),
            output.into(),
        ];
        args.extend(inputs.iter().map(OsString::from));
        self.run("merge", args)
    }

    fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        info!("Concatenating {} files into {} with samtools", inputs.len(), output.display());
        let mut args: Vec<OsString> = vec!["cat".into(), "-o".into(), output.into()];
        args.extend(inputs.iter().map(OsString::from));
        self.run("concatenate", args)
    }

    fn index(&self, path: &Path, threads: usize) -> Result<()> {
        info!("Indexing {} with samtools", path.display());
        let args: Vec<OsString> = vec![
            "index".into(),
            "-@".into(),
            threads.max(1).to_string().into(),
            path.into(),
        ];
        self.run("index", args)
    }
}
