//! Common CLI options shared across commands.
//!
//! This module provides shared argument structures that can be composed into
//! command structs using `#[command(flatten)]`.

use std::path::PathBuf;

use clap::Args;

use fgstitch_lib::validation::{validate_file_exists, validate_output_path};
use fgstitch_lib::window::{
    DEFAULT_MIN_WRITE_COUNT, DEFAULT_POSITION_BUFFER, DEFAULT_READ_POS_CACHE_BUFFER, WindowConfig,
};

/// Common input/output options for commands that read a BAM and write a BAM.
#[derive(Debug, Clone, Args)]
pub struct BamIoOptions {
    /// Input BAM file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Output BAM file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
}

impl BamIoOptions {
    /// Validates that the input exists and the output does not overwrite it.
    ///
    /// # Errors
    ///
    /// Returns an error if the input file does not exist or the output path is unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_file_exists(&self.input, "Input BAM")?;
        validate_output_path(&self.input, &self.output)?;
        Ok(())
    }
}

/// Options for the per-partition reordering window.
///
/// Records more than `--read-pos-cache-buffer` bases behind the scan position, or more
/// than `--position-buffer` bases ahead of it, bypass the window and are placed later.
#[derive(Debug, Clone, Args)]
pub struct WindowOptions {
    /// Width, in bases, of the window of positions each partition will accept.
    #[arg(long = "position-buffer", default_value_t = DEFAULT_POSITION_BUFFER)]
    pub position_buffer: usize,

    /// Lag, in bases, between the scan position and the point below which records are
    /// written. Must be smaller than --position-buffer.
    #[arg(long = "read-pos-cache-buffer", default_value_t = DEFAULT_READ_POS_CACHE_BUFFER)]
    pub read_pos_cache_buffer: usize,

    /// Number of writable records that must accumulate before the window flushes.
    #[arg(long = "min-write-count", default_value_t = DEFAULT_MIN_WRITE_COUNT)]
    pub min_write_count: usize,
}

impl WindowOptions {
    #[must_use]
    pub fn to_config(&self) -> WindowConfig {
        WindowConfig {
            position_buffer: self.position_buffer,
            read_pos_cache_buffer: self.read_pos_cache_buffer,
            min_write_count: self.min_write_count,
        }
    }
}
