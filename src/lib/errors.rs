//! Custom error types for fgstitch operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for fgstitch operations
pub type Result<T> = std::result::Result<T, StitchError>;

/// Error type for fgstitch operations
#[derive(Error, Debug)]
pub enum StitchError {
    /// Invalid parameter value provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// File format error
    #[error("Invalid {file_type} file '{path}': {reason}")]
    InvalidFileFormat {
        /// Type of file (e.g., "BAM", "BED")
        file_type: String,
        /// Path to the file
        path: String,
        /// Explanation of the problem
        reason: String,
    },

    /// Required reference sequence not found
    #[error("Reference sequence '{ref_name}' not found in header")]
    ReferenceNotFound {
        /// The reference sequence name
        ref_name: String,
    },

    /// A record was submitted to a sink that has already been closed
    #[error("Cannot submit to {sink} sink: it has already been closed")]
    SinkClosed {
        /// Which sink discipline rejected the write
        sink: &'static str,
    },

    /// The external sort/merge/index tool exited unsuccessfully
    #[error("External {stage} failed ({command}): exit status {status}: {stderr}")]
    ToolFailed {
        /// Pipeline stage, e.g. "sort" or "index"
        stage: &'static str,
        /// The command line that was run
        command: String,
        /// Exit status, or "signal" when terminated by a signal
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// A partition output needed by the assembly stage is missing
    #[error("Output for partition {index} is missing: {reason}")]
    MissingPartitionOutput {
        /// Partition index
        index: usize,
        /// What was missing
        reason: String,
    },

    /// A path that must exist did not
    #[error("Expected {description} at '{}' but it does not exist", path.display())]
    MissingFile {
        /// Human readable role of the file
        description: String,
        /// The missing path
        path: PathBuf,
    },
}
