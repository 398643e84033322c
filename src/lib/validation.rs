//! Input validation utilities
//!
//! Checks for command-line parameters and file paths with consistent error messages,
//! using the structured error types from [`crate::errors`].

use std::fmt::Display;
use std::path::Path;

use crate::errors::{Result, StitchError};

/// Validate that a file exists
///
/// # Errors
/// Returns [`StitchError::MissingFile`] if the path does not exist
///
/// # Example
/// ```
/// use fgstitch_lib::validation::validate_file_exists;
///
/// let result = validate_file_exists("/nonexistent/file.bam", "Input BAM");
/// assert!(result.is_err());
/// ```
pub fn validate_file_exists<P: AsRef<Path>>(path: P, description: &str) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(StitchError::MissingFile {
            description: description.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Validate that multiple files exist
///
/// # Errors
/// Returns an error for the first file that doesn't exist
pub fn validate_files_exist<P: AsRef<Path>>(files: &[(P, &str)]) -> Result<()> {
    for (path, description) in files {
        validate_file_exists(path, description)?;
    }
    Ok(())
}

/// Validate that an output can be created at `output` without clobbering `input`.
///
/// # Errors
/// Returns an error if the parent directory is missing or `output` is `input`.
///
/// # Example
/// ```
/// use fgstitch_lib::validation::validate_output_path;
///
/// assert!(validate_output_path("in.bam", "in.bam").is_err());
/// assert!(validate_output_path("in.bam", "/nonexistent/dir/out.bam").is_err());
/// ```
pub fn validate_output_path<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    let (input, output) = (input.as_ref(), output.as_ref());
    if input == output {
        return Err(StitchError::InvalidParameter {
            parameter: "output".to_string(),
            reason: format!("must differ from the input ({})", input.display()),
        });
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        validate_file_exists(parent, "Output directory")?;
    }
    Ok(())
}

/// Validate that a value is positive (> 0)
///
/// # Errors
/// Returns an error if the value is not positive
///
/// # Example
/// ```
/// use fgstitch_lib::validation::validate_positive;
///
/// validate_positive(4, "partitions").unwrap();
/// assert!(validate_positive(0, "partitions").is_err());
/// ```
#[allow(clippy::needless_pass_by_value)]
pub fn validate_positive<T: Ord + Display + Default>(value: T, name: &str) -> Result<()> {
    if value <= T::default() {
        return Err(StitchError::InvalidParameter {
            parameter: name.to_string(),
            reason: format!("Must be positive (> 0), got: {value}"),
        });
    }
    Ok(())
}

/// Validate that `lower` is strictly below `upper`
///
/// # Errors
/// Returns an error naming `lower_name` if it is not below `upper`
#[allow(clippy::needless_pass_by_value)]
pub fn validate_below<T: Ord + Display>(
    lower: T,
    upper: T,
    lower_name: &str,
    upper_name: &str,
) -> Result<()> {
    if lower >= upper {
        return Err(StitchError::InvalidParameter {
            parameter: lower_name.to_string(),
            reason: format!("{lower_name} ({lower}) must be < {upper_name} ({upper})"),
        });
    }
    Ok(())
}
