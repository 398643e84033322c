//! Integration tests for fgstitch.
//!
//! These tests exercise end-to-end output assembly across modules and through the
//! command-line binary.

mod helpers;
mod test_concurrent_sinks;
mod test_error_paths;
mod test_excluded_regions;
mod test_write_command;
