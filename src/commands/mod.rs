//! CLI command implementations for fgstitch.
//!
//! # Commands
//!
//! - [`write`] - Write a sorted, indexed BAM through partitioned workers
//! - [`index`] - Write a BAI index for a coordinate-sorted BAM

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::struct_excessive_bools,
    clippy::uninlined_format_args
)]

pub mod command;
pub mod common;
pub mod index;
pub mod write;
