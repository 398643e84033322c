//! Write a BAI index for a coordinate-sorted BAM.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fgstitch_lib::bam_io::{bai_path, index_bam};
use fgstitch_lib::logging::OperationTimer;
use fgstitch_lib::tool::{AlignmentTool, Samtools};
use fgstitch_lib::validation::validate_file_exists;
use log::info;

use crate::commands::command::Command;

/// Index a coordinate-sorted BAM file.
#[derive(Debug, Parser)]
#[command(
    name = "index",
    about = "\x1b[38;5;166m[UTILITIES]\x1b[0m      \x1b[36mWrite a BAI index for a coordinate-sorted BAM\x1b[0m",
    long_about = r#"
Write a BAI index for a coordinate-sorted BAM.

The index is written to <input>.bai. By default it is built in process; with --samtools
the given executable is used instead.
"#
)]
pub struct Index {
    /// Coordinate-sorted BAM file.
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// samtools-compatible executable used to build the index.
    #[arg(long = "samtools")]
    pub samtools: Option<PathBuf>,

    /// Threads for the external tool.
    #[arg(short = '@', long = "threads", default_value = "1")]
    pub threads: usize,
}

impl Command for Index {
    fn execute(&self, _command_line: &str) -> Result<()> {
        validate_file_exists(&self.input, "Input BAM")?;
        let timer = OperationTimer::new("Indexing BAM");

        let index = match &self.samtools {
            Some(executable) => {
                Samtools::new(executable).index(&self.input, self.threads)?;
                bai_path(&self.input)
            }
            None => index_bam(&self.input)?,
        };

        info!("Wrote index {}", index.display());
        timer.log_completion(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fgstitch_lib::builder::{RecordBuilder, header_with_contigs, write_bam};

    #[test]
    fn test_index_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sorted.bam");
        let header = header_with_contigs(&[("chr1", 1_000)]);
        let records: Vec<_> = [10, 20, 30]
            .iter()
            .map(|&pos| {
                RecordBuilder::mapped_read().sequence("ACGT").alignment_start(pos).build()
            })
            .collect();
        write_bam(&input, &header, &records).unwrap();

        let cmd = Index { input: input.clone(), samtools: None, threads: 1 };
        cmd.execute("fgstitch index").unwrap();
        assert!(bai_path(&input).exists());
    }

    #[test]
    fn test_index_missing_input() {
        let cmd = Index { input: PathBuf::from("/nonexistent.bam"), samtools: None, threads: 1 };
        assert!(cmd.execute("fgstitch index").is_err());
    }
}
