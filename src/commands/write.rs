//! Write a coordinate-sorted, indexed BAM through partitioned workers.
//!
//! The input is split into genomic partitions over the primary contigs. Each partition is
//! written by its own worker through a reordering window; records the window cannot place
//! (unmapped, non-primary, too far out of order) are deferred and merged in at the end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fgstitch_lib::bam_io::create_bam_reader;
use fgstitch_lib::coordinator::{AssemblyStrategy, OutputConfig, OutputCoordinator};
use fgstitch_lib::deferred::UnmapRegions;
use fgstitch_lib::header::add_pg_record;
use fgstitch_lib::logging::format_count;
use fgstitch_lib::partition::{PartitionPlan, PrimaryContigs};
use fgstitch_lib::pipeline::{DEFAULT_QUEUE_CAPACITY, run_pipeline};
use fgstitch_lib::validation::{validate_file_exists, validate_positive};
use log::info;

use crate::commands::command::Command;
use crate::commands::common::{BamIoOptions, WindowOptions};

/// Write a BAM through per-partition workers and reassemble it in coordinate order.
#[derive(Debug, Parser)]
#[command(
    name = "write",
    about = "\x1b[38;5;72m[OUTPUT]\x1b[0m         \x1b[36mWrite a sorted, indexed BAM through partitioned workers\x1b[0m",
    long_about = r#"
Write a coordinate-sorted, indexed BAM through partitioned workers.

The primary contigs are split into --partitions regions of similar size. Each region is
written by its own worker, which reorders its records within a small position window.
Records the window cannot place are deferred, sorted and merged in at the end.

TOPOLOGIES:

  shared (default)    All workers write to one interim file, which is then sorted with
                      --samtools. Without --samtools the output is left unsorted.

  --multi-file        Each worker writes its own file. With --strategy stitch the files
                      are appended to the output in partition order as they complete;
                      with --strategy external-merge they are combined at the end.

EXCLUDED REGIONS:

  --unmap-regions takes a BED file. Records inside a region are unmapped (supplementary
  records are dropped) and mates pointing into a region have their mate fields cleared.

EXAMPLES:

  # Four partitions, stitched together as they complete
  fgstitch write -i in.bam -o out.bam --partitions 4 --multi-file

  # Shared sink sorted with samtools
  fgstitch write -i in.bam -o out.bam --samtools samtools -@ 8

  # Count records without writing anything
  fgstitch write -i in.bam -o out.bam --no-output
"#
)]
pub struct Write {
    #[command(flatten)]
    pub io: BamIoOptions,

    /// Number of threads for BAM compression, sorting and merging.
    #[arg(short = '@', short_alias = 't', long = "threads", default_value = "1")]
    pub threads: usize,

    /// Number of genomic partitions (and workers).
    #[arg(short = 'p', long = "partitions", default_value = "1")]
    pub partitions: usize,

    /// Write one interim file per partition instead of a single shared file.
    #[arg(long = "multi-file", default_value = "false")]
    pub multi_file: bool,

    /// How per-partition files become the output (only with --multi-file).
    #[arg(long = "strategy", value_enum, default_value_t = AssemblyStrategy::default())]
    pub strategy: AssemblyStrategy,

    /// samtools-compatible executable used to sort, merge and index.
    #[arg(long = "samtools")]
    pub samtools: Option<PathBuf>,

    /// Keep interim files in <output>.interim/ instead of deleting them.
    #[arg(long = "keep-interim", default_value = "false")]
    pub keep_interim: bool,

    /// Discard records flagged as duplicates instead of writing them.
    #[arg(long = "remove-duplicates", default_value = "false")]
    pub remove_duplicates: bool,

    /// BED file of regions whose records are unmapped.
    #[arg(long = "unmap-regions")]
    pub unmap_regions: Option<PathBuf>,

    /// Primary contigs to partition over. Defaults to the human primary assembly when
    /// present in the header, otherwise every contig.
    #[arg(long = "contigs", num_args = 1.., value_delimiter = ',')]
    pub contigs: Option<Vec<String>>,

    /// Read and route every record but write no output.
    #[arg(long = "no-output", default_value = "false")]
    pub no_output: bool,

    #[command(flatten)]
    pub window: WindowOptions,

    /// Directory for interim files. Defaults to the output's directory.
    #[arg(short = 'T', long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,
}

impl Command for Write {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.io.validate()?;
        validate_positive(self.partitions, "partitions")?;
        validate_positive(self.threads, "threads")?;
        self.window.to_config().validate()?;
        if let Some(bed) = &self.unmap_regions {
            validate_file_exists(bed, "Unmap regions BED")?;
        }
        if let Some(dir) = &self.tmp_dir {
            validate_file_exists(dir, "Temporary directory")?;
        }

        info!("Starting Write");
        info!("Input: {}", self.io.input.display());
        info!("Output: {}", self.io.output.display());
        info!("Partitions: {}", self.partitions);
        info!("Threads: {}", self.threads);

        let (mut reader, header) = create_bam_reader(&self.io.input, self.threads)?;
        let header = add_pg_record(header, env!("CARGO_PKG_VERSION"), command_line)?;

        let primary = Arc::new(PrimaryContigs::from_header(&header, self.contigs.as_deref())?);
        let plan = PartitionPlan::plan(&header, &primary, self.partitions)?;
        info!(
            "Planned {} partitions over {} primary contigs",
            plan.len(),
            primary.len()
        );

        let config = self.output_config(&header)?;
        let regions = config.unmap_regions.clone();
        let coordinator = OutputCoordinator::new(config, header.clone(), primary, plan.len())?;

        let routed = run_pipeline(
            &mut reader,
            &header,
            &plan,
            &coordinator,
            &regions,
            DEFAULT_QUEUE_CAPACITY,
        )?;
        let summary = coordinator.finish()?;

        info!("Read {} records", format_count(routed.records_read));
        match (&summary.output, &summary.index) {
            (Some(output), Some(index)) => {
                info!("Wrote {} with index {}", output.display(), index.display());
            }
            (Some(output), None) if summary.sorted => {
                info!("Wrote {} (not indexed)", output.display());
            }
            (Some(output), None) => info!("Wrote {} (unsorted)", output.display()),
            (None, _) => info!("Output disabled; nothing written"),
        }
        Ok(())
    }
}

impl Write {
    fn output_config(&self, header: &noodles::sam::Header) -> Result<OutputConfig> {
        let mut config = OutputConfig::new(&self.io.output);
        config.enabled = !self.no_output;
        config.multi_file = self.multi_file;
        config.threads = self.threads;
        config.keep_interim = self.keep_interim;
        config.tool_path.clone_from(&self.samtools);
        config.strategy = self.strategy;
        config.drop_duplicates = self.remove_duplicates;
        config.window = self.window.to_config();
        config.interim_dir.clone_from(&self.tmp_dir);
        if let Some(bed) = &self.unmap_regions {
            config.unmap_regions = UnmapRegions::from_bed(bed, header)
                .with_context(|| format!("Failed to load regions from {}", bed.display()))?;
            info!("Loaded {} excluded regions", config.unmap_regions.len());
        }
        Ok(config)
    }
}
