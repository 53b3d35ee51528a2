//! `weightpatch rank`: summed rank of a set of adapter files.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use weightpatch_common::WeightPatchConfig;
use weightpatch_merge::{RankOptions, RankReport, compute_rank_for_paths};
use weightpatch_store::FileStoreOpener;

use super::OutputFormat;

/// Rank command arguments
#[derive(Debug, Args)]
pub struct RankCommand {
    /// Adapter files, in load order
    #[arg(value_name = "FILES", required = true)]
    pub files: Vec<String>,

    /// Only count keys starting with this prefix (overrides config)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Base model file; never reported as needing a full merge
    #[arg(long, value_name = "PATH")]
    pub model_file: Option<String>,

    /// Skip full-merge detection
    #[arg(long)]
    pub no_full_merge: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl RankCommand {
    pub fn options(&self, config: &WeightPatchConfig) -> RankOptions {
        let mut options = RankOptions::from_config(&config.merge);
        if let Some(prefix) = &self.prefix {
            options = options.with_prefix(prefix.clone());
        }
        if let Some(model_file) = &self.model_file {
            options = options.with_model_file(model_file.clone());
        }
        if self.no_full_merge {
            options.inspect_full_merge = false;
        }
        options
    }

    pub fn execute(&self, config: &WeightPatchConfig) -> Result<()> {
        let mut paths = self.files.clone();
        if let Some(model_file) = &self.model_file
            && !paths.contains(model_file)
        {
            paths.insert(0, model_file.clone());
        }

        let report = compute_rank_for_paths(&paths, &FileStoreOpener::new(), &self.options(config))
            .context("Failed to scan adapter files")?;

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => print_report(&report),
        }
        Ok(())
    }
}

fn print_report(report: &RankReport) {
    println!("{} {}", style("Total rank:").bold(), report.total_rank);
    for (file, rank) in &report.file_ranks {
        println!("  {rank:>6}  {file}");
    }
    if !report.files_requiring_full_merge.is_empty() {
        println!("{}", style("Files carrying full deltas:").bold());
        for (file, keys) in &report.files_requiring_full_merge {
            println!("  {file} ({} keys)", keys.len());
        }
    }
}
