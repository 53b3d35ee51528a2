//! `weightpatch config`: print the effective or default configuration.

use anyhow::{Context, Result};
use clap::Subcommand;
use weightpatch_common::WeightPatchConfig;

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration (file plus environment overrides)
    Show,
    /// Print a default configuration file
    Default,
}

impl ConfigAction {
    pub fn execute(&self, config: &WeightPatchConfig) -> Result<()> {
        match self {
            Self::Show => {
                let rendered =
                    toml::to_string_pretty(config).context("Failed to serialize configuration")?;
                println!("{rendered}");
            }
            Self::Default => println!("{}", WeightPatchConfig::default_toml()),
        }
        Ok(())
    }
}
