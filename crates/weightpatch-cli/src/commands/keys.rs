//! `weightpatch keys`: module identifiers adapters touch.

use anyhow::{Context, Result};
use clap::Args;
use weightpatch_common::WeightPatchConfig;
use weightpatch_merge::module_keys;
use weightpatch_store::{FileStoreOpener, StoreOpener, WeightStore};

use super::OutputFormat;

/// Keys command arguments
#[derive(Debug, Args)]
pub struct KeysCommand {
    /// Adapter files
    #[arg(value_name = "FILES", required = true)]
    pub files: Vec<String>,

    /// Base model file; only its `__up__`/`__down__` keys count
    #[arg(long, value_name = "PATH")]
    pub model_file: Option<String>,

    /// Only consider keys starting with this prefix (overrides config)
    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl KeysCommand {
    pub fn execute(&self, config: &WeightPatchConfig) -> Result<()> {
        let opener = FileStoreOpener::new();
        let mut paths = self.files.clone();
        if let Some(model_file) = &self.model_file
            && !paths.contains(model_file)
        {
            paths.push(model_file.clone());
        }
        let stores = paths
            .iter()
            .map(|p| opener.open(p).with_context(|| format!("Failed to open {p}")).map(|s| (p.as_str(), s)))
            .collect::<Result<Vec<_>>>()?;

        let prefix = self.prefix.as_deref().unwrap_or(&config.merge.key_prefix);
        let modules = module_keys(
            stores.iter().map(|(p, s)| (*p, s.as_ref() as &dyn WeightStore)),
            self.model_file.as_deref(),
            prefix,
        );

        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&modules)?),
            OutputFormat::Text => {
                for module in &modules {
                    println!("{module}");
                }
            }
        }
        Ok(())
    }
}
