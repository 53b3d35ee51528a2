//! `weightpatch resolve`: resolve one parameter from a base file and an
//! adapter list.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use candle_core::{DType, Tensor};
use clap::Args;
use console::style;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use weightpatch_common::{Precision, WeightPatchConfig};
use weightpatch_merge::{
    AdapterDescriptor, AdapterSession, AdapterStage, IndexMapping, MergeEngine, ParameterTarget,
    RankOptions, Resolution, identity_mapping, module_keys,
};
use weightpatch_store::{FileStoreOpener, StoreOpener, WeightStore};

use super::OutputFormat;

/// Adapter list file layout:
///
/// ```toml
/// [[adapters]]
/// store_path = "style.safetensors"
/// blend_weight = 0.8
/// architecture_tag = "sdxl"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct AdapterList {
    #[serde(default)]
    pub adapters: Vec<AdapterDescriptor>,
}

impl AdapterList {
    /// Parse an adapter list; relative store paths are taken relative to
    /// `path`'s directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read adapter list {}", path.display()))?;
        let mut list: AdapterList = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse adapter list {}", path.display()))?;
        if let Some(dir) = path.parent() {
            for adapter in &mut list.adapters {
                if Path::new(&adapter.store_path).is_relative() {
                    adapter.store_path = dir.join(&adapter.store_path).to_string_lossy().into_owned();
                }
            }
        }
        Ok(list)
    }
}

/// Resolve command arguments
#[derive(Debug, Args)]
pub struct ResolveCommand {
    /// Base model file
    #[arg(long, value_name = "PATH")]
    pub base: PathBuf,

    /// TOML file listing `[[adapters]]`
    #[arg(long, value_name = "PATH")]
    pub adapters: PathBuf,

    /// Parameter name to resolve
    #[arg(long)]
    pub name: String,

    /// Target shape, comma separated (e.g. 320,320,3,3)
    #[arg(long, value_delimiter = ',', required = true)]
    pub shape: Vec<usize>,

    /// Precision of the delivered tensor
    #[arg(long, default_value = "f32")]
    pub dtype: Precision,

    /// Architecture to load adapters for (default: first adapter's tag)
    #[arg(long)]
    pub architecture: Option<String>,

    /// Model stage being loaded (all, base, refiner)
    #[arg(long, default_value = "all")]
    pub stage: AdapterStage,

    /// Resolve the way a fused low-rank model loads it
    #[arg(long)]
    pub fused: bool,

    /// Fused index mapping entries `fused:original`; identity when empty
    #[arg(long = "map", value_name = "I:J")]
    pub mapping: Vec<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl ResolveCommand {
    pub fn execute(&self, config: &WeightPatchConfig) -> Result<()> {
        let list = AdapterList::load(&self.adapters)?;
        let architecture = match (&self.architecture, list.adapters.first()) {
            (Some(arch), _) => arch.clone(),
            (None, Some(first)) => first.architecture_tag.clone(),
            (None, None) => String::new(),
        };

        let opener = FileStoreOpener::new();
        let base_path = self.base.to_string_lossy();
        let base = opener.open(&base_path).with_context(|| format!("Failed to open base {base_path}"))?;
        let session = AdapterSession::open(&list.adapters, &architecture, self.stage, &opener)
            .context("Failed to open adapter session")?;

        let engine = MergeEngine::new(&config.merge);
        let target = ParameterTarget::new(self.shape.clone(), self.dtype.dtype());

        let resolution = if self.fused {
            let model_file = base_path.to_string();
            let options = RankOptions::from_config(&config.merge).with_model_file(model_file.clone());
            let base_entry: (&str, &dyn WeightStore) = (model_file.as_str(), base.as_ref());
            let files = std::iter::once(base_entry).chain(session.files());
            let report = weightpatch_merge::compute_rank(files, &options);
            let mapping = self.index_mapping(&session, &model_file, &config.merge.key_prefix)?;
            engine.resolve_parameter(&self.name, &target, base.as_ref(), &session, &mapping, &report)?
        } else {
            engine.resolve(&self.name, &target, base.as_ref(), &session, None)?
        };
        let kind = kind(&resolution);
        info!(key = %self.name, kind, "resolved parameter");

        let tensor = resolution.materialize(base.as_ref(), target.dtype, engine.codecs())?;
        self.print(kind, tensor.as_ref())
    }

    fn index_mapping(&self, session: &AdapterSession, model_file: &str, prefix: &str) -> Result<IndexMapping> {
        if self.mapping.is_empty() {
            let modules = module_keys(session.files(), Some(model_file), prefix);
            return Ok(identity_mapping(modules.len()));
        }
        let mut mapping = IndexMapping::new();
        for entry in &self.mapping {
            let Some((from, to)) = entry.split_once(':') else {
                bail!("mapping entry {entry:?} is not of the form I:J");
            };
            let from = from.trim().parse().with_context(|| format!("bad mapping index in {entry:?}"))?;
            let to = to.trim().parse().with_context(|| format!("bad mapping index in {entry:?}"))?;
            mapping.insert(from, to);
        }
        Ok(mapping)
    }

    fn print(&self, kind: &str, tensor: Option<&Tensor>) -> Result<()> {
        let summary = tensor.map(summarize).transpose()?;
        match self.format {
            OutputFormat::Json => {
                let value = json!({
                    "name": self.name,
                    "resolution": kind,
                    "shape": tensor.map(|t| t.dims().to_vec()),
                    "dtype": tensor.map(|t| format!("{:?}", t.dtype())),
                    "stats": summary.map(|s| json!({"min": s.min, "max": s.max, "mean": s.mean})),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            OutputFormat::Text => {
                println!("{} {} ({kind})", style("Parameter:").bold(), self.name);
                match (tensor, summary) {
                    (Some(t), Some(s)) => {
                        println!("  shape: {:?}", t.dims());
                        println!("  dtype: {:?}", t.dtype());
                        println!("  min {:.6}  max {:.6}  mean {:.6}", s.min, s.max, s.mean);
                    }
                    _ => println!("  {}", style("no value available").yellow()),
                }
            }
        }
        Ok(())
    }
}

fn kind(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Redirect(_) => "redirect",
        Resolution::Fallthrough => "fallthrough",
        Resolution::Value(_) => "value",
    }
}

#[derive(Debug, Clone, Copy)]
struct Summary {
    min: f32,
    max: f32,
    mean: f32,
}

fn summarize(tensor: &Tensor) -> Result<Summary> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    if values.is_empty() {
        return Ok(Summary { min: 0.0, max: 0.0, mean: 0.0 });
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    #[allow(clippy::cast_precision_loss)]
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    Ok(Summary { min, max, mean })
}
