//! Configuration for adapter merging and the weight cache.
//!
//! Loads [`WeightPatchConfig`] from a TOML file with environment variable
//! overrides via `WEIGHTPATCH_*` prefixed variables. Everything that changes
//! how a parameter is resolved travels in these structs; nothing is read from
//! process-wide state at resolve time.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::{Codec, MemorySubsystem, Precision};

/// Settings consumed by the rank resolver and merge engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Prefix prepended to parameter names when looking up adapter keys, and
    /// required of keys considered by the rank resolver.
    /// Override: `WEIGHTPATCH_KEY_PREFIX`
    pub key_prefix: String,

    /// Codecs the loader can decode, in preference order.
    /// Override: `WEIGHTPATCH_CODECS` (comma separated)
    pub acceptable_codecs: Vec<Codec>,

    /// Precision all merge arithmetic runs in before the final cast.
    /// Override: `WEIGHTPATCH_WORKING_PRECISION`
    pub working_precision: Precision,

    /// Whether rank resolution records files that carry full weight deltas.
    /// Override: `WEIGHTPATCH_INSPECT_FULL_MERGE`
    pub inspect_full_merge: bool,

    /// Path of the base model file; it never counts as a full-merge delta.
    pub model_file: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            acceptable_codecs: Codec::DEFAULT_ACCEPTED.to_vec(),
            working_precision: Precision::F32,
            inspect_full_merge: true,
            model_file: None,
        }
    }
}

/// Settings for the bounded weight cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total byte budget (0 disables caching).
    /// Override: `WEIGHTPATCH_CACHE_CAPACITY`
    pub capacity_bytes: u64,

    /// Memory layout of the device the cached weights are handed to.
    /// Override: `WEIGHTPATCH_MEMORY_SUBSYSTEM`
    pub memory_subsystem: MemorySubsystem,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity_bytes: 0, memory_subsystem: MemorySubsystem::Unified }
    }
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightPatchConfig {
    pub merge: MergeConfig,
    pub cache: CacheConfig,
}

/// Errors that can occur when loading or validating a [`WeightPatchConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl WeightPatchConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        let cfg = Self::default();
        toml::to_string_pretty(&cfg).expect("default config should serialize")
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: WeightPatchConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration, returning an error with a descriptive
    /// message on failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let merge = &self.merge;
        if merge.acceptable_codecs.is_empty() {
            return Err(ConfigError::Validation("acceptable_codecs must not be empty".into()));
        }
        for (i, codec) in merge.acceptable_codecs.iter().enumerate() {
            if merge.acceptable_codecs[..i].contains(codec) {
                return Err(ConfigError::Validation(format!(
                    "acceptable_codecs lists {codec} more than once"
                )));
            }
        }
        if merge.key_prefix.contains(['[', ']']) {
            return Err(ConfigError::Validation(format!(
                "key_prefix must not contain brackets, got {:?}",
                merge.key_prefix
            )));
        }
        Ok(())
    }

    /// Apply `WEIGHTPATCH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("WEIGHTPATCH_KEY_PREFIX") {
            self.merge.key_prefix = val;
        }

        if let Ok(val) = std::env::var("WEIGHTPATCH_CODECS") {
            self.merge.acceptable_codecs = val
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<Codec>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|reason| ConfigError::EnvOverride {
                    key: "WEIGHTPATCH_CODECS".into(),
                    value: val.clone(),
                    reason,
                })?;
        }

        if let Ok(val) = std::env::var("WEIGHTPATCH_WORKING_PRECISION") {
            self.merge.working_precision =
                val.parse::<Precision>().map_err(|reason| ConfigError::EnvOverride {
                    key: "WEIGHTPATCH_WORKING_PRECISION".into(),
                    value: val.clone(),
                    reason,
                })?;
        }

        if let Ok(val) = std::env::var("WEIGHTPATCH_INSPECT_FULL_MERGE") {
            self.merge.inspect_full_merge = matches!(val.as_str(), "1" | "true" | "yes");
        }

        if let Ok(val) = std::env::var("WEIGHTPATCH_CACHE_CAPACITY") {
            self.cache.capacity_bytes =
                val.parse::<u64>().map_err(|e| ConfigError::EnvOverride {
                    key: "WEIGHTPATCH_CACHE_CAPACITY".into(),
                    value: val.clone(),
                    reason: e.to_string(),
                })?;
        }

        if let Ok(val) = std::env::var("WEIGHTPATCH_MEMORY_SUBSYSTEM") {
            self.cache.memory_subsystem =
                val.parse::<MemorySubsystem>().map_err(|reason| ConfigError::EnvOverride {
                    key: "WEIGHTPATCH_MEMORY_SUBSYSTEM".into(),
                    value: val.clone(),
                    reason,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 6] = [
        "WEIGHTPATCH_KEY_PREFIX",
        "WEIGHTPATCH_CODECS",
        "WEIGHTPATCH_WORKING_PRECISION",
        "WEIGHTPATCH_INSPECT_FULL_MERGE",
        "WEIGHTPATCH_CACHE_CAPACITY",
        "WEIGHTPATCH_MEMORY_SUBSYSTEM",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let cfg = WeightPatchConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.merge.working_precision, Precision::F32);
        assert_eq!(cfg.cache.capacity_bytes, 0);
    }

    #[test]
    #[serial]
    fn test_default_toml_round_trips() {
        clear_env();
        let toml_str = WeightPatchConfig::default_toml();
        let cfg = WeightPatchConfig::from_toml(&toml_str).unwrap();
        assert_eq!(cfg, WeightPatchConfig::default());
    }

    #[test]
    #[serial]
    fn test_partial_toml_keeps_defaults() {
        clear_env();
        let cfg = WeightPatchConfig::from_toml(
            r#"
[cache]
capacity_bytes = 1073741824
memory_subsystem = "discrete"
"#,
        )
        .unwrap();
        assert_eq!(cfg.cache.capacity_bytes, 1 << 30);
        assert_eq!(cfg.cache.memory_subsystem, MemorySubsystem::Discrete);
        assert_eq!(cfg.merge, MergeConfig::default());
    }

    #[test]
    #[serial]
    fn test_merge_section_parses() {
        clear_env();
        let cfg = WeightPatchConfig::from_toml(
            r#"
[merge]
key_prefix = "__te2"
acceptable_codecs = ["q8p", "ezm7"]
working_precision = "f16"
inspect_full_merge = false
model_file = "sd_xl_base.safetensors"
"#,
        )
        .unwrap();
        assert_eq!(cfg.merge.key_prefix, "__te2");
        assert_eq!(cfg.merge.acceptable_codecs, vec![Codec::Palette8, Codec::Ezm7]);
        assert_eq!(cfg.merge.working_precision, Precision::F16);
        assert!(!cfg.merge.inspect_full_merge);
        assert_eq!(cfg.merge.model_file.as_deref(), Some("sd_xl_base.safetensors"));
    }

    #[test]
    fn test_validation_rejects_empty_codecs() {
        let mut cfg = WeightPatchConfig::default();
        cfg.merge.acceptable_codecs.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_duplicate_codecs() {
        let mut cfg = WeightPatchConfig::default();
        cfg.merge.acceptable_codecs = vec![Codec::Palette8, Codec::Palette8];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("q8p"));
    }

    #[test]
    fn test_validation_rejects_bracketed_prefix() {
        let mut cfg = WeightPatchConfig::default();
        cfg.merge.key_prefix = "__unet__[".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("WEIGHTPATCH_CODECS", "q6p, external");
            std::env::set_var("WEIGHTPATCH_CACHE_CAPACITY", "4096");
            std::env::set_var("WEIGHTPATCH_MEMORY_SUBSYSTEM", "dgpu");
            std::env::set_var("WEIGHTPATCH_INSPECT_FULL_MERGE", "0");
        }
        let cfg = WeightPatchConfig::from_env().unwrap();
        clear_env();
        assert_eq!(cfg.merge.acceptable_codecs, vec![Codec::Palette6, Codec::External]);
        assert_eq!(cfg.cache.capacity_bytes, 4096);
        assert_eq!(cfg.cache.memory_subsystem, MemorySubsystem::Discrete);
        assert!(!cfg.merge.inspect_full_merge);
    }

    #[test]
    #[serial]
    fn test_bad_env_override_reports_key() {
        clear_env();
        unsafe {
            std::env::set_var("WEIGHTPATCH_WORKING_PRECISION", "int4");
        }
        let err = WeightPatchConfig::from_env().unwrap_err();
        clear_env();
        match err {
            ConfigError::EnvOverride { key, value, .. } => {
                assert_eq!(key, "WEIGHTPATCH_WORKING_PRECISION");
                assert_eq!(value, "int4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
