//! Common types for weightpatch
//!
//! Error taxonomy, precision and codec enums, and the configuration layer
//! shared by the store, merge, cache and CLI crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, ConfigError, MergeConfig, WeightPatchConfig};
pub use error::{Result, WeightPatchError};
pub use types::{Codec, MemorySubsystem, Precision};
