//! Error types shared across the weightpatch crates.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced while reading stores, merging adapters or loading config.
///
/// Absent adapter data and shape mismatches are not errors: the merge engine
/// recovers from both locally. What remains here is what a caller can act on.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum WeightPatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("store read failed for `{key}`: {reason}")]
    Store { key: String, reason: String },

    #[error("malformed weight file: {0}")]
    Format(String),

    #[error("no weight store registered for path: {0}")]
    StoreNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl WeightPatchError {
    /// Build a [`WeightPatchError::Store`] for `key`.
    pub fn store(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Store { key: key.into(), reason: reason.to_string() }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, WeightPatchError>;
