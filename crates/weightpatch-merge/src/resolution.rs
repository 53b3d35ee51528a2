//! Outcome of resolving one parameter.

use candle_core::{DType, Tensor};
use weightpatch_common::{Codec, Result};
use weightpatch_store::WeightStore;

/// Shape and precision the consuming model expects for a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterTarget {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl ParameterTarget {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self { shape: shape.into(), dtype }
    }
}

/// What the loader should do for a parameter.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Load this base-store key as-is.
    Redirect(String),
    /// No value could be produced; keep the model's initialized value.
    Fallthrough,
    /// Use this tensor.
    Value(Tensor),
}

impl Resolution {
    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn into_value(self) -> Option<Tensor> {
        match self {
            Self::Value(t) => Some(t),
            _ => None,
        }
    }

    /// Turn the resolution into a tensor, reading redirects from `base`.
    pub fn materialize(
        self,
        base: &dyn WeightStore,
        dtype: DType,
        codecs: &[Codec],
    ) -> Result<Option<Tensor>> {
        match self {
            Self::Value(t) => Ok(Some(t)),
            Self::Fallthrough => Ok(None),
            Self::Redirect(key) => base.read(&key, Some(dtype), codecs),
        }
    }
}
