//! Precision, codec and memory-layout enums used by configuration and stores.

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Floating point precision a tensor is computed in or delivered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    BF16,
    F32,
    F64,
}

impl Precision {
    /// The candle dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
        }
    }

    /// Map a candle dtype back to a precision; integer dtypes have none.
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F16 => Some(Self::F16),
            DType::BF16 => Some(Self::BF16),
            DType::F32 => Some(Self::F32),
            DType::F64 => Some(Self::F64),
            _ => None,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::F32 => write!(f, "f32"),
            Self::F64 => write!(f, "f64"),
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            "f32" | "float32" => Ok(Self::F32),
            "f64" | "float64" => Ok(Self::F64),
            other => Err(format!("unknown precision: {other}")),
        }
    }
}

/// Compression codec attached to a stored tensor entry.
///
/// Readers pass an ordered list of codecs they can decode. Uncompressed
/// entries are readable by every reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Uncompressed,
    /// 6-bit palettized.
    #[serde(rename = "q6p")]
    Palette6,
    /// 8-bit palettized.
    #[serde(rename = "q8p")]
    Palette8,
    /// Entropy-coded 7-bit mantissa.
    Ezm7,
    /// Payload lives in a side file next to the store.
    External,
}

impl Codec {
    /// Codecs a loader accepts unless configured otherwise.
    pub const DEFAULT_ACCEPTED: [Codec; 4] =
        [Codec::Palette6, Codec::Palette8, Codec::Ezm7, Codec::External];

    pub fn is_compressed(self) -> bool {
        !matches!(self, Self::Uncompressed)
    }

    /// Whether an entry encoded with `self` can be read by a caller that
    /// accepts `acceptable`.
    pub fn accepted_by(self, acceptable: &[Codec]) -> bool {
        !self.is_compressed() || acceptable.contains(&self)
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncompressed => write!(f, "uncompressed"),
            Self::Palette6 => write!(f, "q6p"),
            Self::Palette8 => write!(f, "q8p"),
            Self::Ezm7 => write!(f, "ezm7"),
            Self::External => write!(f, "external"),
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "uncompressed" | "none" => Ok(Self::Uncompressed),
            "q6p" => Ok(Self::Palette6),
            "q8p" => Ok(Self::Palette8),
            "ezm7" => Ok(Self::Ezm7),
            "external" => Ok(Self::External),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

/// How the weight cache relates to the device that runs the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySubsystem {
    /// Host and device share memory; cached tensors are handed over as-is and
    /// leave the cache on detach.
    #[default]
    Unified,
    /// Separate device memory; the cache keeps a host copy and detach copies it
    /// onto the device without giving up the entry.
    Discrete,
}

impl std::fmt::Display for MemorySubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unified => write!(f, "unified"),
            Self::Discrete => write!(f, "discrete"),
        }
    }
}

impl std::str::FromStr for MemorySubsystem {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unified" | "uma" => Ok(Self::Unified),
            "discrete" | "dgpu" => Ok(Self::Discrete),
            other => Err(format!("unknown memory subsystem: {other}")),
        }
    }
}
