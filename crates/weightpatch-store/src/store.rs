//! Read-only, key-addressed tensor store abstraction.
//!
//! Provides the [`WeightStore`] trait every model and adapter file is read
//! through, plus [`InMemoryStore`] (built with [`StoreBuilder`]) for weights
//! that already live in RAM.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::debug;
use weightpatch_common::{Codec, Result};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Lightweight metadata about a stored tensor (no data payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Shape dimensions (e.g. `[320, 4, 3, 3]`).
    pub shape: Vec<usize>,
    /// Element data type as stored.
    pub dtype: DType,
    /// Codec the payload is encoded with.
    pub codec: Codec,
    /// Total byte size of the decoded tensor data.
    pub size: u64,
}

impl TensorInfo {
    pub fn new(shape: Vec<usize>, dtype: DType, codec: Codec) -> Self {
        let size = (shape.iter().product::<usize>() * dtype.size_in_bytes()) as u64;
        Self { shape, dtype, codec, size }
    }

    /// Number of elements in the tensor.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Common interface for reading tensors regardless of the backing container.
///
/// Stores are never mutated by readers, so a store can be shared between
/// sessions running on different threads.
pub trait WeightStore: Send + Sync + std::fmt::Debug {
    /// All keys in the store, sorted.
    fn keys(&self) -> Vec<String>;

    /// Check whether a tensor with the given key exists.
    fn contains(&self, key: &str) -> bool;

    /// Shape, dtype and codec of a tensor without materializing its data.
    fn read_like(&self, key: &str) -> Option<TensorInfo>;

    /// Read a tensor, cast to `precision` when given.
    ///
    /// Returns `Ok(None)` when the key is absent or its codec is not in
    /// `codecs`. Errors are reserved for payloads that exist but cannot be
    /// decoded.
    fn read(&self, key: &str, precision: Option<DType>, codecs: &[Codec]) -> Result<Option<Tensor>>;
}

pub(crate) fn apply_precision(tensor: Tensor, precision: Option<DType>) -> Result<Tensor> {
    match precision {
        Some(dtype) if dtype != tensor.dtype() => Ok(tensor.to_dtype(dtype)?),
        _ => Ok(tensor),
    }
}

// ---------------------------------------------------------------------------
// InMemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredTensor {
    tensor: Tensor,
    codec: Codec,
}

/// Eagerly stores every tensor in RAM.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tensors: HashMap<String, StoredTensor>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an uncompressed tensor.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.insert_with_codec(key, tensor, Codec::Uncompressed);
    }

    /// Insert a tensor tagged with the codec it is stored under.
    pub fn insert_with_codec(&mut self, key: impl Into<String>, tensor: Tensor, codec: Codec) {
        self.tensors.insert(key.into(), StoredTensor { tensor, codec });
    }

    /// Number of tensors held.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightStore for InMemoryStore {
    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.tensors.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    fn read_like(&self, key: &str) -> Option<TensorInfo> {
        self.tensors
            .get(key)
            .map(|s| TensorInfo::new(s.tensor.dims().to_vec(), s.tensor.dtype(), s.codec))
    }

    fn read(&self, key: &str, precision: Option<DType>, codecs: &[Codec]) -> Result<Option<Tensor>> {
        let Some(stored) = self.tensors.get(key) else {
            return Ok(None);
        };
        if !stored.codec.accepted_by(codecs) {
            debug!(key = %key, codec = %stored.codec, "codec not acceptable to reader");
            return Ok(None);
        }
        apply_precision(stored.tensor.clone(), precision).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`InMemoryStore`] instances.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    store: InMemoryStore,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an uncompressed tensor.
    pub fn tensor(mut self, key: impl Into<String>, tensor: Tensor) -> Self {
        self.store.insert(key, tensor);
        self
    }

    /// Add a tensor stored under `codec`.
    pub fn encoded(mut self, key: impl Into<String>, tensor: Tensor, codec: Codec) -> Self {
        self.store.insert_with_codec(key, tensor, codec);
        self
    }

    /// Add an `f32` tensor from a flat vector.
    pub fn f32(self, key: impl Into<String>, data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let tensor = Tensor::from_vec(data, shape, &candle_core::Device::Cpu)?;
        Ok(self.tensor(key, tensor))
    }

    pub fn build(self) -> InMemoryStore {
        self.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
