//! Memory-mapped SafeTensors weight store.
//!
//! The header is parsed once at open time to record where each tensor's bytes
//! live inside the map; payloads are decoded only when a key is read.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use ::safetensors::{Dtype, SafeTensors};
use tracing::{debug, info, warn};
use weightpatch_common::{Codec, Result, WeightPatchError};

use crate::store::{TensorInfo, WeightStore, apply_precision};

#[derive(Debug, Clone)]
struct Entry {
    info: TensorInfo,
    start: usize,
    end: usize,
}

/// Read-only store over a `.safetensors` file.
pub struct SafeTensorsStore {
    path: PathBuf,
    mmap: Mmap,
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for SafeTensorsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorsStore")
            .field("path", &self.path)
            .field("tensor_count", &self.entries.len())
            .field("mapped_bytes", &self.mmap.len())
            .finish()
    }
}

impl SafeTensorsStore {
    /// Map `path` and index its tensors.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the map is read-only and no store writes to its backing file.
        let mmap = unsafe { Mmap::map(&file)? };

        let entries = {
            let st = SafeTensors::deserialize(&mmap)
                .map_err(|e| WeightPatchError::Format(format!("{}: {e}", path.display())))?;
            let base = mmap.as_ptr() as usize;
            let mut entries = HashMap::new();
            for (name, view) in st.tensors() {
                let Some(dtype) = candle_dtype(view.dtype()) else {
                    warn!(key = %name, dtype = ?view.dtype(), "skipping tensor with unsupported dtype");
                    continue;
                };
                let data = view.data();
                let start = data.as_ptr() as usize - base;
                let info = TensorInfo::new(view.shape().to_vec(), dtype, Codec::Uncompressed);
                entries.insert(name, Entry { info, start, end: start + data.len() });
            }
            entries
        };

        info!(path = %path.display(), tensors = entries.len(), "opened safetensors store");
        Ok(Self { path: path.to_path_buf(), mmap, entries })
    }

    /// Path the store was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of readable tensors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn candle_dtype(dtype: Dtype) -> Option<DType> {
    match dtype {
        Dtype::F16 => Some(DType::F16),
        Dtype::BF16 => Some(DType::BF16),
        Dtype::F32 => Some(DType::F32),
        Dtype::F64 => Some(DType::F64),
        Dtype::U8 => Some(DType::U8),
        Dtype::U32 => Some(DType::U32),
        Dtype::I64 => Some(DType::I64),
        _ => None,
    }
}

impl WeightStore for SafeTensorsStore {
    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn read_like(&self, key: &str) -> Option<TensorInfo> {
        self.entries.get(key).map(|e| e.info.clone())
    }

    fn read(&self, key: &str, precision: Option<DType>, codecs: &[Codec]) -> Result<Option<Tensor>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !entry.info.codec.accepted_by(codecs) {
            return Ok(None);
        }
        let bytes = self
            .mmap
            .get(entry.start..entry.end)
            .ok_or_else(|| WeightPatchError::store(key, "payload outside mapped file"))?;
        debug!(key = %key, bytes = bytes.len(), "decoding tensor");
        let tensor = Tensor::from_raw_buffer(bytes, entry.info.dtype, &entry.info.shape, &Device::Cpu)
            .map_err(|e| WeightPatchError::store(key, e))?;
        apply_precision(tensor, precision).map(Some)
    }
}
