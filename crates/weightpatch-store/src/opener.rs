//! Path-to-store resolution.
//!
//! Adapter descriptors and the base model are named by path. A [`StoreOpener`]
//! turns those paths into shared [`WeightStore`] handles, so sessions never
//! touch the filesystem directly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use weightpatch_common::{Result, WeightPatchError};

use crate::safetensors::SafeTensorsStore;
use crate::store::WeightStore;

/// Resolves a store path to a readable store.
pub trait StoreOpener: Send + Sync {
    fn open(&self, path: &str) -> Result<Arc<dyn WeightStore>>;
}

/// Opens `.safetensors` files from disk, memoizing each mapped file.
#[derive(Default)]
pub struct FileStoreOpener {
    opened: RwLock<HashMap<String, Arc<dyn WeightStore>>>,
}

impl std::fmt::Debug for FileStoreOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.opened.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("FileStoreOpener").field("opened", &count).finish()
    }
}

impl FileStoreOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn can_open(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("safetensors"))
    }
}

impl StoreOpener for FileStoreOpener {
    fn open(&self, path: &str) -> Result<Arc<dyn WeightStore>> {
        if let Ok(opened) = self.opened.read()
            && let Some(store) = opened.get(path)
        {
            debug!(path, "reusing mapped store");
            return Ok(Arc::clone(store));
        }

        let fs_path = Path::new(path);
        if !Self::can_open(fs_path) {
            return Err(WeightPatchError::Format(format!(
                "{path}: expected a .safetensors file"
            )));
        }
        let store: Arc<dyn WeightStore> = Arc::new(SafeTensorsStore::open(fs_path)?);
        if let Ok(mut opened) = self.opened.write() {
            opened.insert(path.to_string(), Arc::clone(&store));
        }
        Ok(store)
    }
}

/// Fixed mapping from path to an already-built store.
#[derive(Default, Clone)]
pub struct StoreCatalog {
    stores: HashMap<String, Arc<dyn WeightStore>>,
}

impl std::fmt::Debug for StoreCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut paths: Vec<_> = self.stores.keys().collect();
        paths.sort();
        f.debug_struct("StoreCatalog").field("paths", &paths).finish()
    }
}

impl StoreCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` under `path`, replacing any previous entry.
    pub fn insert(&mut self, path: impl Into<String>, store: impl WeightStore + 'static) {
        self.insert_shared(path, Arc::new(store));
    }

    pub fn insert_shared(&mut self, path: impl Into<String>, store: Arc<dyn WeightStore>) {
        let path = path.into();
        info!(path = %path, "registered store");
        self.stores.insert(path, store);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, path: impl Into<String>, store: impl WeightStore + 'static) -> Self {
        self.insert(path, store);
        self
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl StoreOpener for StoreCatalog {
    fn open(&self, path: &str) -> Result<Arc<dyn WeightStore>> {
        self.stores
            .get(path)
            .cloned()
            .ok_or_else(|| WeightPatchError::StoreNotFound(path.to_string()))
    }
}
