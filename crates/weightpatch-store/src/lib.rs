//! Tensor stores for weightpatch
//!
//! A store is a read-only, key-addressed collection of tensors. Model files
//! and adapter files are both read through [`WeightStore`].

pub mod opener;
pub mod safetensors;
pub mod store;

pub use opener::{FileStoreOpener, StoreCatalog, StoreOpener};
pub use self::safetensors::SafeTensorsStore;
pub use store::{InMemoryStore, StoreBuilder, TensorInfo, WeightStore};
