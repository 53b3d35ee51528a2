//! Bounded weight cache for weightpatch
//!
//! Keeps whole weight sets resident between model loads so a reload can
//! hand them straight back to the live parameters instead of reading the
//! source file again.

pub mod cache;
pub mod params;

pub use cache::{BoundedWeightCache, CacheEntry, CacheStats};
pub use params::{LiveParameters, ParameterMap, WeightSet};
