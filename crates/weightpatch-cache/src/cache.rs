//! In-memory weight cache with size-based eviction.
//!
//! Provides [`BoundedWeightCache`], keyed by source file identity, holding
//! fully materialized weight sets under a total byte budget. When room is
//! needed the *smallest* entries go first: small weight sets are cheap to
//! reload, large ones are the ones worth keeping resident.
//!
//! The cache is plain mutable state. Callers sharing one instance across
//! threads must serialize access themselves (e.g. a `Mutex` around it).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use candle_core::{Device, Tensor};
use tracing::{debug, warn};
use weightpatch_common::{CacheConfig, MemorySubsystem};

use crate::params::{LiveParameters, WeightSet};

// ── Cache entry ───────────────────────────────────────────────────────────

/// One cached weight set.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub source_id: String,
    pub weights: WeightSet,
    /// Byte size charged against the budget.
    pub total_bytes: u64,
}

impl CacheEntry {
    /// Look up a tensor by key.
    pub fn weight(&self, key: &str) -> Option<&Tensor> {
        self.weights.iter().find(|(k, _)| k == key).map(|(_, t)| t)
    }
}

// ── Statistics ────────────────────────────────────────────────────────────

/// Counters for cache activity. Hits and misses are counted by `detach`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejections: u64,
}

impl CacheStats {
    /// Hit rate as a fraction in `[0.0, 1.0]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

// ── BoundedWeightCache ────────────────────────────────────────────────────

/// Size-bounded cache of weight sets keyed by source id.
///
/// `total_bytes` always equals the sum of entry sizes and never exceeds
/// `capacity_bytes` once a call returns. The heap and the map always hold
/// the same ids.
#[derive(Debug)]
pub struct BoundedWeightCache {
    capacity_bytes: u64,
    total_bytes: u64,
    memory_subsystem: MemorySubsystem,
    entries: HashMap<String, CacheEntry>,
    by_size: BinaryHeap<Reverse<(u64, String)>>,
    stats: CacheStats,
}

impl BoundedWeightCache {
    pub fn new(capacity_bytes: u64, memory_subsystem: MemorySubsystem) -> Self {
        Self {
            capacity_bytes,
            total_bytes: 0,
            memory_subsystem,
            entries: HashMap::new(),
            by_size: BinaryHeap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity_bytes, config.memory_subsystem)
    }

    /// Look up a cached entry. Never changes cache state.
    pub fn get(&self, source_id: &str) -> Option<&CacheEntry> {
        self.entries.get(source_id)
    }

    /// Insert `weights` under `source_id`, charging `size` bytes.
    ///
    /// Returns `false` when the entry is rejected: it is larger than the
    /// whole budget, or it is smaller than every cached entry and would only
    /// fit by evicting them. Replacing an existing id keeps the old entry if
    /// the new one is rejected.
    pub fn put(&mut self, source_id: impl Into<String>, weights: WeightSet, size: u64) -> bool {
        let source_id = source_id.into();
        let previous = self.remove(&source_id);
        let entry = CacheEntry { source_id, weights, total_bytes: size };
        match self.admit(entry) {
            Ok(()) => true,
            Err(rejected) => {
                self.stats.rejections += 1;
                debug!(source = %rejected.source_id, size, "cache entry rejected");
                if let Some(previous) = previous {
                    self.insert(previous);
                }
                false
            }
        }
    }

    /// Remove and return the entry for `source_id`.
    pub fn remove(&mut self, source_id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(source_id)?;
        self.by_size = self
            .entries
            .values()
            .map(|e| Reverse((e.total_bytes, e.source_id.clone())))
            .collect();
        self.total_bytes -= entry.total_bytes;
        Some(entry)
    }

    /// Hand the cached weights for `source_id` to `parameters`.
    ///
    /// Unified memory moves the tensors out and drops the entry; discrete
    /// memory copies them onto the parameters' device and keeps the entry.
    /// Returns whether anything was transferred.
    pub fn detach(&mut self, source_id: &str, parameters: &mut dyn LiveParameters) -> bool {
        let transferred = match self.memory_subsystem {
            MemorySubsystem::Unified => match self.remove(source_id) {
                Some(entry) => {
                    parameters.attach_consuming(entry.weights);
                    true
                }
                None => false,
            },
            MemorySubsystem::Discrete => match self.entries.get(source_id) {
                Some(entry) => match parameters.attach_from(&entry.weights) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(source = %source_id, error = %e, "copying cached weights failed");
                        false
                    }
                },
                None => false,
            },
        };
        if transferred {
            self.stats.hits += 1;
            debug!(source = %source_id, "detached cached weights");
        } else {
            self.stats.misses += 1;
        }
        transferred
    }

    /// Capture the current contents of `parameters` as the entry for
    /// `source_id`.
    ///
    /// Fused low-rank factor tensors are not kept, but the entry is charged
    /// the full parameter size. Unified memory takes the tensors out of
    /// `parameters`; discrete memory stores a host copy and leaves an
    /// existing entry alone.
    pub fn attach(&mut self, source_id: &str, parameters: &mut dyn LiveParameters) {
        if self.capacity_bytes == 0 {
            return;
        }
        let size = parameters.byte_size();
        let weights = match self.memory_subsystem {
            MemorySubsystem::Unified => parameters.take_weights(),
            MemorySubsystem::Discrete => {
                if self.entries.contains_key(source_id) {
                    return;
                }
                match parameters.copy_weights(&Device::Cpu) {
                    Ok(weights) => weights,
                    Err(e) => {
                        warn!(source = %source_id, error = %e, "copying live weights failed");
                        return;
                    }
                }
            }
        };
        let weights = weights
            .into_iter()
            .filter(|(key, _)| !key.contains("lora_down") && !key.contains("lora_up"))
            .collect();
        self.put(source_id, weights, size);
    }

    /// Change the budget; shrinking evicts immediately.
    pub fn set_capacity(&mut self, capacity_bytes: u64) {
        let shrinking = capacity_bytes < self.capacity_bytes;
        self.capacity_bytes = capacity_bytes;
        if shrinking {
            self.evict_for(0);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_size.clear();
        self.total_bytes = 0;
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.entries.contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn memory_subsystem(&self) -> MemorySubsystem {
        self.memory_subsystem
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Cached source ids, smallest entry first.
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.by_size.iter().map(|Reverse(item)| item.clone()).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    // ── private helpers ──────────────────────────────────────────────

    fn admit(&mut self, entry: CacheEntry) -> Result<(), CacheEntry> {
        let size = entry.total_bytes;
        if size > self.capacity_bytes {
            return Err(entry);
        }
        if let Some(Reverse((smallest, _))) = self.by_size.peek()
            && size < *smallest
            && !self.fits(size)
        {
            return Err(entry);
        }
        self.evict_for(size);
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.total_bytes += entry.total_bytes;
        self.by_size.push(Reverse((entry.total_bytes, entry.source_id.clone())));
        self.entries.insert(entry.source_id.clone(), entry);
    }

    /// Whether `needed` more bytes fit without eviction.
    fn fits(&self, needed: u64) -> bool {
        self.total_bytes <= self.capacity_bytes && needed <= self.capacity_bytes - self.total_bytes
    }

    /// Evict smallest-first until `needed` more bytes fit.
    fn evict_for(&mut self, needed: u64) {
        while !self.fits(needed) {
            let Some(Reverse((size, source_id))) = self.by_size.pop() else {
                break;
            };
            if self.entries.remove(&source_id).is_some() {
                self.total_bytes -= size;
                self.stats.evictions += 1;
                debug!(source = %source_id, size, "evicted cache entry");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterMap;
    use candle_core::DType;

    fn cache(capacity: u64) -> BoundedWeightCache {
        BoundedWeightCache::new(capacity, MemorySubsystem::Unified)
    }

    fn weights(key: &str) -> WeightSet {
        vec![(key.to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap())]
    }

    // ── put / get ────────────────────────────────────────────────

    #[test]
    fn put_then_get() {
        let mut c = cache(100);
        assert!(c.put("a", weights("w"), 10));
        let entry = c.get("a").unwrap();
        assert_eq!(entry.total_bytes, 10);
        assert!(entry.weight("w").is_some());
        assert_eq!(c.total_bytes(), 10);
        assert!(c.get("b").is_none());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let mut c = cache(50);
        c.put("a", weights("w"), 20);
        assert!(!c.put("big", weights("w"), 51));
        assert_eq!(c.len(), 1);
        assert_eq!(c.total_bytes(), 20);
        assert_eq!(c.stats().rejections, 1);
    }

    #[test]
    fn small_newcomer_does_not_evict_larger_entries() {
        let mut c = cache(50);
        c.put("a", weights("w"), 20);
        c.put("b", weights("w"), 25);
        assert!(!c.put("tiny", weights("w"), 10));
        assert!(c.contains("a") && c.contains("b"));
    }

    #[test]
    fn evicts_smallest_first() {
        let mut c = cache(50);
        c.put("ten", weights("w"), 10);
        c.put("twenty", weights("w"), 20);
        c.put("fifteen", weights("w"), 15);
        assert!(c.put("twenty_five", weights("w"), 25));
        assert!(!c.contains("ten"));
        assert!(!c.contains("fifteen"));
        assert!(c.contains("twenty"));
        assert_eq!(c.total_bytes(), 45);
        assert_eq!(c.stats().evictions, 2);
    }

    #[test]
    fn replacing_keeps_old_entry_on_rejection() {
        let mut c = cache(50);
        c.put("a", weights("old"), 20);
        assert!(!c.put("a", weights("new"), 60));
        assert!(c.get("a").unwrap().weight("old").is_some());
        assert_eq!(c.total_bytes(), 20);

        assert!(c.put("a", weights("new"), 30));
        assert_eq!(c.total_bytes(), 30);
        assert_eq!(c.len(), 1);
    }

    // ── remove / clear / capacity ────────────────────────────────

    #[test]
    fn remove_updates_total() {
        let mut c = cache(100);
        c.put("a", weights("w"), 10);
        c.put("b", weights("w"), 20);
        assert_eq!(c.remove("a").unwrap().total_bytes, 10);
        assert!(c.remove("a").is_none());
        assert_eq!(c.total_bytes(), 20);
        assert_eq!(c.source_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn shrinking_capacity_evicts() {
        let mut c = cache(100);
        c.put("a", weights("w"), 10);
        c.put("b", weights("w"), 40);
        c.set_capacity(45);
        assert!(!c.contains("a"));
        assert!(c.contains("b"));
        assert_eq!(c.capacity_bytes(), 45);
    }

    #[test]
    fn clear_resets_everything() {
        let mut c = cache(100);
        c.put("a", weights("w"), 10);
        c.clear();
        assert!(c.is_empty());
        assert_eq!(c.total_bytes(), 0);
        assert!(c.put("b", weights("w"), 100));
    }

    // ── detach / attach ──────────────────────────────────────────

    #[test]
    fn unified_detach_moves_entry_out() {
        let mut c = cache(1 << 20);
        let mut live = ParameterMap::default();
        live.insert("unet.w", Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap());
        c.attach("model.safetensors", &mut live);
        assert!(live.is_empty());
        assert!(c.contains("model.safetensors"));

        let mut target = ParameterMap::default();
        assert!(c.detach("model.safetensors", &mut target));
        assert!(!c.contains("model.safetensors"));
        assert_eq!(target.len(), 1);
        assert!(!c.detach("model.safetensors", &mut target));
        assert_eq!(c.stats().hits, 1);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn attach_drops_fused_factors_but_charges_full_size() {
        let mut c = cache(1 << 20);
        let mut live = ParameterMap::default();
        live.insert("w", Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        live.insert("__dit__[t-lora_up-0-0]", Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        c.attach("m", &mut live);
        let entry = c.get("m").unwrap();
        assert_eq!(entry.weights.len(), 1);
        assert_eq!(entry.total_bytes, 32);
    }

    #[test]
    fn attach_is_noop_without_capacity() {
        let mut c = cache(0);
        let mut live = ParameterMap::default();
        live.insert("w", Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        c.attach("m", &mut live);
        assert!(c.is_empty());
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn discrete_detach_copies_and_keeps_entry() {
        let mut c = BoundedWeightCache::new(1 << 20, MemorySubsystem::Discrete);
        let mut live = ParameterMap::default();
        live.insert("w", Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        c.attach("m", &mut live);
        assert_eq!(live.len(), 1);

        // second attach for the same id is ignored
        let mut other = ParameterMap::default();
        other.insert("w2", Tensor::ones(8, DType::F32, &Device::Cpu).unwrap());
        c.attach("m", &mut other);
        assert!(c.get("m").unwrap().weight("w2").is_none());

        let mut target = ParameterMap::default();
        assert!(c.detach("m", &mut target));
        assert!(c.contains("m"));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn near_max_budget_does_not_overflow() {
        let mut c = cache(u64::MAX);
        assert!(c.put("a", weights("w"), 10));
        assert!(c.put("b", weights("w"), u64::MAX - 5));
        assert!(!c.contains("a"));
        assert_eq!(c.total_bytes(), u64::MAX - 5);

        assert!(!c.put("c", weights("w"), 6));
        assert!(c.put("d", weights("w"), u64::MAX));
        assert_eq!(c.source_ids(), vec!["d".to_string()]);
    }

    #[test]
    fn hit_rate_fraction() {
        let stats = CacheStats { hits: 3, misses: 1, ..Default::default() };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
