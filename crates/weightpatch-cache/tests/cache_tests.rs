//! Integration tests for the bounded weight cache.

use candle_core::{DType, Device, Tensor};
use proptest::prelude::*;
use weightpatch_cache::{BoundedWeightCache, LiveParameters, ParameterMap, WeightSet};
use weightpatch_common::{CacheConfig, MemorySubsystem};

fn weights(n: usize) -> WeightSet {
    vec![("w".to_string(), Tensor::zeros(n, DType::F32, &Device::Cpu).unwrap())]
}

fn live_params() -> ParameterMap {
    let mut p = ParameterMap::default();
    let a = Tensor::arange(0f32, 6., &Device::Cpu).unwrap().reshape((2, 3)).unwrap();
    let b = Tensor::arange(0f32, 4., &Device::Cpu).unwrap().to_dtype(DType::F16).unwrap();
    p.insert("text_encoder.embed", a);
    p.insert("text_encoder.norm", b);
    p
}

fn snapshot(p: &ParameterMap) -> Vec<(String, Vec<f32>)> {
    p.iter()
        .map(|(k, t)| {
            let v = t.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (k.clone(), v)
        })
        .collect()
}

#[test]
fn eviction_goes_in_increasing_size_order() {
    let mut cache = BoundedWeightCache::new(60, MemorySubsystem::Unified);
    assert!(cache.put("ten", weights(1), 10));
    assert!(cache.put("twenty", weights(1), 20));
    assert!(cache.put("thirty", weights(1), 30));

    assert!(cache.put("new", weights(1), 25));
    assert!(!cache.contains("ten"));
    assert!(!cache.contains("twenty"));
    assert!(cache.contains("thirty"));
    assert!(cache.contains("new"));
    assert_eq!(cache.total_bytes(), 55);
    assert_eq!(cache.source_ids(), vec!["new".to_string(), "thirty".to_string()]);
}

#[test]
fn oversized_insert_leaves_state_unchanged() {
    let mut cache = BoundedWeightCache::new(50, MemorySubsystem::Unified);
    cache.put("a", weights(1), 10);
    cache.put("b", weights(1), 30);
    let before = cache.source_ids();

    assert!(!cache.put("huge", weights(1), 51));
    assert_eq!(cache.source_ids(), before);
    assert_eq!(cache.total_bytes(), 40);
}

#[test]
fn from_config_uses_budget_and_layout() {
    let config = CacheConfig { capacity_bytes: 1024, memory_subsystem: MemorySubsystem::Discrete };
    let cache = BoundedWeightCache::from_config(&config);
    assert_eq!(cache.capacity_bytes(), 1024);
    assert_eq!(cache.memory_subsystem(), MemorySubsystem::Discrete);
    assert!(cache.is_empty());
}

#[test]
fn unified_round_trip_is_bit_identical() {
    let mut cache = BoundedWeightCache::new(1 << 20, MemorySubsystem::Unified);
    let mut live = live_params();
    let expected = snapshot(&live);
    let size = live.byte_size();

    cache.attach("te.safetensors", &mut live);
    assert!(live.is_empty());
    assert_eq!(cache.total_bytes(), size);

    let mut reloaded = ParameterMap::default();
    assert!(cache.detach("te.safetensors", &mut reloaded));
    assert_eq!(snapshot(&reloaded), expected);
    assert_eq!(reloaded.get("text_encoder.norm").unwrap().dtype(), DType::F16);
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn discrete_round_trip_keeps_entry_resident() {
    let mut cache = BoundedWeightCache::new(1 << 20, MemorySubsystem::Discrete);
    let mut live = live_params();
    let expected = snapshot(&live);

    cache.attach("te.safetensors", &mut live);
    assert_eq!(snapshot(&live), expected);

    for _ in 0..2 {
        let mut reloaded = ParameterMap::default();
        assert!(cache.detach("te.safetensors", &mut reloaded));
        assert_eq!(snapshot(&reloaded), expected);
    }
    assert!(cache.contains("te.safetensors"));
    assert_eq!(cache.stats().hits, 2);
}

#[test]
fn detach_of_unknown_source_is_a_miss() {
    let mut cache = BoundedWeightCache::new(1 << 20, MemorySubsystem::Unified);
    let mut target = ParameterMap::default();
    assert!(!cache.detach("missing", &mut target));
    assert!(target.is_empty());
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn attach_that_does_not_fit_is_dropped() {
    let mut cache = BoundedWeightCache::new(8, MemorySubsystem::Unified);
    let mut live = live_params();
    cache.attach("te.safetensors", &mut live);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().rejections, 1);
}

proptest! {
    #[test]
    fn prop_total_never_exceeds_capacity(
        capacity in 0u64..200,
        sizes in prop::collection::vec(0u64..120, 1..40),
    ) {
        let mut cache = BoundedWeightCache::new(capacity, MemorySubsystem::Unified);
        for (i, size) in sizes.iter().enumerate() {
            let id = format!("src{}", i % 7);
            cache.put(id, weights(1), *size);
            prop_assert!(cache.total_bytes() <= capacity);
            let sum: u64 = cache.source_ids().iter().map(|id| cache.get(id).unwrap().total_bytes).sum();
            prop_assert_eq!(sum, cache.total_bytes());
            prop_assert_eq!(cache.source_ids().len(), cache.len());
        }
    }

    #[test]
    fn prop_shrinking_capacity_keeps_invariant(
        sizes in prop::collection::vec(1u64..50, 1..20),
        shrink_to in 0u64..100,
    ) {
        let mut cache = BoundedWeightCache::new(200, MemorySubsystem::Unified);
        for (i, size) in sizes.iter().enumerate() {
            cache.put(format!("src{i}"), weights(1), *size);
        }
        cache.set_capacity(shrink_to);
        prop_assert!(cache.total_bytes() <= shrink_to);
    }
}
