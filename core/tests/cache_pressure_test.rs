use std::collections::HashSet;
use std::sync::Arc;

use wselector_core::cache::{Cache, CacheValue, PressureOutcome, PressurePolicy};
use wselector_core::codec::Thumbnail;
use wselector_core::{AssetKey, CacheBudget, Resolution};

fn thumbnail(bytes: usize) -> CacheValue {
    CacheValue::Decoded(Arc::new(Thumbnail {
        dimensions: Resolution { width: 1, height: 1 },
        pixels: vec![7; bytes],
    }))
}

/// Small deterministic generator so the operation mix is reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn resident_size_respects_budget_outside_of_pins() {
    let budget = 4_096;
    let mut cache = Cache::new(CacheBudget { bytes_max: budget });
    let mut rng = Lcg(42);
    let mut pinned: HashSet<String> = HashSet::new();

    for step in 0..2_000 {
        let key = format!("thumb::{}", rng.next(64));
        match rng.next(10) {
            0 => {
                if !pinned.contains(&key) && cache.pin(&key) {
                    pinned.insert(key);
                }
            }
            1 => {
                if pinned.remove(&key) {
                    cache.unpin(&key);
                }
            }
            2 => {
                cache.get(&key);
            }
            _ => {
                cache.put(key, thumbnail(1 + rng.next(900) as usize), None);
            }
        }

        let pinned_bytes: usize = pinned
            .iter()
            .filter_map(|key| cache.get(key))
            .map(|hit| hit.size)
            .sum();
        assert!(
            cache.bytes_used() <= budget.max(pinned_bytes),
            "step {step}: {} resident, {pinned_bytes} pinned",
            cache.bytes_used()
        );
    }
}

#[test]
fn pinned_entries_survive_any_amount_of_pressure() {
    let policy = PressurePolicy { floor_bytes: 100, ..PressurePolicy::default() };
    let mut cache = Cache::with_policy(CacheBudget { bytes_max: 1_000 }, policy);
    cache.put("thumb::visible", thumbnail(300), None);
    assert!(cache.pin("thumb::visible"));
    for i in 0..6 {
        cache.put(format!("thumb::{i}"), thumbnail(100), None);
    }

    let evicted = cache.evict_under_pressure(0);
    assert!(!evicted.reached_target);
    assert!(cache.contains("thumb::visible"));
    assert_eq!(cache.len(), 1);

    assert!(matches!(cache.on_pressure(99), PressureOutcome::Unrelieved { pinned_bytes: 300, .. }));
    cache.unpin("thumb::visible");
    assert!(!cache.contains("thumb::visible"), "unpinning under pressure releases the entry");
}

#[test]
fn asset_references_are_charged_by_size_hint() {
    let mut cache = Cache::new(CacheBudget { bytes_max: 10_000 });
    let key = AssetKey::new("full::abc123", "jpg");
    assert!(cache.put("full::abc123", CacheValue::Asset(key.clone()), Some(6_000)));
    assert!(!cache.put("full::def456", CacheValue::Asset(key), Some(20_000)));
    assert_eq!(cache.bytes_used(), 6_000);

    cache.on_pressure(90);
    assert_eq!(cache.budget(), 5_000);
    assert!(cache.is_empty());

    cache.on_pressure(10);
    assert_eq!(cache.budget(), 10_000);
}
