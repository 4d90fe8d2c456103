//! Pin-aware LRU cache for decoded thumbnails and asset references.

use std::sync::Arc;
use std::time::Instant;

use hashlink::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::Thumbnail;
use crate::types::{AssetKey, CacheBudget};

use super::pressure::{PressureLevel, PressureOutcome, PressurePolicy};

/// Value held by the cache. Assets are referenced by key only; their bytes stay in the store.
#[derive(Debug, Clone)]
pub enum CacheValue {
    Decoded(Arc<Thumbnail>),
    Asset(AssetKey),
}

impl CacheValue {
    fn resident_bytes(&self) -> usize {
        match self {
            CacheValue::Decoded(thumb) => thumb.resident_bytes(),
            CacheValue::Asset(_) => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CacheValue,
    pub size: usize,
    pub last_access: Instant,
    pins: u32,
}

impl CacheEntry {
    /// Outstanding pins on this entry.
    pub fn pins(&self) -> u32 {
        self.pins
    }

    /// Returns `true` while at least one pin is held.
    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

/// Snapshot returned by [`Cache::get`].
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: CacheValue,
    pub size: usize,
    pub pinned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub resident_bytes: usize,
    pub budget_bytes: usize,
}

/// What an eviction pass achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed_bytes: usize,
    pub reached_target: bool,
}

/// Byte-budgeted LRU keyed by string. Pinned entries are never evicted, so resident size may
/// exceed the budget when pins force it.
#[derive(Debug)]
pub struct Cache {
    entries: LruCache<String, CacheEntry>,
    base_budget: usize,
    budget: usize,
    bytes_used: usize,
    policy: PressurePolicy,
    stats: CacheStats,
}

impl Cache {
    /// Creates a cache with the default pressure policy.
    pub fn new(budget: CacheBudget) -> Self {
        Self::with_policy(budget, PressurePolicy::default())
    }

    /// Creates a cache that reacts to pressure samples according to `policy`.
    pub fn with_policy(budget: CacheBudget, policy: PressurePolicy) -> Self {
        Self {
            entries: LruCache::new_unbounded(),
            base_budget: budget.bytes_max,
            budget: budget.bytes_max,
            bytes_used: 0,
            policy,
            stats: CacheStats::default(),
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes charged to resident entries, pinned ones included.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Budget currently enforced; lower than the configured one while under pressure.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Returns `true` if `key` is resident. Does not touch recency.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.peek(key).is_some()
    }

    /// Look up `key`, refreshing its recency. Never fetches.
    pub fn get(&mut self, key: &str) -> Option<CacheHit> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.stats.hits += 1;
                Some(CacheHit { value: entry.value.clone(), size: entry.size, pinned: entry.pins > 0 })
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or replace `key`. `size_hint` overrides the value's own resident size, which is
    /// how on-disk asset references are charged. Returns whether the value is now cached.
    pub fn put(&mut self, key: impl Into<String>, value: CacheValue, size_hint: Option<usize>) -> bool {
        let key = key.into();
        let cost = size_hint.unwrap_or_else(|| value.resident_bytes());
        let now = Instant::now();

        if let Some(existing) = self.entries.get_mut(&key) {
            let pins = existing.pins;
            if pins == 0 && cost > self.budget {
                debug!(key = %key, cost, budget = self.budget, "dropping oversized replacement");
                self.remove(&key);
                return false;
            }
            self.bytes_used = self.bytes_used - existing.size + cost;
            *existing = CacheEntry { value, size: cost, last_access: now, pins };
        } else {
            if cost > self.budget {
                debug!(key = %key, cost, budget = self.budget, "skipping oversized entry");
                return false;
            }
            self.bytes_used += cost;
            self.entries.insert(key.clone(), CacheEntry { value, size: cost, last_access: now, pins: 0 });
        }

        let budget = self.budget;
        self.evict_to(budget);
        // Pinned entries can leave the new value as the only evictable one.
        let cached = self.entries.peek(&key).is_some();
        if !cached {
            debug!(key = %key, "inserted entry evicted to honour pinned entries");
        }
        cached
    }

    /// Drop `key` regardless of pins.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.bytes_used -= entry.size;
        }
        removed
    }

    /// Increment the pin count. Returns `false` when the key is not cached.
    pub fn pin(&mut self, key: &str) -> bool {
        match self.entries.peek_mut(key) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the pin count and return the remaining count. Once the last pin is released
    /// the entry competes for the budget again.
    pub fn unpin(&mut self, key: &str) -> Option<u32> {
        let remaining = {
            let entry = self.entries.peek_mut(key)?;
            if entry.pins == 0 {
                warn!(key, "unpin on an entry that is not pinned");
            }
            entry.pins = entry.pins.saturating_sub(1);
            entry.pins
        };
        if remaining == 0 {
            let budget = self.budget;
            self.evict_to(budget);
        }
        Some(remaining)
    }

    /// Evict least-recently-used unpinned entries until resident size is at most `target_bytes`.
    pub fn evict_under_pressure(&mut self, target_bytes: usize) -> EvictionReport {
        self.evict_to(target_bytes)
    }

    /// Adapt the budget to a system memory utilisation sample.
    pub fn on_pressure(&mut self, percent: u8) -> PressureOutcome {
        let level = self.policy.level(percent);
        self.budget = self.policy.budget_for(level, self.base_budget);

        if level == PressureLevel::Normal {
            return PressureOutcome::Normal { budget_bytes: self.budget };
        }

        let report = self.evict_to(self.budget);
        if report.reached_target {
            debug!(?level, percent, freed = report.freed_bytes, "cache relieved pressure");
            PressureOutcome::Relieved {
                level,
                budget_bytes: self.budget,
                freed_bytes: report.freed_bytes,
            }
        } else {
            let pinned_bytes = self.pinned_bytes();
            warn!(
                ?level,
                percent,
                resident = self.bytes_used,
                target = self.budget,
                pinned_bytes,
                "pinned entries keep the cache above its pressure target"
            );
            PressureOutcome::Unrelieved {
                level,
                resident_bytes: self.bytes_used,
                target_bytes: self.budget,
                pinned_bytes,
            }
        }
    }

    /// Counters plus the current occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            resident_bytes: self.bytes_used,
            budget_bytes: self.budget,
            ..self.stats
        }
    }

    fn pinned_bytes(&self) -> usize {
        self.entries.iter().filter(|(_, entry)| entry.pins > 0).map(|(_, entry)| entry.size).sum()
    }

    fn evict_to(&mut self, target: usize) -> EvictionReport {
        let mut report = EvictionReport { evicted: 0, freed_bytes: 0, reached_target: true };
        while self.bytes_used > target {
            // Iteration runs from least to most recently used.
            let victim =
                self.entries.iter().find(|(_, entry)| entry.pins == 0).map(|(key, _)| key.clone());
            let Some(key) = victim else {
                report.reached_target = false;
                break;
            };
            if let Some(entry) = self.remove(&key) {
                report.evicted += 1;
                report.freed_bytes += entry.size;
                self.stats.evictions += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    fn thumb(bytes: usize) -> CacheValue {
        CacheValue::Decoded(Arc::new(Thumbnail {
            dimensions: Resolution { width: 1, height: 1 },
            pixels: vec![0; bytes],
        }))
    }

    fn cache(bytes_max: usize) -> Cache {
        Cache::with_policy(
            CacheBudget { bytes_max },
            PressurePolicy { floor_bytes: 10, ..PressurePolicy::default() },
        )
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let mut cache = cache(30);
        cache.put("a", thumb(10), None);
        cache.put("b", thumb(10), None);
        cache.put("c", thumb(10), None);
        assert!(cache.get("a").is_some());
        cache.put("d", thumb(10), None);

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.bytes_used(), 30);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn skips_oversized_unpinned_entries() {
        let mut cache = cache(30);
        cache.put("a", thumb(10), None);
        assert!(!cache.put("huge", thumb(31), None));
        assert!(cache.contains("a"));
        assert_eq!(cache.bytes_used(), 10);
    }

    #[test]
    fn pinned_entries_survive_eviction_and_keep_pins_on_replace() {
        let mut cache = cache(20);
        cache.put("keep", thumb(10), None);
        assert!(cache.pin("keep"));
        cache.put("x", thumb(10), None);
        cache.put("y", thumb(10), None);

        assert!(cache.contains("keep"));
        assert!(!cache.contains("x"));

        assert!(cache.put("keep", thumb(15), None));
        let hit = cache.get("keep").unwrap();
        assert!(hit.pinned);
        assert_eq!(hit.size, 15);
        assert_eq!(cache.unpin("keep"), Some(0));
    }

    #[test]
    fn size_hint_charges_asset_references() {
        let mut cache = cache(100);
        let key = AssetKey::new("full::abc", "jpg");
        cache.put("full::abc", CacheValue::Asset(key.clone()), Some(40));
        assert_eq!(cache.bytes_used(), 40);
        match cache.get("full::abc").map(|hit| hit.value) {
            Some(CacheValue::Asset(found)) => assert_eq!(found, key),
            other => panic!("unexpected hit: {other:?}"),
        }
    }

    #[test]
    fn pressure_shrinks_then_restores_budget() {
        let mut cache = cache(100);
        for key in ["a", "b", "c", "d"] {
            cache.put(key, thumb(20), None);
        }

        let outcome = cache.on_pressure(90);
        assert!(matches!(outcome, PressureOutcome::Relieved { budget_bytes: 50, freed_bytes: 40, .. }));
        assert_eq!(cache.bytes_used(), 40);

        assert_eq!(cache.on_pressure(20), PressureOutcome::Normal { budget_bytes: 100 });
        assert_eq!(cache.budget(), 100);
    }

    #[test]
    fn emergency_reports_unrelieved_when_pins_hold_memory() {
        let mut cache = cache(100);
        cache.put("pinned", thumb(30), None);
        cache.pin("pinned");
        cache.put("loose", thumb(30), None);

        let outcome = cache.on_pressure(99);
        assert_eq!(
            outcome,
            PressureOutcome::Unrelieved {
                level: PressureLevel::Emergency,
                resident_bytes: 30,
                target_bytes: 10,
                pinned_bytes: 30,
            }
        );
        assert!(!cache.contains("loose"));
    }

    #[test]
    fn contains_does_not_refresh_recency() {
        let mut cache = cache(20);
        cache.put("a", thumb(10), None);
        cache.put("b", thumb(10), None);
        assert!(cache.contains("a"));
        cache.put("c", thumb(10), None);

        assert!(!cache.contains("a"), "a stays least recently used");
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn put_reports_false_when_pins_leave_no_room() {
        let mut cache = cache(20);
        cache.put("held", thumb(20), None);
        assert!(cache.pin("held"));

        assert!(!cache.put("x", thumb(10), None));
        assert!(!cache.contains("x"));
        assert!(cache.contains("held"));
        assert_eq!(cache.bytes_used(), 20);
    }

    #[test]
    fn counts_hits_and_misses() {
        let mut cache = cache(100);
        cache.put("a", thumb(1), None);
        cache.get("a");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
