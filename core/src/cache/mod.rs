//! Bounded in-memory cache and memory-pressure handling.

pub mod memory;
pub mod pressure;

pub use memory::{Cache, CacheEntry, CacheHit, CacheStats, CacheValue, EvictionReport};
pub use pressure::{
    DEFAULT_SAMPLE_INTERVAL, PressureLevel, PressureMonitor, PressureOutcome, PressurePolicy,
    PressureSource, SystemMemory,
};
