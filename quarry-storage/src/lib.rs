//! QUARRY Storage - Cache Store and Persistence
//!
//! The cross-parameter cache store that query instances share per base
//! key, cache-key construction, staleness helpers, and synchronous
//! persistence adapters for displayed query data.

pub mod cache;
pub mod persist;

pub use cache::{
    is_stale, CacheBucket, CacheEntry, CacheHandle, CacheKey, CacheSlot, CacheStats, CacheStore,
    Freshness, ParamSerializer, ReaperMetrics, ReaperSnapshot,
};
pub use persist::{persist_key, JsonBackend, JsonStorage, MemoryStorage, SyncStorage};
