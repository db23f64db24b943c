//! Cross-parameter result cache.
//!
//! One bucket exists per base key and is shared by every query instance
//! using that key, whatever its parameters. Inside a bucket each slot is
//! addressed by a [`CacheKey`] (`base::serialized-params`) and holds the
//! last successful result for it. This is what lets a paginated query see
//! the previous page's result when it fetches the next one.
//!
//! # Example
//!
//! ```ignore
//! let store = CacheStore::new();
//! let handle = store.bucket::<Vec<Item>, PageParams>("items", Duration::from_secs(60))?;
//!
//! let key = CacheKey::new("items", &params);
//! match handle.get_cache(&key)? {
//!     CacheSlot::Vacant => { /* never fetched */ }
//!     CacheSlot::Cleared => { /* invalidated */ }
//!     CacheSlot::Filled(entry) => { /* entry.data, entry.params, entry.timestamp */ }
//! }
//! ```

pub mod bucket;
pub mod entry;
pub mod freshness;
pub mod key;
pub mod stats;
pub mod store;

pub use bucket::CacheBucket;
pub use entry::{CacheEntry, CacheSlot};
pub use freshness::{is_stale, Freshness};
pub use key::{CacheKey, ParamSerializer};
pub use stats::CacheStats;
pub use store::{CacheHandle, CacheStore, ReaperMetrics, ReaperSnapshot};
