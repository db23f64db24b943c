//! Typed cache buckets.

use super::entry::{CacheEntry, CacheSlot};
use super::key::CacheKey;
use super::stats::CacheCounters;
use quarry_core::CacheError;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// All cache slots for one base key.
///
/// A key missing from the map is [`CacheSlot::Vacant`]; a key mapped to
/// `None` is [`CacheSlot::Cleared`].
pub struct CacheBucket<T, P> {
    id: String,
    entries: RwLock<HashMap<CacheKey, Option<Arc<CacheEntry<T, P>>>>>,
    counters: Arc<CacheCounters>,
}

impl<T, P> CacheBucket<T, P> {
    pub(crate) fn new(id: &str, counters: Arc<CacheCounters>) -> Self {
        Self {
            id: id.to_string(),
            entries: RwLock::new(HashMap::new()),
            counters,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up the slot for `key`.
    pub fn get(&self, key: &CacheKey) -> Result<CacheSlot<T, P>, CacheError> {
        let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
        let slot = match entries.get(key) {
            None => CacheSlot::Vacant,
            Some(None) => CacheSlot::Cleared,
            Some(Some(entry)) => CacheSlot::Filled(Arc::clone(entry)),
        };
        if slot.is_filled() {
            self.counters.record_hit();
        } else {
            self.counters.record_miss();
        }
        Ok(slot)
    }

    /// Replace the slot for `key`. `None` marks it cleared.
    ///
    /// Last writer wins.
    pub fn set(&self, key: &CacheKey, entry: Option<CacheEntry<T, P>>) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        entries.insert(key.clone(), entry.map(Arc::new));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Type-erased view used by the store to hold buckets of any entry type.
pub(crate) trait ErasedBucket: Send + Sync {
    fn entry_count(&self) -> usize;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T, P> ErasedBucket for CacheBucket<T, P>
where
    T: Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn entry_count(&self) -> usize {
        self.len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    fn bucket() -> (CacheBucket<Vec<u32>, u32>, Arc<CacheCounters>) {
        let counters = Arc::new(CacheCounters::default());
        (CacheBucket::new("pages", Arc::clone(&counters)), counters)
    }

    #[test]
    fn test_vacant_cleared_filled() {
        let (bucket, counters) = bucket();
        let key = CacheKey::new("pages", &0u32);

        assert!(bucket.get(&key).unwrap().is_vacant());

        bucket
            .set(&key, Some(CacheEntry::new(vec![1, 2], 0, Utc::now())))
            .unwrap();
        assert_eq!(bucket.get(&key).unwrap().data(), Some(&vec![1, 2]));

        bucket.set(&key, None).unwrap();
        assert!(bucket.get(&key).unwrap().is_cleared());
        assert_eq!(bucket.len(), 1);

        assert_eq!(counters.hits.load(Ordering::Relaxed), 1);
        assert_eq!(counters.misses.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_snapshot_survives_overwrite() {
        let (bucket, _) = bucket();
        let key = CacheKey::new("pages", &0u32);
        bucket
            .set(&key, Some(CacheEntry::new(vec![1], 0, Utc::now())))
            .unwrap();
        let held = bucket.get(&key).unwrap();

        bucket
            .set(&key, Some(CacheEntry::new(vec![9, 9], 0, Utc::now())))
            .unwrap();
        assert_eq!(held.data(), Some(&vec![1]));
        assert_eq!(bucket.get(&key).unwrap().data(), Some(&vec![9, 9]));
    }
}
