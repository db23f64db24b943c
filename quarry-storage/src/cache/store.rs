//! Cross-parameter cache store
//!
//! Buckets are created lazily per base key and reference counted by the
//! query instances holding a [`CacheHandle`]. Once the count reaches zero a
//! bucket becomes idle; it is removed immediately when its TTL is zero, or
//! by [`CacheStore::sweep`] once the TTL has elapsed. There is no per-entry
//! expiry.

use super::bucket::{CacheBucket, ErasedBucket};
use super::entry::{CacheEntry, CacheSlot};
use super::key::CacheKey;
use super::stats::{CacheCounters, CacheStats};
use chrono::{DateTime, Utc};
use quarry_core::{CacheError, Clock, SystemClock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

struct BucketRecord {
    bucket: Arc<dyn ErasedBucket>,
    ttl: Duration,
    refs: usize,
    idle_since: Option<DateTime<Utc>>,
}

struct StoreInner {
    buckets: Mutex<HashMap<String, BucketRecord>>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
}

impl StoreInner {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, BucketRecord>>, CacheError> {
        self.buckets.lock().map_err(|_| CacheError::LockPoisoned)
    }

    fn release(&self, bucket_id: &str) {
        let mut buckets = match self.lock() {
            Ok(buckets) => buckets,
            Err(e) => {
                tracing::warn!(bucket_id, error = %e, "Could not release cache bucket");
                return;
            }
        };
        let Some(record) = buckets.get_mut(bucket_id) else {
            return;
        };
        record.refs = record.refs.saturating_sub(1);
        if record.refs > 0 {
            return;
        }
        if record.ttl.is_zero() {
            buckets.remove(bucket_id);
            self.counters.record_evictions(1);
            tracing::trace!(bucket_id, "Cache bucket released and removed");
        } else {
            record.idle_since = Some(self.clock.now());
            tracing::trace!(
                bucket_id,
                ttl_ms = record.ttl.as_millis() as u64,
                "Cache bucket idle"
            );
        }
    }
}

/// Shared store of cache buckets. Clones refer to the same store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("bucket_count", &self.bucket_count())
            .finish()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTL bookkeeping reads `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                buckets: Mutex::new(HashMap::new()),
                counters: Arc::new(CacheCounters::default()),
                clock,
            }),
        }
    }

    /// Acquire a handle on the bucket for `bucket_id`, creating it with
    /// `ttl` if it does not exist. An existing bucket keeps its original TTL.
    ///
    /// # Errors
    /// `TypeMismatch` if the bucket was created for a different entry type.
    pub fn bucket<T, P>(&self, bucket_id: &str, ttl: Duration) -> Result<CacheHandle<T, P>, CacheError>
    where
        T: Send + Sync + 'static,
        P: Send + Sync + 'static,
    {
        let mut buckets = self.inner.lock()?;
        let record = buckets.entry(bucket_id.to_string()).or_insert_with(|| {
            tracing::debug!(
                bucket_id,
                ttl_ms = ttl.as_millis() as u64,
                "Cache bucket created"
            );
            BucketRecord {
                bucket: Arc::new(CacheBucket::<T, P>::new(
                    bucket_id,
                    Arc::clone(&self.inner.counters),
                )),
                ttl,
                refs: 0,
                idle_since: None,
            }
        });

        let bucket = Arc::clone(&record.bucket)
            .into_any()
            .downcast::<CacheBucket<T, P>>()
            .map_err(|_| CacheError::TypeMismatch {
                bucket_id: bucket_id.to_string(),
            })?;

        record.refs += 1;
        record.idle_since = None;

        Ok(CacheHandle {
            bucket,
            store: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        })
    }

    /// Remove idle buckets whose TTL has elapsed. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize, CacheError> {
        let now = self.inner.clock.now();
        let mut buckets = self.inner.lock()?;
        let before = buckets.len();
        buckets.retain(|bucket_id, record| {
            let expired = record.refs == 0
                && record.idle_since.is_some_and(|idle_since| {
                    (now - idle_since).to_std().unwrap_or(Duration::ZERO) >= record.ttl
                });
            if expired {
                tracing::trace!(bucket_id = bucket_id.as_str(), "Cache bucket expired");
            }
            !expired
        });
        let removed = before - buckets.len();
        self.inner.counters.record_evictions(removed as u64);
        Ok(removed)
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Live references held on `bucket_id`, or `None` if it does not exist.
    pub fn ref_count(&self, bucket_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .ok()
            .and_then(|b| b.get(bucket_id).map(|r| r.refs))
    }

    pub fn contains(&self, bucket_id: &str) -> bool {
        self.ref_count(bucket_id).is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let (bucket_count, entry_count) = match self.inner.lock() {
            Ok(buckets) => (
                buckets.len() as u64,
                buckets
                    .values()
                    .map(|r| r.bucket.entry_count() as u64)
                    .sum(),
            ),
            Err(_) => (0, 0),
        };
        let counters = &self.inner.counters;
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            bucket_count,
            entry_count,
            evictions: counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Spawn [`cache_reaper_task`] on the current runtime.
    pub fn spawn_reaper(
        &self,
        sweep_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<Arc<ReaperMetrics>> {
        tokio::spawn(cache_reaper_task(
            Arc::downgrade(&self.inner),
            sweep_interval,
            shutdown_rx,
        ))
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// A counted reference on one bucket.
///
/// Dropping the handle (or calling [`CacheHandle::release`]) gives the
/// reference back. Releasing twice is a no-op.
pub struct CacheHandle<T, P> {
    bucket: Arc<CacheBucket<T, P>>,
    store: Weak<StoreInner>,
    released: AtomicBool,
}

impl<T, P> fmt::Debug for CacheHandle<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("bucket_id", &self.bucket.id())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, P> CacheHandle<T, P> {
    pub fn bucket_id(&self) -> &str {
        self.bucket.id()
    }

    /// `Vacant` if never written, `Cleared` if invalidated.
    pub fn get_cache(&self, key: &CacheKey) -> Result<CacheSlot<T, P>, CacheError> {
        self.bucket.get(key)
    }

    /// Write an entry, or clear the slot with `None`.
    pub fn set_cache(&self, key: &CacheKey, entry: Option<CacheEntry<T, P>>) -> Result<(), CacheError> {
        self.bucket.set(key, entry)
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.release(self.bucket.id());
        }
    }
}

impl<T, P> Drop for CacheHandle<T, P> {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// REAPER
// ============================================================================

/// Counters for the background reaper.
#[derive(Debug, Default)]
pub struct ReaperMetrics {
    /// Sweep cycles completed.
    pub sweeps: AtomicU64,
    /// Buckets removed across all sweeps.
    pub buckets_removed: AtomicU64,
    /// Sweeps that failed on a poisoned lock.
    pub sweep_errors: AtomicU64,
}

impl ReaperMetrics {
    pub fn snapshot(&self) -> ReaperSnapshot {
        ReaperSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            buckets_removed: self.buckets_removed.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reaper metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSnapshot {
    pub sweeps: u64,
    pub buckets_removed: u64,
    pub sweep_errors: u64,
}

/// Background task that periodically sweeps expired buckets.
///
/// Runs until `shutdown_rx` carries `true` or the store is dropped.
async fn cache_reaper_task(
    store: Weak<StoreInner>,
    sweep_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ReaperMetrics> {
    let metrics = Arc::new(ReaperMetrics::default());

    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        interval_ms = sweep_interval.as_millis() as u64,
        "Cache reaper started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("Cache reaper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(inner) = store.upgrade() else {
                    break;
                };
                let store = CacheStore { inner };
                metrics.sweeps.fetch_add(1, Ordering::Relaxed);
                match store.sweep() {
                    Ok(removed) => {
                        metrics.buckets_removed.fetch_add(removed as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(error = %e, "Cache sweep failed");
                    }
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::debug!(
        sweeps = snapshot.sweeps,
        buckets_removed = snapshot.buckets_removed,
        "Cache reaper completed"
    );

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ManualClock;

    fn store() -> (CacheStore, ManualClock) {
        let clock = ManualClock::default();
        (CacheStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_handles_share_bucket_across_params() {
        let (store, _) = store();
        let a = store.bucket::<Vec<u32>, u32>("items", Duration::ZERO).unwrap();
        let b = store.bucket::<Vec<u32>, u32>("items", Duration::ZERO).unwrap();
        assert_eq!(store.ref_count("items"), Some(2));

        let key = CacheKey::base_only("items");
        a.set_cache(&key, Some(CacheEntry::new(vec![1], 0, Utc::now())))
            .unwrap();
        assert_eq!(b.get_cache(&key).unwrap().data(), Some(&vec![1]));
    }

    #[test]
    fn test_type_mismatch() {
        let (store, _) = store();
        let _a = store.bucket::<String, ()>("x", Duration::ZERO).unwrap();
        let err = store.bucket::<u64, ()>("x", Duration::ZERO).unwrap_err();
        assert_eq!(
            err,
            CacheError::TypeMismatch {
                bucket_id: "x".to_string()
            }
        );
        // The failed acquisition must not leak a reference.
        assert_eq!(store.ref_count("x"), Some(1));
    }

    #[test]
    fn test_zero_ttl_removes_on_last_release() {
        let (store, _) = store();
        let a = store.bucket::<u8, ()>("b", Duration::ZERO).unwrap();
        let b = store.bucket::<u8, ()>("b", Duration::ZERO).unwrap();

        drop(a);
        assert!(store.contains("b"));
        b.release();
        b.release();
        assert!(!store.contains("b"));
        drop(b);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_ttl_sweep() {
        let (store, clock) = store();
        let handle = store.bucket::<u8, ()>("b", Duration::from_secs(10)).unwrap();
        drop(handle);
        assert!(store.contains("b"));

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.sweep().unwrap(), 0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.sweep().unwrap(), 1);
        assert_eq!(store.bucket_count(), 0);
    }

    #[test]
    fn test_reacquire_cancels_idle() {
        let (store, clock) = store();
        drop(store.bucket::<u8, ()>("b", Duration::from_secs(1)).unwrap());
        let _again = store.bucket::<u8, ()>("b", Duration::from_secs(1)).unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(store.sweep().unwrap(), 0);
    }

    #[test]
    fn test_stats_count_entries() {
        let (store, _) = store();
        let h = store.bucket::<u8, u8>("s", Duration::ZERO).unwrap();
        h.set_cache(&CacheKey::new("s", &1u8), Some(CacheEntry::new(1, 1, Utc::now())))
            .unwrap();
        h.set_cache(&CacheKey::new("s", &2u8), None).unwrap();
        let _ = h.get_cache(&CacheKey::new("s", &1u8)).unwrap();
        let _ = h.get_cache(&CacheKey::new("s", &3u8)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.bucket_count, 1);
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_and_stops() {
        let (store, clock) = store();
        drop(store.bucket::<u8, ()>("r", Duration::from_millis(100)).unwrap());
        clock.advance(Duration::from_millis(150));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = store.spawn_reaper(Duration::from_millis(50), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!store.contains("r"));

        shutdown_tx.send(true).unwrap();
        let metrics = task.await.unwrap();
        let snapshot = metrics.snapshot();
        assert!(snapshot.sweeps >= 1);
        assert_eq!(snapshot.buckets_removed, 1);
    }
}
