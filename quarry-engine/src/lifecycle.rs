//! Lifecycle promise broker.
//!
//! Two independent one-shot tracks per query instance:
//!
//! - **query started**: armed for every fetch that starts outside a retry
//!   continuation. Resolves with the state reader on the next success,
//!   rejects with the fetch error on the next terminal failure.
//! - **cache entry**: armed once on creation. `cache_data_loaded` resolves
//!   on the first success; `cache_data_removed` resolves on teardown. A
//!   teardown before any success rejects `cache_data_loaded` with
//!   [`LifecycleError::NeverResolvedBeforeRemoval`] so no awaiter hangs.
//!
//! Each resolver is consumed exactly once, then discarded.

use crate::query::QueryState;
use quarry_core::{FetchError, LifecycleError, QuarryError, QuarryResult, SignalReader};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves with a reader over the instance state after a successful fetch.
///
/// Rejects with the fetch error when the fetch fails terminally. When an
/// invalidation abandons the fetch while it waits to retry, the replacement
/// fetch arms a new promise and this one rejects with
/// [`LifecycleError::Dropped`] instead of settling on the next outcome.
/// Hooks that only care about success can treat `Dropped` like a
/// cancellation.
pub type QueryFulfilled<T> = LifecyclePromise<SignalReader<QueryState<T>>>;

/// Resolves with a reader over the instance state once data first loads.
pub type CacheDataLoaded<T> = LifecyclePromise<SignalReader<QueryState<T>>>;

/// Resolves when the instance is torn down.
pub type CacheDataRemoved = LifecyclePromise<()>;

/// A one-shot lifecycle promise.
///
/// If the broker drops the resolver without settling (for example when a
/// newer fetch re-arms the query-started track), the promise rejects with
/// [`LifecycleError::Dropped`].
#[derive(Debug)]
pub struct LifecyclePromise<V> {
    rx: oneshot::Receiver<QuarryResult<V>>,
    query_key: String,
}

impl<V> Future for LifecyclePromise<V> {
    type Output = QuarryResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LifecycleError::Dropped {
                query_key: self.query_key.clone(),
            }
            .into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Resolver side of one track.
#[derive(Debug)]
pub(crate) enum PromiseSlot<V> {
    Unarmed,
    Armed(oneshot::Sender<QuarryResult<V>>),
    Settled,
}

impl<V> PromiseSlot<V> {
    /// Arm a fresh promise, dropping any unsettled predecessor.
    pub(crate) fn arm(&mut self, query_key: &str) -> LifecyclePromise<V> {
        let (tx, rx) = oneshot::channel();
        *self = Self::Armed(tx);
        LifecyclePromise {
            rx,
            query_key: query_key.to_string(),
        }
    }

    /// Settle if armed. Returns true if a resolver was consumed.
    pub(crate) fn settle(&mut self, result: QuarryResult<V>) -> bool {
        match std::mem::replace(self, Self::Settled) {
            Self::Armed(tx) => {
                // The awaiter may have gone away; settling still consumes the slot.
                let _ = tx.send(result);
                true
            }
            previous => {
                *self = previous;
                false
            }
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        matches!(self, Self::Armed(_))
    }

    pub(crate) fn is_settled(&self) -> bool {
        matches!(self, Self::Settled)
    }
}

/// Per-instance promise bookkeeping.
#[derive(Debug)]
pub(crate) struct LifecycleBroker<T> {
    query_key: String,
    query_fulfilled: PromiseSlot<SignalReader<QueryState<T>>>,
    cache_data_loaded: PromiseSlot<SignalReader<QueryState<T>>>,
    cache_data_removed: PromiseSlot<()>,
    entry_added: bool,
}

impl<T> LifecycleBroker<T> {
    pub(crate) fn new(query_key: impl Into<String>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fulfilled: PromiseSlot::Unarmed,
            cache_data_loaded: PromiseSlot::Unarmed,
            cache_data_removed: PromiseSlot::Unarmed,
            entry_added: false,
        }
    }

    /// Arm the cache-entry track. Only the first call returns promises.
    pub(crate) fn cache_entry_added(&mut self) -> Option<(CacheDataLoaded<T>, CacheDataRemoved)> {
        if self.entry_added {
            return None;
        }
        self.entry_added = true;
        let loaded = self.cache_data_loaded.arm(&self.query_key);
        let removed = self.cache_data_removed.arm(&self.query_key);
        Some((loaded, removed))
    }

    /// Arm a new query-started promise.
    pub(crate) fn query_started(&mut self) -> QueryFulfilled<T> {
        self.query_fulfilled.arm(&self.query_key)
    }

    pub(crate) fn fetch_succeeded(&mut self, reader: &SignalReader<QueryState<T>>) {
        self.query_fulfilled.settle(Ok(reader.clone()));
        self.cache_data_loaded.settle(Ok(reader.clone()));
    }

    pub(crate) fn fetch_failed(&mut self, error: &FetchError) {
        self.query_fulfilled
            .settle(Err(QuarryError::Fetch(error.clone())));
    }

    /// Settle the removal track. Returns true if `cache_data_loaded` had to
    /// be rejected because data never loaded.
    pub(crate) fn teardown(&mut self) -> bool {
        let rejected = self
            .cache_data_loaded
            .settle(Err(LifecycleError::NeverResolvedBeforeRemoval.into()));
        self.cache_data_removed.settle(Ok(()));
        self.query_fulfilled = PromiseSlot::Settled;
        rejected
    }

    pub(crate) fn has_loaded(&self) -> bool {
        self.entry_added && self.cache_data_loaded.is_settled()
    }

    pub(crate) fn is_awaiting_fetch(&self) -> bool {
        self.query_fulfilled.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{QueryStatus, Signal};

    fn reader() -> (Signal<QueryState<u32>>, SignalReader<QueryState<u32>>) {
        let signal = Signal::new(QueryState::default());
        let reader = signal.subscribe();
        (signal, reader)
    }

    #[tokio::test]
    async fn test_query_started_resolves_once() {
        let (signal, reader) = reader();
        let mut broker = LifecycleBroker::new("k");
        let promise = broker.query_started();
        assert!(broker.is_awaiting_fetch());

        signal.update(|s| {
            s.data = Some(1);
            s.status = QueryStatus::Success;
        });
        broker.fetch_succeeded(&reader);
        // A second state change has nothing left to settle.
        broker.fetch_failed(&FetchError::failed("late"));

        let resolved = promise.await.unwrap();
        assert_eq!(resolved.get().data, Some(1));
        assert!(!broker.is_awaiting_fetch());
    }

    #[tokio::test]
    async fn test_query_started_rejects_with_fetch_error() {
        let mut broker = LifecycleBroker::<u32>::new("k");
        let promise = broker.query_started();
        broker.fetch_failed(&FetchError::failed("boom"));
        assert_eq!(
            promise.await.unwrap_err(),
            QuarryError::Fetch(FetchError::failed("boom"))
        );
    }

    #[tokio::test]
    async fn test_rearming_drops_previous_promise() {
        let mut broker = LifecycleBroker::<u32>::new("k");
        let first = broker.query_started();
        let _second = broker.query_started();
        assert!(matches!(
            first.await,
            Err(QuarryError::Lifecycle(LifecycleError::Dropped { .. }))
        ));
    }

    #[tokio::test]
    async fn test_teardown_before_load_rejects_with_sentinel() {
        let mut broker = LifecycleBroker::<u32>::new("k");
        let (loaded, removed) = broker.cache_entry_added().unwrap();
        assert!(broker.cache_entry_added().is_none());

        assert!(broker.teardown());
        assert!(loaded.await.unwrap_err().is_never_resolved());
        assert!(removed.await.is_ok());
    }

    #[tokio::test]
    async fn test_teardown_after_load_only_resolves_removed() {
        let (_signal, reader) = reader();
        let mut broker = LifecycleBroker::new("k");
        let (loaded, removed) = broker.cache_entry_added().unwrap();

        broker.fetch_succeeded(&reader);
        assert!(broker.has_loaded());
        assert!(!broker.teardown());

        assert!(loaded.await.is_ok());
        assert!(removed.await.is_ok());
    }
}
