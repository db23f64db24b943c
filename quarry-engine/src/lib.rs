//! QUARRY Engine - Query Orchestration
//!
//! Runs query instances on top of the quarry primitives: fetch execution
//! with in-flight deduplication, retry with backoff, cross-parameter cache
//! merging, lifecycle promises, automatic refetch triggers and tag-based
//! invalidation.
//!
//! ```text
//!  QueryClient ──► Query ──► fetch task ──► QueryFetcher
//!      │             │            │
//!      │             │            ├─► RetryPolicy (backoff timer)
//!      │             │            └─► CacheHandle (merge + write back)
//!      │             ├─► LifecycleBroker (query_fulfilled, cache_data_loaded)
//!      │             └─► refetch scheduler (focus, reconnect, interval)
//!      └─► TagRegistry ── invalidate_tags ─► batched invalidations
//! ```
//!
//! # Key Types
//!
//! - `QueryClient`: shared cache store, tag registry, environment and batch
//! - `Query`: one live instance with `fetch`, `invalidate`, `cancel`, `dispose`
//! - `QueryState`: read-only projection (`data`, `error`, `status`, `is_loading`)
//! - `QueryOptions`: per-query overrides resolved against `QueryConfig`
//! - `QueryFamily`: parameterized template with instance reuse
//!
//! Every instance needs a tokio runtime to drive its fetch and scheduler tasks.

/// Lifecycle log line at `debug` when the query opted into debug logging,
/// `trace` otherwise.
macro_rules! query_log {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

pub mod client;
pub mod environment;
pub mod family;
pub mod lifecycle;
pub mod options;
pub mod query;
pub mod scheduler;
pub mod tags;

pub use client::{QueryClient, QueryClientBuilder};
pub use environment::{Environment, FocusEvent};
pub use family::QueryFamily;
pub use lifecycle::{CacheDataLoaded, CacheDataRemoved, LifecyclePromise, QueryFulfilled};
pub use options::{
    InitialData, MergeContext, MergeFn, OnCacheEntryAdded, OnError, OnQueryStarted, OnSettled,
    OnSuccess, QueryOptions, ResolvedOptions, TagSource,
};
pub use query::{Query, QueryFuture, QueryState};
pub use scheduler::{evaluate_refetch, RefetchDecision, RefetchInputs, RefetchReason, SkipReason};
pub use tags::TagRegistry;

// Re-export the primitives most callers need alongside the engine.
pub use quarry_core::{
    query_executor, AbortSignal, FetchError, LifecycleError, QuarryError, QuarryResult,
    QueryConfig,
    QueryDefinition, QueryFetcher, QueryStatus, RetryDelay, RetryOption,
};
pub use quarry_storage::{CacheEntry, CacheSlot};
