//! Per-query options
//!
//! [`QueryOptions`] carries every per-query override as an `Option` or a
//! callback. At instance creation it is resolved against the client's
//! [`QueryConfig`] into [`ResolvedOptions`], which the orchestrator reads
//! without further defaulting.

use crate::lifecycle::{CacheDataLoaded, CacheDataRemoved, QueryFulfilled};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use quarry_core::{
    ConfigError, FetchError, QuarryResult, QueryConfig, RetryDelay, RetryOption, RetryPolicy,
};
use quarry_storage::{CacheSlot, ParamSerializer, SyncStorage};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// CALLBACK TYPES
// ============================================================================

/// Transforms fetched data before it is merged and stored.
pub type OnSuccess<T, P> = Arc<dyn Fn(T, &P) -> T + Send + Sync>;

/// Observes a terminal fetch failure.
pub type OnError<P> = Arc<dyn Fn(&FetchError, &P) + Send + Sync>;

/// Runs after every settled fetch with either the data or the error.
pub type OnSettled<T, P> = Arc<dyn Fn(Option<&T>, Option<&FetchError>, &P) + Send + Sync>;

/// Combines the previous cross-parameter entry with a new result.
pub type MergeFn<T, P> = Arc<dyn Fn(&CacheSlot<T, P>, T, &MergeContext<P>) -> T + Send + Sync>;

/// Hook receiving a promise for the outcome of each started fetch.
pub type OnQueryStarted<T, P> =
    Arc<dyn Fn(P, QueryFulfilled<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Hook receiving the load and removal promises of the instance's cache entry.
pub type OnCacheEntryAdded<T, P> =
    Arc<dyn Fn(P, CacheDataLoaded<T>, CacheDataRemoved) -> BoxFuture<'static, ()> + Send + Sync>;

/// Context handed to a [`MergeFn`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeContext<P> {
    pub params: P,
    /// When the fetch being merged completed.
    pub timestamp: DateTime<Utc>,
}

/// Data shown before the first fetch completes.
#[derive(Clone)]
pub enum InitialData<T> {
    Value(T),
    Lazy(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> InitialData<T> {
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    pub fn resolve(&self) -> T {
        match self {
            Self::Value(value) => value.clone(),
            Self::Lazy(f) => f(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for InitialData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// Tags attached to an instance, fixed or derived from its params.
pub enum TagSource<P> {
    Static(Vec<String>),
    Derived(Arc<dyn Fn(&P) -> Vec<String> + Send + Sync>),
}

impl<P> Clone for TagSource<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(tags) => Self::Static(tags.clone()),
            Self::Derived(f) => Self::Derived(Arc::clone(f)),
        }
    }
}

impl<P> TagSource<P> {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&P) -> Vec<String> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    pub fn tags_for(&self, params: &P) -> Vec<String> {
        match self {
            Self::Static(tags) => tags.clone(),
            Self::Derived(f) => f(params),
        }
    }
}

impl<P> fmt::Debug for TagSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(tags) => f.debug_tuple("Static").field(tags).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

// ============================================================================
// QUERY OPTIONS
// ============================================================================

/// Per-query overrides. Every `None` falls back to the client's [`QueryConfig`].
pub struct QueryOptions<T, P> {
    pub ttl: Option<Duration>,
    pub stale_time: Option<Duration>,
    pub refetch_on_mount: Option<bool>,
    pub refetch_on_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
    /// Periodic refetch. Must be positive when set.
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub retry: Option<RetryOption>,
    pub retry_delay: Option<RetryDelay>,
    pub delay_unit: Option<Duration>,
    pub max_retry_delay: Option<Duration>,
    pub max_retries: Option<u32>,
    pub enabled: Option<bool>,
    pub lazy: Option<bool>,
    pub suspense: Option<bool>,
    /// Defaults to `suspense`.
    pub throw_on_error: Option<bool>,
    pub swr: Option<bool>,
    pub broadcast: Option<bool>,
    pub debug: Option<bool>,
    pub initial_data: Option<InitialData<T>>,
    pub serialize_query_params: Option<ParamSerializer<P>>,
    pub tags: Option<TagSource<P>>,
    pub merge: Option<MergeFn<T, P>>,
    pub on_success: Option<OnSuccess<T, P>>,
    pub on_error: Option<OnError<P>>,
    pub on_settled: Option<OnSettled<T, P>>,
    pub on_query_started: Option<OnQueryStarted<T, P>>,
    pub on_cache_entry_added: Option<OnCacheEntryAdded<T, P>>,
    pub persister: Option<Arc<dyn SyncStorage<T>>>,
}

impl<T, P> Default for QueryOptions<T, P> {
    fn default() -> Self {
        Self {
            ttl: None,
            stale_time: None,
            refetch_on_mount: None,
            refetch_on_focus: None,
            refetch_on_reconnect: None,
            refetch_interval: None,
            refetch_interval_in_background: None,
            retry: None,
            retry_delay: None,
            delay_unit: None,
            max_retry_delay: None,
            max_retries: None,
            enabled: None,
            lazy: None,
            suspense: None,
            throw_on_error: None,
            swr: None,
            broadcast: None,
            debug: None,
            initial_data: None,
            serialize_query_params: None,
            tags: None,
            merge: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            on_query_started: None,
            on_cache_entry_added: None,
            persister: None,
        }
    }
}

impl<T: Clone, P> Clone for QueryOptions<T, P> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            stale_time: self.stale_time,
            refetch_on_mount: self.refetch_on_mount,
            refetch_on_focus: self.refetch_on_focus,
            refetch_on_reconnect: self.refetch_on_reconnect,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            retry: self.retry.clone(),
            retry_delay: self.retry_delay.clone(),
            delay_unit: self.delay_unit,
            max_retry_delay: self.max_retry_delay,
            max_retries: self.max_retries,
            enabled: self.enabled,
            lazy: self.lazy,
            suspense: self.suspense,
            throw_on_error: self.throw_on_error,
            swr: self.swr,
            broadcast: self.broadcast,
            debug: self.debug,
            initial_data: self.initial_data.clone(),
            serialize_query_params: self.serialize_query_params.clone(),
            tags: self.tags.clone(),
            merge: self.merge.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            on_query_started: self.on_query_started.clone(),
            on_cache_entry_added: self.on_cache_entry_added.clone(),
            persister: self.persister.clone(),
        }
    }
}

impl<T, P> fmt::Debug for QueryOptions<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("ttl", &self.ttl)
            .field("stale_time", &self.stale_time)
            .field("refetch_interval", &self.refetch_interval)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .field("lazy", &self.lazy)
            .field("suspense", &self.suspense)
            .field("swr", &self.swr)
            .field("broadcast", &self.broadcast)
            .field("has_merge", &self.merge.is_some())
            .field("has_persister", &self.persister.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone, P> QueryOptions<T, P> {
    pub fn new() -> Self {
        Self::default()
    }

    // === Timing ===

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = Some(enabled);
        self
    }

    pub fn with_refetch_on_mount(mut self, enabled: bool) -> Self {
        self.refetch_on_mount = Some(enabled);
        self
    }

    pub fn with_refetch_on_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_focus = Some(enabled);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    // === Retry ===

    pub fn with_retry(mut self, retry: impl Into<RetryOption>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, delay: RetryDelay) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_delay_unit(mut self, unit: Duration) -> Self {
        self.delay_unit = Some(unit);
        self
    }

    pub fn with_max_retry_delay(mut self, cap: Duration) -> Self {
        self.max_retry_delay = Some(cap);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    // === Modes ===

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = Some(lazy);
        self
    }

    pub fn with_suspense(mut self, suspense: bool) -> Self {
        self.suspense = Some(suspense);
        self
    }

    pub fn with_throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn with_swr(mut self, swr: bool) -> Self {
        self.swr = Some(swr);
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    // === Data ===

    pub fn with_initial_data(mut self, data: InitialData<T>) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn with_serializer<F>(mut self, f: F) -> Self
    where
        F: Fn(&P) -> Result<String, String> + Send + Sync + 'static,
    {
        self.serialize_query_params = Some(Arc::new(f));
        self
    }

    pub fn with_tags(mut self, tags: TagSource<P>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_persister(mut self, persister: Arc<dyn SyncStorage<T>>) -> Self {
        self.persister = Some(persister);
        self
    }

    // === Callbacks ===

    pub fn with_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(&CacheSlot<T, P>, T, &MergeContext<P>) -> T + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(f));
        self
    }

    pub fn with_on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(T, &P) -> T + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn with_on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&FetchError, &P) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&T>, Option<&FetchError>, &P) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub fn with_on_query_started<F, Fut>(mut self, f: F) -> Self
    where
        T: 'static,
        P: 'static,
        F: Fn(P, QueryFulfilled<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_query_started = Some(Arc::new(
            move |params: P, fulfilled: QueryFulfilled<T>| -> BoxFuture<'static, ()> {
                f(params, fulfilled).boxed()
            },
        ));
        self
    }

    pub fn with_on_cache_entry_added<F, Fut>(mut self, f: F) -> Self
    where
        T: 'static,
        P: 'static,
        F: Fn(P, CacheDataLoaded<T>, CacheDataRemoved) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_cache_entry_added = Some(Arc::new(
            move |params: P,
                  loaded: CacheDataLoaded<T>,
                  removed: CacheDataRemoved|
                  -> BoxFuture<'static, ()> { f(params, loaded, removed).boxed() },
        ));
        self
    }

    /// Resolve against `config`, filling every unset option.
    ///
    /// # Errors
    /// - `ConfigError::InvalidValue` for a zero `refetch_interval` or
    ///   `delay_unit`, or a `max_retry_delay` below `delay_unit`
    /// - `ConfigError::IncompatibleOptions` for a disabled suspense query
    pub fn resolve(&self, config: &QueryConfig) -> QuarryResult<ResolvedOptions<T, P>> {
        if self.refetch_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(invalid("refetch_interval", "0ms", "must be positive"));
        }

        let delay_unit = self.delay_unit.unwrap_or(config.delay_unit);
        let max_retry_delay = self.max_retry_delay.unwrap_or(config.max_retry_delay);
        if delay_unit.is_zero() {
            return Err(invalid("delay_unit", "0ms", "must be positive"));
        }
        if max_retry_delay < delay_unit {
            return Err(invalid(
                "max_retry_delay",
                &format!("{}ms", max_retry_delay.as_millis()),
                "must be at least delay_unit",
            ));
        }

        let retry = self
            .retry
            .clone()
            .unwrap_or(RetryOption::Enabled(config.retry));
        let max_retries = match &retry {
            RetryOption::Count(count) => *count,
            RetryOption::Enabled(false) => 0,
            RetryOption::Enabled(true) | RetryOption::Predicate(_) => {
                self.max_retries.unwrap_or(config.max_retries)
            }
        };

        let suspense = self.suspense.unwrap_or(config.suspense);
        let enabled = self.enabled.unwrap_or(config.enabled);
        // A suspended host would wait on a mount fetch that never starts.
        if suspense && !enabled {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "suspense".to_string(),
                option_b: "enabled=false".to_string(),
            }
            .into());
        }

        Ok(ResolvedOptions {
            ttl: self.ttl.unwrap_or(config.ttl),
            stale_time: self.stale_time.unwrap_or(config.stale_time),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(config.refetch_on_mount),
            refetch_on_focus: self.refetch_on_focus.unwrap_or(config.refetch_on_focus),
            refetch_on_reconnect: self
                .refetch_on_reconnect
                .unwrap_or(config.refetch_on_reconnect),
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self
                .refetch_interval_in_background
                .unwrap_or(config.refetch_interval_in_background),
            retry: RetryPolicy {
                retry,
                max_retries,
                delay: self.retry_delay.clone().unwrap_or_default(),
                delay_unit,
                max_retry_delay,
            },
            enabled,
            lazy: self.lazy.unwrap_or(config.lazy),
            suspense,
            throw_on_error: self.throw_on_error.unwrap_or(suspense),
            swr: self.swr.unwrap_or(config.swr),
            broadcast: self.broadcast.unwrap_or(config.broadcast),
            debug: self.debug.unwrap_or(config.debug),
            initial_data: self.initial_data.clone(),
            serialize_query_params: self.serialize_query_params.clone(),
            tags: self.tags.clone(),
            merge: self.merge.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
            on_query_started: self.on_query_started.clone(),
            on_cache_entry_added: self.on_cache_entry_added.clone(),
            persister: self.persister.clone(),
        })
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> quarry_core::QuarryError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

// ============================================================================
// RESOLVED OPTIONS
// ============================================================================

/// Options with every default applied.
pub struct ResolvedOptions<T, P> {
    pub ttl: Duration,
    pub stale_time: Duration,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: bool,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub lazy: bool,
    pub suspense: bool,
    pub throw_on_error: bool,
    pub swr: bool,
    pub broadcast: bool,
    pub debug: bool,
    pub initial_data: Option<InitialData<T>>,
    pub serialize_query_params: Option<ParamSerializer<P>>,
    pub tags: Option<TagSource<P>>,
    pub merge: Option<MergeFn<T, P>>,
    pub on_success: Option<OnSuccess<T, P>>,
    pub on_error: Option<OnError<P>>,
    pub on_settled: Option<OnSettled<T, P>>,
    pub on_query_started: Option<OnQueryStarted<T, P>>,
    pub on_cache_entry_added: Option<OnCacheEntryAdded<T, P>>,
    pub persister: Option<Arc<dyn SyncStorage<T>>>,
}

impl<T, P> ResolvedOptions<T, P> {
    /// True if any automatic refetch trigger is configured.
    pub fn has_refetch_triggers(&self) -> bool {
        self.refetch_on_focus || self.refetch_on_reconnect || self.refetch_interval.is_some()
    }
}

impl<T, P> fmt::Debug for ResolvedOptions<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedOptions")
            .field("ttl", &self.ttl)
            .field("stale_time", &self.stale_time)
            .field("refetch_interval", &self.refetch_interval)
            .field("retry", &self.retry)
            .field("enabled", &self.enabled)
            .field("lazy", &self.lazy)
            .field("suspense", &self.suspense)
            .field("throw_on_error", &self.throw_on_error)
            .field("swr", &self.swr)
            .finish_non_exhaustive()
    }
}
