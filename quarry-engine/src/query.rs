//! Query orchestrator
//!
//! A [`Query`] is one live instance of a query definition. It owns the
//! state machine, the in-flight fetch, retry timers, lifecycle promises and
//! the automatic refetch scheduler, and exposes a read-only [`QueryState`].
//!
//! # Fetch algorithm
//!
//! ```text
//! fetch() ─┬─ disabled ──────────────────────────────► Ok(None)
//!          ├─ fetch in flight ───────────────────────► same future (dedup)
//!          └─ request ─► fetching ─► spawn fetch task
//!                                      │
//!              ┌───────────────────────┘
//!              ▼
//!          fetcher.fetch(signal)
//!              ├─ Ok ─► on_success ─► merge(prev slot) ─► cache ─► success
//!              └─ Err ─► retry? ─ yes ─► sleep(backoff) ─► next attempt
//!                               └ no ──► error (Err if throw_on_error)
//! ```
//!
//! All bookkeeping sits behind one mutex that is never held across an
//! await or a user callback. Lock order: control, then state, then cache.

use crate::client::ClientShared;
use crate::lifecycle::LifecycleBroker;
use crate::options::{InitialData, MergeContext, QueryOptions, ResolvedOptions};
use crate::scheduler::{
    spawn_refetch_scheduler, RefetchInputs, RefetchReason, RefetchTarget, SchedulerSettings,
};
use crate::tags::{TagRegistration, TagTarget};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use quarry_core::{
    AbortController, AbortSignal, FetchError, QuarryResult, QueryData, QueryDefinition,
    QueryError, QueryEvent, QueryParams, QueryStateMachine, QueryStatus, Signal, SignalReader,
};
use quarry_events::{listen, ChannelMessage, ListenerHandle, QueryBroadcastMessage};
use quarry_storage::{persist_key, CacheEntry, CacheHandle, CacheKey, CacheSlot};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Shared, cloneable handle on one fetch's outcome.
///
/// Resolves to `Ok(Some(data))` on success, `Ok(None)` when the fetch was
/// skipped, abandoned or failed without `throw_on_error`, and `Err` for a
/// terminal failure with `throw_on_error`.
pub type QueryFuture<T> = Shared<BoxFuture<'static, Result<Option<T>, FetchError>>>;

// ============================================================================
// STATE PROJECTION
// ============================================================================

/// Read-only view of a query instance.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Displayed data. May be stale, a placeholder, or persisted data.
    pub data: Option<T>,
    /// Last terminal error. Cleared when the next fetch starts.
    pub error: Option<FetchError>,
    pub status: QueryStatus,
    /// When the last successful fetch completed.
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            last_updated: None,
        }
    }
}

impl<T> QueryState<T> {
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Fetching
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A fetch is running (or waiting to retry) with no data to show yet.
    ///
    /// Untriggered lazy queries and disabled queries stay idle, so they never
    /// report loading.
    pub fn is_loading(&self) -> bool {
        self.is_fetching() && self.data.is_none()
    }
}

// ============================================================================
// CONTROL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOrigin {
    Mount,
    Explicit,
    Invalidation,
    Remote,
}

impl FetchOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Explicit => "explicit",
            Self::Invalidation => "invalidation",
            Self::Remote => "remote",
        }
    }

    fn triggers(&self) -> bool {
        matches!(self, Self::Explicit | Self::Remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvalidateOrigin {
    Manual,
    Tag,
    Scheduler(RefetchReason),
    Remote,
}

impl InvalidateOrigin {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Tag => "tag",
            Self::Scheduler(reason) => reason.as_str(),
            Self::Remote => "remote",
        }
    }

    fn is_local(&self) -> bool {
        matches!(self, Self::Manual | Self::Tag)
    }

    /// Scheduler refetches re-activate a lazy query in the same batch as
    /// the invalidation, so it stays triggered.
    fn rearms_lazy(&self) -> bool {
        !matches!(self, Self::Scheduler(_))
    }
}

/// What releases a fetch waiting out its retry delay early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetrySignal {
    /// Retry now.
    Proceed,
    /// Give up; the awaiters resolve to `None`.
    Abandon,
}

struct ActiveFetch<T> {
    generation: u64,
    future: QueryFuture<T>,
}

struct QueryControl<T> {
    machine: QueryStateMachine,
    abort: Option<AbortController>,
    retry_gate: Option<oneshot::Sender<RetrySignal>>,
    active: Option<ActiveFetch<T>>,
    /// Bumped whenever a fetch starts or is abandoned. A fetch task only
    /// writes state while its generation is current.
    generation: u64,
    failure_count: u32,
    has_fetched_once: bool,
    was_triggered: bool,
    disposed: bool,
    lifecycle: LifecycleBroker<T>,
    initial: Option<QueryFuture<T>>,
}

impl<T> QueryControl<T> {
    fn is_current(&self, generation: u64) -> bool {
        !self.disposed && self.generation == generation
    }

    fn clear_active(&mut self, generation: u64) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
        {
            self.active = None;
        }
    }
}

enum FailureOutcome<T> {
    Retry {
        delay: Duration,
        gate: oneshot::Receiver<RetrySignal>,
    },
    Settled(Result<Option<T>, FetchError>),
}

fn lock<X>(mutex: &Mutex<X>) -> MutexGuard<'_, X> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn settled_none<T: QueryData>() -> QueryFuture<T> {
    futures_util::future::ready(Ok(None)).boxed().shared()
}

fn join_fetch<T: QueryData>(
    task: JoinHandle<Result<Option<T>, FetchError>>,
    query_key: String,
) -> QueryFuture<T> {
    async move {
        match task.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            Err(error) => {
                let error = QueryError::Join {
                    query_key,
                    reason: error.to_string(),
                };
                tracing::warn!(error = %error, "Fetch task cancelled");
                Ok(None)
            }
        }
    }
    .boxed()
    .shared()
}

// ============================================================================
// INSTANCE
// ============================================================================

pub(crate) struct QueryInner<T: QueryData, P: QueryParams> {
    id: Uuid,
    base_key: String,
    cache_key: CacheKey,
    definition: QueryDefinition<T, P>,
    options: ResolvedOptions<T, P>,
    enabled: bool,
    tags: BTreeSet<String>,
    state: Signal<QueryState<T>>,
    control: Mutex<QueryControl<T>>,
    cache: CacheHandle<T, P>,
    shared: Arc<ClientShared>,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<ListenerHandle>>,
    registration: Mutex<Option<TagRegistration>>,
}

impl<T: QueryData, P: QueryParams> QueryInner<T, P> {
    fn control(&self) -> MutexGuard<'_, QueryControl<T>> {
        lock(&self.control)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.control().disposed
    }

    fn debug(&self) -> bool {
        self.options.debug
    }

    fn key(&self) -> &str {
        self.cache_key.as_str()
    }

    /// Send `event`, mirror the machine's status into the state signal and
    /// return it.
    fn transition(&self, control: &mut QueryControl<T>, event: QueryEvent) -> QueryStatus {
        if let Some(transition) = control.machine.send(event) {
            tracing::trace!(
                query_key = self.key(),
                from = transition.from.as_str(),
                to = transition.to.as_str(),
                "Status transition"
            );
        }
        control.machine.status()
    }

    // === Creation ===

    /// Arm the cache-entry track, start the scheduler and the channel
    /// listener, and run the mount fetch.
    fn start(self: &Arc<Self>) {
        if let Some(hook) = &self.options.on_cache_entry_added {
            let promises = self.control().lifecycle.cache_entry_added();
            if let Some((loaded, removed)) = promises {
                self.runtime
                    .spawn(hook(self.definition.params.clone(), loaded, removed));
            }
        }

        if self.enabled && self.options.has_refetch_triggers() {
            let target: Weak<dyn RefetchTarget> = Arc::downgrade(self) as Weak<dyn RefetchTarget>;
            let settings = SchedulerSettings {
                on_focus: self.options.refetch_on_focus,
                on_reconnect: self.options.refetch_on_reconnect,
                interval: self.options.refetch_interval,
            };
            let handle = spawn_refetch_scheduler(target, &self.shared.env, settings);
            lock(&self.tasks).push(handle);
        }

        if self.options.broadcast {
            if let Some(channel) = &self.shared.channel {
                let weak = Arc::downgrade(self);
                let origin = self.shared.origin;
                let key = self.key().to_string();
                let handle = listen(channel.as_ref(), move |message: ChannelMessage| {
                    if message.is_from(origin) || message.message.query_key() != Some(key.as_str()) {
                        return;
                    }
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_remote(message.message);
                    }
                });
                *lock(&self.listener) = Some(handle);
            }
        }

        let mount = {
            let control = self.control();
            self.enabled
                && control.was_triggered
                && (self.options.refetch_on_mount || self.state.with(|s| s.data.is_none()))
        };
        if mount {
            let future = self.run_fetch(FetchOrigin::Mount);
            if self.options.suspense {
                self.control().initial = Some(future);
            }
        }
    }

    // === Fetch ===

    fn run_fetch(self: &Arc<Self>, origin: FetchOrigin) -> QueryFuture<T> {
        let (future, started) = {
            let mut control = self.control();
            if control.disposed {
                query_log!(self.debug(), query_key = self.key(), "Fetch skipped, query disposed");
                return settled_none();
            }
            if origin.triggers() {
                control.was_triggered = true;
            }
            if !(self.enabled && control.was_triggered) {
                query_log!(
                    self.debug(),
                    query_key = self.key(),
                    origin = origin.as_str(),
                    "Fetch skipped, query disabled"
                );
                return settled_none();
            }

            self.state.update_if(|s| s.error.take().is_some());
            control.failure_count = 0;

            if let Some(future) = control.active.as_ref().map(|a| a.future.clone()) {
                if let Some(gate) = control.retry_gate.take() {
                    let _ = gate.send(RetrySignal::Proceed);
                    query_log!(
                        self.debug(),
                        query_key = self.key(),
                        "Pending retry released by new fetch"
                    );
                } else {
                    tracing::trace!(query_key = self.key(), "Joined in-flight fetch");
                }
                return future;
            }

            if matches!(
                control.machine.status(),
                QueryStatus::Success | QueryStatus::Error
            ) {
                self.transition(&mut control, QueryEvent::Invalidate);
            }
            let status = self.transition(&mut control, QueryEvent::Request);
            let placeholder = self.placeholder();
            self.state.update(|s| {
                s.status = status;
                if let Some(data) = placeholder {
                    s.data = Some(data);
                }
            });

            control.generation += 1;
            let generation = control.generation;
            let task = self
                .runtime
                .spawn(fetch_task(Arc::downgrade(self), generation));
            let future = join_fetch(task, self.key().to_string());
            control.active = Some(ActiveFetch {
                generation,
                future: future.clone(),
            });

            let started = self.options.on_query_started.as_ref().map(|_| {
                if control.lifecycle.is_awaiting_fetch() {
                    tracing::trace!(query_key = self.key(), "Replacing unsettled query-started promise");
                }
                control.lifecycle.query_started()
            });

            query_log!(
                self.debug(),
                query_key = self.key(),
                origin = origin.as_str(),
                generation,
                "Fetch started"
            );
            (future, started)
        };

        if let (Some(hook), Some(fulfilled)) = (&self.options.on_query_started, started) {
            self.runtime
                .spawn(hook(self.definition.params.clone(), fulfilled));
        }
        future
    }

    /// Previous cross-parameter data shown while an SWR query with a merge
    /// function refetches.
    fn placeholder(&self) -> Option<T> {
        if !(self.options.swr && self.options.merge.is_some()) {
            return None;
        }
        match self.cache.get_cache(&self.cache_key) {
            Ok(slot) => slot.data().cloned(),
            Err(error) => {
                tracing::warn!(query_key = self.key(), error = %error, "Cache read failed");
                None
            }
        }
    }

    fn begin_attempt(&self, generation: u64) -> Option<AbortSignal> {
        let mut control = self.control();
        if !control.is_current(generation) {
            return None;
        }
        let controller = AbortController::new();
        let signal = controller.signal();
        control.abort = Some(controller);
        tracing::trace!(
            query_key = self.key(),
            attempt = control.failure_count + 1,
            "Calling fetcher"
        );
        Some(signal)
    }

    /// Commit a fetch result. Returns `None` when the fetch was abandoned by
    /// an invalidation or dispose; user callbacks never see abandoned results.
    fn complete_success(&self, generation: u64, data: T) -> Option<T> {
        if !self.control().is_current(generation) {
            tracing::trace!(query_key = self.key(), generation, "Abandoned fetch result dropped");
            return None;
        }
        let now = self.shared.clock.now();
        let params = &self.definition.params;

        let data = match &self.options.on_success {
            Some(on_success) => on_success(data, params),
            None => data,
        };
        let merged = match &self.options.merge {
            Some(merge) => {
                let previous = self.cache.get_cache(&self.cache_key).unwrap_or_else(|error| {
                    tracing::warn!(query_key = self.key(), error = %error, "Cache read failed");
                    CacheSlot::Vacant
                });
                let context = MergeContext {
                    params: params.clone(),
                    timestamp: now,
                };
                merge(&previous, data, &context)
            }
            None => data,
        };

        {
            let mut control = self.control();
            if !control.is_current(generation) {
                return None;
            }
            control.failure_count = 0;
            control.retry_gate = None;
            control.abort = None;
            control.has_fetched_once = true;
            let status = self.transition(&mut control, QueryEvent::FetchSuccessful);
            self.state.update(|s| {
                s.status = status;
                s.data = Some(merged.clone());
                s.error = None;
                s.last_updated = Some(now);
            });
            let entry = CacheEntry::new(merged.clone(), params.clone(), now);
            if let Err(error) = self.cache.set_cache(&self.cache_key, Some(entry)) {
                tracing::warn!(query_key = self.key(), error = %error, "Cache write failed");
            }
            control.lifecycle.fetch_succeeded(&self.state.subscribe());
            control.clear_active(generation);
        }

        self.persist(Some(&merged));
        self.post(QueryBroadcastMessage::QueryUpdated {
            query_key: self.key().to_string(),
            data: None,
        });
        if let Some(on_settled) = &self.options.on_settled {
            on_settled(Some(&merged), None, params);
        }
        query_log!(self.debug(), query_key = self.key(), "Fetch succeeded");
        Some(merged)
    }

    fn complete_failure(&self, generation: u64, error: FetchError) -> FailureOutcome<T> {
        let failure_count = {
            let mut control = self.control();
            if !control.is_current(generation) {
                return FailureOutcome::Settled(Ok(None));
            }
            control.abort = None;
            let retries_so_far = control.failure_count;
            control.failure_count += 1;

            if self.options.retry.should_retry(retries_so_far, &error) {
                let delay = self.options.retry.delay_for(control.failure_count);
                self.transition(&mut control, QueryEvent::Retry);
                let (tx, rx) = oneshot::channel();
                control.retry_gate = Some(tx);
                query_log!(
                    self.debug(),
                    query_key = self.key(),
                    failure_count = control.failure_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Fetch failed, retry scheduled"
                );
                return FailureOutcome::Retry { delay, gate: rx };
            }

            control.has_fetched_once = true;
            let status = self.transition(&mut control, QueryEvent::FetchFailed);
            self.state.update(|s| {
                s.status = status;
                s.error = Some(error.clone());
            });
            control.lifecycle.fetch_failed(&error);
            control.clear_active(generation);
            control.failure_count
        };

        tracing::error!(
            query_key = self.key(),
            failure_count,
            error = %error,
            "Fetch failed"
        );
        let params = &self.definition.params;
        if let Some(on_error) = &self.options.on_error {
            on_error(&error, params);
        }
        if let Some(on_settled) = &self.options.on_settled {
            on_settled(None, Some(&error), params);
        }

        if self.options.throw_on_error {
            FailureOutcome::Settled(Err(error))
        } else {
            FailureOutcome::Settled(Ok(None))
        }
    }

    /// Apply the retry-origin invalidation before the next attempt.
    fn resume_retry(&self, generation: u64) -> bool {
        let cleared = {
            let mut control = self.control();
            if !control.is_current(generation) {
                return false;
            }
            control.retry_gate = None;
            self.transition(&mut control, QueryEvent::Invalidate);
            let swr = self.options.swr;
            let cleared = self.state.update_if(|s| {
                let had_error = s.error.take().is_some();
                let clear = !swr && s.data.take().is_some();
                had_error || clear
            });
            self.clear_cache();
            query_log!(
                self.debug(),
                query_key = self.key(),
                failure_count = control.failure_count,
                "Retrying fetch"
            );
            cleared && !swr
        };
        if cleared {
            self.persist(None);
        }
        true
    }

    // === Invalidation ===

    fn invalidate_with(self: &Arc<Self>, origin: InvalidateOrigin) {
        let refetch = {
            let mut control = self.control();
            if control.disposed {
                return;
            }
            if let Some(gate) = control.retry_gate.take() {
                let _ = gate.send(RetrySignal::Abandon);
                control.active = None;
                control.generation += 1;
                // The abandoned fetch leaves the machine in fetching.
                control.machine = QueryStateMachine::new();
                query_log!(
                    self.debug(),
                    query_key = self.key(),
                    "Pending retry abandoned by invalidation"
                );
            }
            let status = self.transition(&mut control, QueryEvent::Invalidate);
            let swr = self.options.swr;
            self.state.update(|s| {
                s.status = status;
                if !swr {
                    s.data = None;
                }
            });
            self.clear_cache();
            if self.options.lazy && origin.rearms_lazy() {
                control.was_triggered = false;
            }
            self.enabled && control.was_triggered
        };

        if !self.options.swr {
            self.persist(None);
        }
        if origin.is_local() {
            self.post(QueryBroadcastMessage::invalidate(self.key()));
        }
        query_log!(
            self.debug(),
            query_key = self.key(),
            origin = origin.as_str(),
            refetch,
            "Query invalidated"
        );

        if refetch {
            let this = Arc::clone(self);
            self.shared.batch.defer(move || {
                let _ = this.run_fetch(FetchOrigin::Invalidation);
            });
        }
    }

    fn clear_cache(&self) {
        if let Err(error) = self.cache.set_cache(&self.cache_key, None) {
            tracing::warn!(query_key = self.key(), error = %error, "Cache clear failed");
        }
    }

    fn handle_remote(self: &Arc<Self>, message: QueryBroadcastMessage) {
        match message {
            QueryBroadcastMessage::Invalidate { .. } => {
                self.invalidate_with(InvalidateOrigin::Remote);
            }
            QueryBroadcastMessage::Refetch { .. } => {
                let _ = self.run_fetch(FetchOrigin::Remote);
            }
            other => {
                tracing::trace!(
                    query_key = self.key(),
                    message_type = other.message_type(),
                    "Ignoring channel message"
                );
            }
        }
    }

    // === Side channels ===

    fn persist(&self, data: Option<&T>) {
        let Some(persister) = &self.options.persister else {
            return;
        };
        let key = persist_key(self.key());
        match data {
            Some(data) => persister.set_item(&key, data.clone()),
            None => persister.remove_item(&key),
        }
    }

    fn post(&self, message: QueryBroadcastMessage) {
        if !self.options.broadcast {
            return;
        }
        if let Some(channel) = &self.shared.channel {
            channel.post_message(ChannelMessage::new(self.shared.origin, message));
        }
    }

    // === Teardown ===

    fn teardown(&self) {
        let (rejected, loaded) = {
            let mut control = self.control();
            if control.disposed {
                return;
            }
            control.disposed = true;
            control.generation += 1;
            if let Some(gate) = control.retry_gate.take() {
                let _ = gate.send(RetrySignal::Abandon);
            }
            if let Some(abort) = control.abort.take() {
                abort.abort();
            }
            control.active = None;
            control.initial = None;
            let loaded = control.lifecycle.has_loaded();
            (control.lifecycle.teardown(), loaded)
        };

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.listener).take();
        lock(&self.registration).take();
        self.cache.release();

        query_log!(
            self.debug(),
            query_key = self.key(),
            loaded,
            rejected_loaded = rejected,
            "Query disposed"
        );
    }
}

impl<T: QueryData, P: QueryParams> Drop for QueryInner<T, P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<T: QueryData, P: QueryParams> TagTarget for QueryInner<T, P> {
    fn invalidate_by_tag(self: Arc<Self>) {
        self.invalidate_with(InvalidateOrigin::Tag);
    }
}

impl<T: QueryData, P: QueryParams> RefetchTarget for QueryInner<T, P> {
    fn query_key(&self) -> &str {
        self.key()
    }

    fn debug_logging(&self) -> bool {
        self.debug()
    }

    fn refetch_inputs(&self, reason: RefetchReason) -> RefetchInputs {
        let control = self.control();
        RefetchInputs {
            reason,
            enabled: self.enabled && control.was_triggered && !control.disposed,
            lazy: self.options.lazy,
            has_fetched_once: control.has_fetched_once,
            is_loading: control.active.is_some(),
            last_updated: self.state.with(|s| s.last_updated),
            stale_time: self.options.stale_time,
            now: self.shared.clock.now(),
            has_focus: self.shared.env.has_focus(),
            refetch_in_background: self.options.refetch_interval_in_background,
        }
    }

    fn trigger_refetch(self: Arc<Self>, reason: RefetchReason) {
        self.shared
            .batch
            .run(|| self.invalidate_with(InvalidateOrigin::Scheduler(reason)));
    }
}

/// Clears the dedup guard if the fetch task ends without settling
/// (cancellation or a panicking callback).
struct ActiveFetchGuard<T: QueryData, P: QueryParams> {
    query: Weak<QueryInner<T, P>>,
    generation: u64,
}

impl<T: QueryData, P: QueryParams> Drop for ActiveFetchGuard<T, P> {
    fn drop(&mut self) {
        if let Some(query) = self.query.upgrade() {
            query.control().clear_active(self.generation);
        }
    }
}

async fn fetch_task<T: QueryData, P: QueryParams>(
    query: Weak<QueryInner<T, P>>,
    generation: u64,
) -> Result<Option<T>, FetchError> {
    let _guard = ActiveFetchGuard {
        query: query.clone(),
        generation,
    };

    loop {
        let (fetcher, signal) = {
            let Some(inner) = query.upgrade() else {
                return Ok(None);
            };
            let Some(signal) = inner.begin_attempt(generation) else {
                return Ok(None);
            };
            (Arc::clone(&inner.definition.fetcher), signal)
        };

        let result = fetcher.fetch(signal).await;

        let (delay, gate) = {
            let Some(inner) = query.upgrade() else {
                return Ok(None);
            };
            let error = match result {
                Ok(data) => return Ok(inner.complete_success(generation, data)),
                Err(error) => error,
            };
            match inner.complete_failure(generation, error) {
                FailureOutcome::Retry { delay, gate } => (delay, gate),
                FailureOutcome::Settled(result) => return result,
            }
        };

        let proceed = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            signal = gate => matches!(signal, Ok(RetrySignal::Proceed)),
        };
        if !proceed {
            return Ok(None);
        }

        let resumed = match query.upgrade() {
            Some(inner) => inner.resume_retry(generation),
            None => false,
        };
        if !resumed {
            return Ok(None);
        }
    }
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

/// A live query instance.
///
/// Clones share the instance. The instance is torn down when the last
/// clone drops or [`Query::dispose`] is called: timers are cleared, the
/// in-flight fetch is aborted, the cache reference is released and the
/// lifecycle removal promise resolves.
pub struct Query<T: QueryData, P: QueryParams> {
    inner: Arc<QueryInner<T, P>>,
}

impl<T: QueryData, P: QueryParams> Clone for Query<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueryData + fmt::Debug, P: QueryParams> fmt::Debug for Query<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.inner.id)
            .field("query_key", &self.inner.key())
            .field("state", &self.state())
            .finish()
    }
}

impl<T: QueryData, P: QueryParams> Query<T, P> {
    pub(crate) fn create(
        shared: Arc<ClientShared>,
        base_key: &str,
        definition: QueryDefinition<T, P>,
        options: QueryOptions<T, P>,
    ) -> QuarryResult<Self> {
        let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime {
            query_key: base_key.to_string(),
        })?;
        let options = options.resolve(&shared.config)?;
        let cache_key = CacheKey::with_serializer(
            base_key,
            &definition.params,
            options.serialize_query_params.as_ref(),
        );
        let cache = shared.cache.bucket::<T, P>(base_key, options.ttl)?;

        let enabled = options.enabled && definition.enabled;
        let was_triggered = options.suspense || !options.lazy;
        let data = options
            .persister
            .as_ref()
            .and_then(|p| p.get_item(&persist_key(cache_key.as_str())))
            .or_else(|| options.initial_data.as_ref().map(InitialData::resolve));

        let mut tags = definition.tags.clone();
        if let Some(source) = &options.tags {
            tags.extend(source.tags_for(&definition.params));
        }
        tags.insert(base_key.to_string());
        tags.insert(cache_key.to_string());

        let id = Uuid::now_v7();
        let registry = Arc::clone(&shared.tags);
        let inner = Arc::new_cyclic(|weak: &Weak<QueryInner<T, P>>| {
            let target: Weak<dyn TagTarget> = weak.clone() as Weak<dyn TagTarget>;
            let registration = registry.register(id, tags.clone(), target);
            QueryInner {
                id,
                base_key: base_key.to_string(),
                cache_key: cache_key.clone(),
                definition,
                enabled,
                tags,
                state: Signal::new(QueryState {
                    data,
                    ..QueryState::default()
                }),
                control: Mutex::new(QueryControl {
                    machine: QueryStateMachine::new(),
                    abort: None,
                    retry_gate: None,
                    active: None,
                    generation: 0,
                    failure_count: 0,
                    has_fetched_once: false,
                    was_triggered,
                    disposed: false,
                    lifecycle: LifecycleBroker::new(cache_key.as_str()),
                    initial: None,
                }),
                options,
                cache,
                shared,
                runtime,
                tasks: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                registration: Mutex::new(Some(registration)),
            }
        });

        query_log!(
            inner.debug(),
            query_key = inner.key(),
            enabled,
            was_triggered,
            "Query created"
        );
        inner.start();
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<QueryInner<T, P>>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<QueryInner<T, P>> {
        Arc::downgrade(&self.inner)
    }

    // === Operations ===

    /// Mark the query triggered and return the in-flight or a newly started fetch.
    pub fn fetch(&self) -> QueryFuture<T> {
        self.inner.run_fetch(FetchOrigin::Explicit)
    }

    /// Drop the current data (unless SWR) and cache entry, then refetch if enabled.
    pub fn invalidate(&self) {
        self.inner.invalidate_with(InvalidateOrigin::Manual);
    }

    /// Abort the in-flight fetcher call. Pending retry timers are unaffected.
    pub fn cancel(&self) {
        if let Some(abort) = self.inner.control().abort.as_ref() {
            abort.abort();
            query_log!(self.inner.debug(), query_key = self.inner.key(), "Fetch cancelled");
        }
    }

    /// Tear the instance down now instead of on last drop.
    pub fn dispose(&self) {
        self.inner.teardown();
    }

    /// The mount fetch of a suspense query, for the host to await.
    pub fn suspense_future(&self) -> Option<QueryFuture<T>> {
        self.inner.control().initial.clone()
    }

    // === Projection ===

    pub fn state(&self) -> QueryState<T> {
        self.inner.state.get()
    }

    pub fn subscribe(&self) -> SignalReader<QueryState<T>> {
        self.inner.state.subscribe()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.with(|s| s.data.clone())
    }

    pub fn error(&self) -> Option<FetchError> {
        self.inner.state.with(|s| s.error.clone())
    }

    pub fn status(&self) -> QueryStatus {
        self.inner.state.with(|s| s.status)
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.with(QueryState::is_loading)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.state.with(|s| s.last_updated)
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.control().failure_count
    }

    /// Enabled and, for lazy queries, triggered.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled && self.inner.control().was_triggered
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// The cache store's slot for this instance's cache key.
    ///
    /// # Errors
    /// `QueryError::Disposed` once the instance has released its bucket.
    pub fn cache_slot(&self) -> QuarryResult<CacheSlot<T, P>> {
        if self.is_disposed() {
            return Err(QueryError::Disposed {
                query_key: self.inner.key().to_string(),
            }
            .into());
        }
        Ok(self.inner.cache.get_cache(&self.inner.cache_key)?)
    }

    // === Identity ===

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn base_key(&self) -> &str {
        &self.inner.base_key
    }

    pub fn query_key(&self) -> &str {
        self.inner.key()
    }

    pub fn params(&self) -> &P {
        &self.inner.definition.params
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.inner.tags
    }

    pub fn options(&self) -> &ResolvedOptions<T, P> {
        &self.inner.options
    }
}
