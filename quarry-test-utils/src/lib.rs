//! QUARRY Test Utilities
//!
//! Centralized test infrastructure for the quarry workspace:
//! - Scripted and paginated fetchers with invocation counters
//! - Proptest generators for core types
//! - Test fixtures for common configurations
//! - Custom assertions for quarry-specific validation
//! - Tracing setup for tests

// Re-export core types for convenience
pub use quarry_core::{
    AbortSignal, Clock, FetchError, LifecycleError, ManualClock, QuarryError, QuarryResult,
    QueryConfig, QueryEvent, QueryFetcher, QueryStatus, RetryOption,
};
pub use quarry_storage::{CacheEntry, CacheKey, CacheSlot, CacheStore, MemoryStorage};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// MOCK FETCHERS
// ============================================================================

struct ScriptState<T> {
    remaining: VecDeque<Result<T, FetchError>>,
    last: Option<Result<T, FetchError>>,
}

/// Fetcher that replays a fixed script of results.
///
/// Each call consumes the next scripted result; once the script runs out
/// the final result repeats. Clones share the script and the counter.
pub struct ScriptedFetcher<T> {
    state: Arc<Mutex<ScriptState<T>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl<T> Clone for ScriptedFetcher<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            calls: Arc::clone(&self.calls),
            delay: self.delay,
        }
    }
}

impl<T: Clone + Send + 'static> ScriptedFetcher<T> {
    pub fn new(script: impl IntoIterator<Item = Result<T, FetchError>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                remaining: script.into_iter().collect(),
                last: None,
            })),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Always succeed with `value`.
    pub fn always(value: T) -> Self {
        Self::new([Ok(value)])
    }

    /// Fail `failures` times with a generic error, then succeed with `value`.
    pub fn failing_then(failures: usize, value: T) -> Self {
        let mut script: Vec<Result<T, FetchError>> = (0..failures)
            .map(|i| Err(FetchError::failed(format!("scripted failure {}", i + 1))))
            .collect();
        script.push(Ok(value));
        Self::new(script)
    }

    /// Sleep for `delay` before answering each call. Aborts cut the sleep short.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append a result to the script.
    pub fn push(&self, result: Result<T, FetchError>) {
        if let Ok(mut state) = self.state.lock() {
            state.remaining.push_back(result);
        }
    }

    /// Number of times `fetch` has been called.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_result(&self) -> Result<T, FetchError> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.remaining.pop_front() {
            Some(result) => {
                state.last = Some(result.clone());
                result
            }
            None => state
                .last
                .clone()
                .unwrap_or_else(|| Err(FetchError::failed("empty script"))),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> QueryFetcher<T> for ScriptedFetcher<T> {
    async fn fetch(&self, signal: AbortSignal) -> Result<T, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signal.aborted() => return Err(FetchError::Aborted),
            }
        }
        self.next_result()
    }
}

/// Fetcher returning one page of sequential numbers.
///
/// Page `n` of size `s` holds `n*s .. n*s + s`.
#[derive(Clone)]
pub struct PageFetcher {
    page: u32,
    size: u32,
    calls: Arc<AtomicUsize>,
}

impl PageFetcher {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share an invocation counter across several page fetchers.
    pub fn with_counter(mut self, calls: Arc<AtomicUsize>) -> Self {
        self.calls = calls;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn expected(page: u32, size: u32) -> Vec<u32> {
        (page * size..page * size + size).collect()
    }
}

#[async_trait]
impl QueryFetcher<Vec<u32>> for PageFetcher {
    async fn fetch(&self, _signal: AbortSignal) -> Result<Vec<u32>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::expected(self.page, self.size))
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output goes through the test harness capture.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating quarry core types.

    use super::*;
    use proptest::prelude::*;

    /// Generate any state machine event.
    pub fn arb_query_event() -> impl Strategy<Value = QueryEvent> {
        prop_oneof![
            Just(QueryEvent::Request),
            Just(QueryEvent::FetchSuccessful),
            Just(QueryEvent::FetchFailed),
            Just(QueryEvent::Invalidate),
            Just(QueryEvent::Retry),
        ]
    }

    /// Generate any status.
    pub fn arb_query_status() -> impl Strategy<Value = QueryStatus> {
        prop_oneof![
            Just(QueryStatus::Idle),
            Just(QueryStatus::Fetching),
            Just(QueryStatus::Success),
            Just(QueryStatus::Error),
        ]
    }

    /// Generate a boolean or numeric retry option.
    pub fn arb_retry_option() -> impl Strategy<Value = RetryOption> {
        prop_oneof![
            any::<bool>().prop_map(RetryOption::Enabled),
            (0u32..10).prop_map(RetryOption::Count),
        ]
    }

    /// Generate a fetch error.
    pub fn arb_fetch_error() -> impl Strategy<Value = FetchError> {
        prop_oneof![
            "[a-z ]{1,20}".prop_map(|reason: String| FetchError::failed(reason)),
            (400u16..600, "[a-z ]{1,20}").prop_map(|(status, reason)| FetchError::http(status, reason)),
            Just(FetchError::Aborted),
            (1u64..60_000).prop_map(|elapsed_ms| FetchError::Timeout { elapsed_ms }),
        ]
    }

    /// Generate a config that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = QueryConfig> {
        (
            0u32..10,
            0u64..120_000,
            any::<bool>(),
            1u64..5_000,
            0u64..60_000,
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(
                |(max_retries, stale_ms, retry, unit_ms, extra_cap_ms, swr, lazy)| QueryConfig {
                    max_retries,
                    stale_time: Duration::from_millis(stale_ms),
                    retry,
                    delay_unit: Duration::from_millis(unit_ms),
                    max_retry_delay: Duration::from_millis(unit_ms + extra_cap_ms),
                    swr,
                    lazy,
                    ..QueryConfig::default()
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Common configurations for tests.

    use super::*;

    /// Config with a 10ms backoff unit and no automatic refetch triggers.
    pub fn fast_config() -> QueryConfig {
        QueryConfig {
            delay_unit: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(1000),
            refetch_on_focus: false,
            refetch_on_reconnect: false,
            ..QueryConfig::default()
        }
    }

    /// A manual clock parked at a fixed instant.
    pub fn fixed_clock() -> ManualClock {
        let start = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_else(chrono::Utc::now);
        ManualClock::new(start)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for quarry-specific validation.

    use super::*;

    /// Assert that a QuarryResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &QuarryResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a QuarryResult is the never-resolved-before-removal rejection.
    #[track_caller]
    pub fn assert_never_resolved<T: std::fmt::Debug>(result: &QuarryResult<T>) {
        match result {
            Err(QuarryError::Lifecycle(LifecycleError::NeverResolvedBeforeRemoval)) => {}
            other => panic!("Expected NeverResolvedBeforeRemoval, got: {:?}", other),
        }
    }

    /// Assert that a QuarryResult is a fetch error.
    #[track_caller]
    pub fn assert_fetch_error<T: std::fmt::Debug>(result: &QuarryResult<T>) {
        match result {
            Err(QuarryError::Fetch(_)) => {}
            other => panic!("Expected Fetch error, got: {:?}", other),
        }
    }

    /// Assert that a QuarryResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &QuarryResult<T>) {
        match result {
            Err(QuarryError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_scripted_fetcher_replays_then_repeats() {
        let fetcher = ScriptedFetcher::failing_then(2, 7u8);
        assert!(fetcher.fetch(AbortSignal::never()).await.is_err());
        assert!(fetcher.fetch(AbortSignal::never()).await.is_err());
        assert_eq!(fetcher.fetch(AbortSignal::never()).await, Ok(7));
        assert_eq!(fetcher.fetch(AbortSignal::never()).await, Ok(7));
        assert_eq!(fetcher.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_fetcher_delay_honours_abort() {
        let fetcher = ScriptedFetcher::always(1u8).with_delay(Duration::from_secs(10));
        let controller = quarry_core::AbortController::new();
        let signal = controller.signal();

        let f = fetcher.clone();
        let task = tokio::spawn(async move { f.fetch(signal).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        controller.abort();

        assert_eq!(task.await.unwrap(), Err(FetchError::Aborted));
    }

    #[tokio::test]
    async fn test_page_fetcher() {
        let fetcher = PageFetcher::new(1, 3);
        assert_eq!(fetcher.fetch(AbortSignal::never()).await, Ok(vec![3, 4, 5]));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fixtures::fast_config().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_generated_configs_validate(config in arb_valid_config()) {
            prop_assert!(config.validate().is_ok());
        }
    }
}
