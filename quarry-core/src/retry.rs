//! Retry policy for failed fetches.
//!
//! Decides whether a failed fetch is retried and how long to wait before the
//! next attempt. Backoff is deterministic: no jitter is applied.
//!
//! ```text
//! delay(attempt) = min(delay_unit * 2^attempt, max_retry_delay)
//! ```

use crate::FetchError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding a retry from the failure count and the latest error.
pub type RetryPredicate = Arc<dyn Fn(u32, &FetchError) -> bool + Send + Sync>;

/// Delay function mapping an attempt index to a delay.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How a query retries failed fetches.
#[derive(Clone)]
pub enum RetryOption {
    /// `false` never retries, `true` retries up to `max_retries`.
    Enabled(bool),
    /// Retry while the failure count is below this number, regardless of `max_retries`.
    Count(u32),
    /// Fully delegated decision.
    Predicate(RetryPredicate),
}

impl RetryOption {
    /// Create a predicate-based retry option.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &FetchError) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }
}

impl Default for RetryOption {
    fn default() -> Self {
        Self::Enabled(false)
    }
}

impl From<bool> for RetryOption {
    fn from(value: bool) -> Self {
        Self::Enabled(value)
    }
}

impl From<u32> for RetryOption {
    fn from(value: u32) -> Self {
        Self::Count(value)
    }
}

impl fmt::Debug for RetryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled(enabled) => f.debug_tuple("Enabled").field(enabled).finish(),
            Self::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// How long to wait between retries.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// Exponential backoff from `delay_unit`, capped at `max_retry_delay`.
    #[default]
    Backoff,
    /// The same delay for every attempt.
    Fixed(Duration),
    /// Caller-computed delay, used verbatim.
    Custom(RetryDelayFn),
}

impl RetryDelay {
    /// Create a custom delay function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }
}

impl From<Duration> for RetryDelay {
    fn from(value: Duration) -> Self {
        Self::Fixed(value)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff => f.write_str("Backoff"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decide whether a fetch that has failed `failure_count` times is retried.
///
/// - `Enabled(false)` never retries.
/// - `Enabled(true)` retries while `failure_count < max_retries`.
/// - `Count(n)` retries while `failure_count < n`; `max_retries` is ignored.
/// - `Predicate(f)` returns `f(failure_count, error)`.
pub fn should_retry(
    failure_count: u32,
    error: &FetchError,
    retry: &RetryOption,
    max_retries: u32,
) -> bool {
    match retry {
        RetryOption::Enabled(false) => false,
        RetryOption::Enabled(true) => failure_count < max_retries,
        RetryOption::Count(limit) => failure_count < *limit,
        RetryOption::Predicate(predicate) => predicate(failure_count, error),
    }
}

/// Compute the delay before retry number `attempt_index`.
pub fn retry_delay(
    attempt_index: u32,
    delay: &RetryDelay,
    delay_unit: Duration,
    max_retry_delay: Duration,
) -> Duration {
    match delay {
        RetryDelay::Custom(f) => f(attempt_index),
        RetryDelay::Fixed(fixed) => *fixed,
        RetryDelay::Backoff => {
            let factor = 2u32.checked_pow(attempt_index).unwrap_or(u32::MAX);
            delay_unit.saturating_mul(factor).min(max_retry_delay)
        }
    }
}

/// A resolved retry policy for one query instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry: RetryOption,
    pub max_retries: u32,
    pub delay: RetryDelay,
    pub delay_unit: Duration,
    pub max_retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryOption::default(),
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            delay: RetryDelay::default(),
            delay_unit: Duration::from_millis(crate::constants::DEFAULT_DELAY_UNIT_MS),
            max_retry_delay: Duration::from_millis(crate::constants::DEFAULT_MAX_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// See [`should_retry`].
    pub fn should_retry(&self, failure_count: u32, error: &FetchError) -> bool {
        should_retry(failure_count, error, &self.retry, self.max_retries)
    }

    /// See [`retry_delay`].
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        retry_delay(
            attempt_index,
            &self.delay,
            self.delay_unit,
            self.max_retry_delay,
        )
    }
}
