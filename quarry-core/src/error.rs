//! Error types for quarry operations

use thiserror::Error;

/// Errors raised by a query function.
///
/// These are routed through the retry policy and, once retries are
/// exhausted, stored on the query's error state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed: {reason}")]
    Failed { reason: String },

    #[error("Request failed with status {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("Fetch aborted")]
    Aborted,

    #[error("Fetch timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

impl FetchError {
    /// Shorthand for [`FetchError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`FetchError::Http`].
    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
        }
    }

    /// Returns true if the fetch was cancelled through its abort signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Errors raised against lifecycle promises.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// The cache entry was removed before its data ever loaded.
    ///
    /// Callers awaiting `cache_data_loaded` may match on this variant and
    /// ignore it.
    #[error("Promise never resolved before cacheEntryRemoved.")]
    NeverResolvedBeforeRemoval,

    #[error("Lifecycle promise for {query_key} dropped without settling")]
    Dropped { query_key: String },
}

/// Cross-parameter cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache bucket {bucket_id} holds a different entry type than requested")]
    TypeMismatch { bucket_id: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Query instance errors that are not fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query {query_key} has been disposed")]
    Disposed { query_key: String },

    #[error("No async runtime available to drive {query_key}")]
    NoRuntime { query_key: String },

    #[error("Fetch task for {query_key} failed to join: {reason}")]
    Join { query_key: String, reason: String },
}

/// Master error type for all quarry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuarryError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),
}

impl QuarryError {
    /// Returns true for the leak-prevention rejection of `cache_data_loaded`.
    pub fn is_never_resolved(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle(LifecycleError::NeverResolvedBeforeRemoval)
        )
    }
}

/// Result type alias for quarry operations.
pub type QuarryResult<T> = Result<T, QuarryError>;

// =============================================================================
// TESTS
// =============================================================================
