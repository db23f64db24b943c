//! QUARRY Core - Query Engine Primitives
//!
//! Data types, error taxonomy, engine-wide defaults, the retry policy and
//! the query state machine. Every other quarry crate depends on this one.
//! Nothing in here spawns tasks or holds shared caches.

pub mod abort;
pub mod clock;
pub mod config;
pub mod constants;
pub mod definition;
pub mod error;
pub mod retry;
pub mod signal;
pub mod state;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use abort::{AbortController, AbortSignal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QueryConfig;
pub use definition::{query_executor, FnFetcher, QueryDefinition, QueryFetcher};
pub use error::{
    CacheError, ConfigError, FetchError, LifecycleError, QuarryError, QuarryResult, QueryError,
};
pub use retry::{retry_delay, should_retry, RetryDelay, RetryOption, RetryPolicy};
pub use signal::{Batch, BatchJob, Signal, SignalReader};
pub use state::{QueryEvent, QueryStateMachine, QueryStatus, Transition};

// ============================================================================
// SHARED TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Values a query can produce.
///
/// Blanket-implemented; exists to keep bounds short.
pub trait QueryData: Clone + Send + Sync + 'static {}

impl<T> QueryData for T where T: Clone + Send + Sync + 'static {}

/// Parameters a query is invoked with. Must serialize to build cache keys.
pub trait QueryParams: Clone + Serialize + Send + Sync + 'static {}

impl<P> QueryParams for P where P: Clone + Serialize + Send + Sync + 'static {}
