//! Constants for quarry
//!
//! Engine-wide default values. Per-query options fall back to these
//! through [`crate::QueryConfig`].

// ============================================================================
// RETRY
// ============================================================================

/// Default upper bound on retries when `retry = true`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base unit for exponential backoff in milliseconds.
pub const DEFAULT_DELAY_UNIT_MS: u64 = 1000;

/// Default cap on a single retry delay in milliseconds.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

// ============================================================================
// STALENESS & LIFETIME
// ============================================================================

/// Default time in milliseconds before fetched data is considered stale.
pub const DEFAULT_STALE_TIME_MS: u64 = 0;

/// Default cache bucket TTL in milliseconds once no instance references it.
pub const DEFAULT_TTL_MS: u64 = 0;

/// Default interval for the background cache reaper in milliseconds.
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 1000;

// ============================================================================
// KEYS & CHANNELS
// ============================================================================

/// Separator between the base key and serialized params in a cache key.
pub const CACHE_KEY_SEPARATOR: &str = "::";

/// Name of the cross-tab channel.
pub const CHANNEL_NAME: &str = "quarry_query_sync";

/// Buffered messages per cross-tab channel subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Buffered focus/visibility events per scheduler.
pub const DEFAULT_FOCUS_EVENT_CAPACITY: usize = 64;

/// Key prefix used by persistence adapters.
pub const PERSIST_KEY_PREFIX: &str = "quarry_persist_";
