//! Engine-wide query defaults

use crate::constants::*;
use crate::{ConfigError, QuarryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default option values applied to every query that does not override them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Whether queries run automatically.
    pub enabled: bool,
    /// Retry bound used when `retry = true`.
    pub max_retries: u32,
    /// Time until fetched data is considered stale.
    pub stale_time: Duration,
    /// Whether failed fetches are retried at all.
    pub retry: bool,
    /// Base unit of the exponential backoff.
    pub delay_unit: Duration,
    /// Cap on any single retry delay.
    pub max_retry_delay: Duration,
    pub refetch_on_mount: bool,
    pub refetch_on_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval_in_background: bool,
    /// Lifetime of an unreferenced cache bucket.
    pub ttl: Duration,
    /// Keep stale data visible while revalidating.
    pub swr: bool,
    pub suspense: bool,
    pub lazy: bool,
    /// Propagate invalidations over the cross-tab channel.
    pub broadcast: bool,
    /// Raise lifecycle logs from `trace` to `debug`.
    pub debug: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES,
            stale_time: Duration::from_millis(DEFAULT_STALE_TIME_MS),
            retry: false,
            delay_unit: Duration::from_millis(DEFAULT_DELAY_UNIT_MS),
            max_retry_delay: Duration::from_millis(DEFAULT_MAX_RETRY_DELAY_MS),
            refetch_on_mount: true,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            refetch_interval_in_background: false,
            ttl: Duration::from_millis(DEFAULT_TTL_MS),
            swr: true,
            suspense: false,
            lazy: false,
            broadcast: false,
            debug: false,
        }
    }
}

impl QueryConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create QueryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `QUARRY_ENABLED`: Run queries automatically (default: true)
    /// - `QUARRY_MAX_RETRIES`: Retry bound for `retry = true` (default: 3)
    /// - `QUARRY_STALE_TIME_MS`: Staleness threshold (default: 0)
    /// - `QUARRY_RETRY`: Retry failed fetches (default: false)
    /// - `QUARRY_DELAY_UNIT_MS`: Backoff unit (default: 1000)
    /// - `QUARRY_MAX_RETRY_DELAY_MS`: Backoff cap (default: 30000)
    /// - `QUARRY_TTL_MS`: Unreferenced bucket lifetime (default: 0)
    /// - `QUARRY_SWR`: Stale-while-revalidate (default: true)
    /// - `QUARRY_LAZY`: Wait for an explicit fetch (default: false)
    /// - `QUARRY_BROADCAST`: Cross-tab invalidation (default: false)
    /// - `QUARRY_DEBUG`: Verbose lifecycle logs (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("QUARRY_ENABLED", defaults.enabled),
            max_retries: env_parse("QUARRY_MAX_RETRIES", defaults.max_retries),
            stale_time: env_millis("QUARRY_STALE_TIME_MS", defaults.stale_time),
            retry: env_bool("QUARRY_RETRY", defaults.retry),
            delay_unit: env_millis("QUARRY_DELAY_UNIT_MS", defaults.delay_unit),
            max_retry_delay: env_millis("QUARRY_MAX_RETRY_DELAY_MS", defaults.max_retry_delay),
            ttl: env_millis("QUARRY_TTL_MS", defaults.ttl),
            swr: env_bool("QUARRY_SWR", defaults.swr),
            lazy: env_bool("QUARRY_LAZY", defaults.lazy),
            broadcast: env_bool("QUARRY_BROADCAST", defaults.broadcast),
            debug: env_bool("QUARRY_DEBUG", defaults.debug),
            ..defaults
        }
    }

    /// Set the default staleness threshold.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the retry bound used by `retry = true`.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable retries by default.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Set the backoff unit and cap.
    pub fn with_backoff(mut self, delay_unit: Duration, max_retry_delay: Duration) -> Self {
        self.delay_unit = delay_unit;
        self.max_retry_delay = max_retry_delay;
        self
    }

    /// Set the unreferenced bucket lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable stale-while-revalidate by default.
    pub fn with_swr(mut self, swr: bool) -> Self {
        self.swr = swr;
        self
    }

    /// Enable or disable cross-tab broadcast by default.
    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Enable or disable verbose lifecycle logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - delay_unit > 0
    /// - max_retry_delay >= delay_unit
    pub fn validate(&self) -> QuarryResult<()> {
        if self.delay_unit.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "delay_unit".to_string(),
                value: format!("{:?}", self.delay_unit),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        if self.max_retry_delay < self.delay_unit {
            return Err(ConfigError::InvalidValue {
                field: "max_retry_delay".to_string(),
                value: format!("{:?}", self.max_retry_delay),
                reason: format!("must be at least delay_unit ({:?})", self.delay_unit),
            }
            .into());
        }

        Ok(())
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|s| s == "true" || s == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparseable config value");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    let fallback = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_parse(name, fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuarryError;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = QueryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stale_time, Duration::ZERO);
        assert!(!config.retry);
        assert_eq!(config.delay_unit, Duration::from_millis(1000));
        assert_eq!(config.max_retry_delay, Duration::from_millis(30_000));
        assert!(config.refetch_on_mount);
        assert!(config.refetch_on_focus);
        assert!(config.refetch_on_reconnect);
        assert!(!config.refetch_interval_in_background);
        assert!(config.swr);
        assert!(!config.suspense);
        assert!(!config.lazy);
        assert!(!config.broadcast);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(QueryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_delay_unit_is_rejected() {
        let config = QueryConfig::default().with_backoff(Duration::ZERO, Duration::from_secs(1));
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            QuarryError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "delay_unit"
        ));
    }

    #[test]
    fn test_cap_below_unit_is_rejected() {
        let config = QueryConfig::default()
            .with_backoff(Duration::from_millis(500), Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = QueryConfig::new()
            .with_stale_time(Duration::from_secs(5))
            .with_max_retries(7)
            .with_retry(true)
            .with_ttl(Duration::from_secs(60))
            .with_swr(false)
            .with_broadcast(true)
            .with_debug(true);

        assert_eq!(config.stale_time, Duration::from_secs(5));
        assert_eq!(config.max_retries, 7);
        assert!(config.retry);
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert!(!config.swr);
        assert!(config.broadcast);
        assert!(config.debug);
    }

    #[test]
    fn test_config_serde_roundtrip_preserves_durations() {
        let config = QueryConfig::default().with_stale_time(Duration::from_millis(1500));
        let json = serde_json::to_string(&config).expect("serialize");
        let back: QueryConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
