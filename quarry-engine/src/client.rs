//! Query client
//!
//! The client owns what query instances share: engine defaults, the
//! cross-parameter cache store, the tag registry, the host environment, the
//! side-effect batch, the clock and the optional cross-tab channel.

use crate::environment::Environment;
use crate::family::QueryFamily;
use crate::options::QueryOptions;
use crate::query::Query;
use crate::tags::TagRegistry;
use once_cell::sync::Lazy;
use quarry_core::{
    Batch, Clock, QuarryResult, QueryConfig, QueryData, QueryDefinition, QueryParams, SystemClock,
};
use quarry_events::QueryChannel;
use quarry_storage::{CacheStats, CacheStore, ReaperMetrics};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// State shared by every instance created through one client.
pub(crate) struct ClientShared {
    /// Identifies this client's posts on the channel.
    pub(crate) origin: Uuid,
    pub(crate) config: QueryConfig,
    pub(crate) cache: CacheStore,
    pub(crate) tags: Arc<TagRegistry>,
    pub(crate) env: Environment,
    pub(crate) batch: Batch,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) channel: Option<Arc<dyn QueryChannel>>,
}

/// Entry point for creating and invalidating queries.
///
/// Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("origin", &self.shared.origin)
            .field("config", &self.shared.config)
            .field("queries", &self.shared.tags.len())
            .field("has_channel", &self.shared.channel.is_some())
            .finish()
    }
}

static GLOBAL: Lazy<QueryClient> = Lazy::new(|| {
    let config = QueryConfig::from_env();
    match QueryClient::builder().config(config).build() {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!(error = %error, "Invalid QUARRY_* configuration, using defaults");
            QueryClient::from_parts(QueryClientBuilder::default())
        }
    }
});

impl QueryClient {
    /// Create a client with `config` and default collaborators.
    ///
    /// # Errors
    /// `ConfigError` if `config` fails validation.
    pub fn new(config: QueryConfig) -> QuarryResult<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::default()
    }

    /// Process-wide client configured from `QUARRY_*` environment variables.
    pub fn global() -> &'static QueryClient {
        &GLOBAL
    }

    fn from_parts(builder: QueryClientBuilder) -> Self {
        let clock = builder.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Self {
            shared: Arc::new(ClientShared {
                origin: Uuid::now_v7(),
                cache: CacheStore::with_clock(Arc::clone(&clock)),
                config: builder.config,
                tags: Arc::new(TagRegistry::new()),
                env: builder.env.unwrap_or_default(),
                batch: Batch::new(),
                clock,
                channel: builder.channel,
            }),
        }
    }

    // === Queries ===

    /// Create a query instance for `definition` under `base_key`.
    ///
    /// Enabled, non-lazy instances start fetching immediately.
    ///
    /// # Errors
    /// - `ConfigError` if `options` fail validation
    /// - `CacheError::TypeMismatch` if `base_key` is already used with another data type
    /// - `QueryError::NoRuntime` outside a tokio runtime
    pub fn query<T, P>(
        &self,
        base_key: &str,
        definition: QueryDefinition<T, P>,
        options: QueryOptions<T, P>,
    ) -> QuarryResult<Query<T, P>>
    where
        T: QueryData,
        P: QueryParams,
    {
        Query::create(Arc::clone(&self.shared), base_key, definition, options)
    }

    /// A parameterized template whose instances are reused while alive.
    pub fn family<T, P, F>(
        &self,
        base_key: &str,
        factory: F,
        options: QueryOptions<T, P>,
    ) -> QueryFamily<T, P>
    where
        T: QueryData,
        P: QueryParams,
        F: Fn(&P) -> QueryDefinition<T, P> + Send + Sync + 'static,
    {
        QueryFamily::new(self.clone(), base_key, factory, options)
    }

    /// Invalidate every live instance carrying any of `tags`, in one batch.
    ///
    /// Returns the number of instances invalidated.
    pub fn invalidate_tags(&self, tags: &[&str]) -> usize {
        let targets = self.shared.tags.matching(tags);
        let count = targets.len();
        self.shared.batch.run(|| {
            for target in targets {
                target.invalidate_by_tag();
            }
        });
        tracing::debug!(tags = ?tags, count, "Invalidated by tag");
        count
    }

    /// Run `f` with refetches and other deferred side effects held until it returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.batch.run(f)
    }

    // === Shared state ===

    pub fn config(&self) -> &QueryConfig {
        &self.shared.config
    }

    pub fn environment(&self) -> &Environment {
        &self.shared.env
    }

    pub fn cache(&self) -> &CacheStore {
        &self.shared.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn tag_registry(&self) -> &TagRegistry {
        &self.shared.tags
    }

    pub fn origin(&self) -> Uuid {
        self.shared.origin
    }

    /// Spawn the background sweep of expired cache buckets.
    ///
    /// The task stops when `shutdown_rx` observes `true`.
    pub fn spawn_cache_reaper(
        &self,
        sweep_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<Arc<ReaperMetrics>> {
        self.shared.cache.spawn_reaper(sweep_interval, shutdown_rx)
    }
}

/// Builder for [`QueryClient`].
#[derive(Default)]
pub struct QueryClientBuilder {
    config: QueryConfig,
    clock: Option<Arc<dyn Clock>>,
    env: Option<Environment>,
    channel: Option<Arc<dyn QueryChannel>>,
}

impl QueryClientBuilder {
    pub fn config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn environment(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn QueryChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// # Errors
    /// `ConfigError` if the config fails validation.
    pub fn build(self) -> QuarryResult<QueryClient> {
        self.config.validate()?;
        Ok(QueryClient::from_parts(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{ManualClock, QuarryError};

    #[test]
    fn test_invalid_config_rejected() {
        let config = QueryConfig {
            delay_unit: Duration::ZERO,
            ..QueryConfig::default()
        };
        assert!(matches!(
            QueryClient::new(config),
            Err(QuarryError::Config(_))
        ));
    }

    #[test]
    fn test_builder_wires_collaborators() {
        let clock = Arc::new(ManualClock::default());
        let env = Environment::new(false, false);
        let client = QueryClient::builder()
            .clock(clock)
            .environment(env.clone())
            .build()
            .unwrap();

        env.set_online(true);
        assert!(client.environment().is_online());
        assert!(client.tag_registry().is_empty());
        assert_eq!(client.cache().bucket_count(), 0);
    }

    #[test]
    fn test_clients_have_distinct_origins() {
        let a = QueryClient::new(QueryConfig::default()).unwrap();
        let b = QueryClient::new(QueryConfig::default()).unwrap();
        assert_ne!(a.origin(), b.origin());
        assert_eq!(a.clone().origin(), a.origin());
    }

    #[test]
    fn test_batch_returns_value() {
        let client = QueryClient::new(QueryConfig::default()).unwrap();
        assert_eq!(client.batch(|| 7), 7);
    }
}
