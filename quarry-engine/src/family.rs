//! Query families
//!
//! A family is a named template: a factory from parameters to a
//! [`QueryDefinition`] plus shared options. Asking for the same parameters
//! while an instance is alive returns that instance instead of a new one.

use crate::client::QueryClient;
use crate::options::QueryOptions;
use crate::query::{Query, QueryInner};
use quarry_core::{QuarryResult, QueryData, QueryDefinition, QueryParams};
use quarry_storage::CacheKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type DefinitionFactory<T, P> = Arc<dyn Fn(&P) -> QueryDefinition<T, P> + Send + Sync>;

/// Parameterized query template with instance reuse.
pub struct QueryFamily<T: QueryData, P: QueryParams> {
    client: QueryClient,
    base_key: String,
    factory: DefinitionFactory<T, P>,
    options: QueryOptions<T, P>,
    instances: Mutex<HashMap<String, Weak<QueryInner<T, P>>>>,
}

impl<T: QueryData, P: QueryParams> fmt::Debug for QueryFamily<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFamily")
            .field("base_key", &self.base_key)
            .field("live", &self.len())
            .finish()
    }
}

impl<T: QueryData, P: QueryParams> QueryFamily<T, P> {
    pub(crate) fn new<F>(
        client: QueryClient,
        base_key: &str,
        factory: F,
        options: QueryOptions<T, P>,
    ) -> Self
    where
        F: Fn(&P) -> QueryDefinition<T, P> + Send + Sync + 'static,
    {
        Self {
            client,
            base_key: base_key.to_string(),
            factory: Arc::new(factory),
            options,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<String, Weak<QueryInner<T, P>>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The live instance for `params`, or a new one.
    ///
    /// A disposed instance is never reused, even while other handles keep
    /// it allocated; its table slot is replaced by the new instance.
    ///
    /// Instances are matched on the JSON form of `params`, not on a custom
    /// cache-key serializer, so two pages sharing one cache key stay
    /// separate instances.
    ///
    /// # Errors
    /// Whatever [`QueryClient::query`] returns for a new instance.
    pub fn get(&self, params: P) -> QuarryResult<Query<T, P>> {
        let identity = CacheKey::new(&self.base_key, &params).to_string();
        let mut instances = self.instances();
        if let Some(inner) = instances.get(&identity).and_then(Weak::upgrade) {
            if !inner.is_disposed() {
                tracing::trace!(query_key = identity.as_str(), "Reusing family instance");
                return Ok(Query::from_inner(inner));
            }
            tracing::trace!(query_key = identity.as_str(), "Replacing disposed family instance");
        }

        let definition = (self.factory)(&params);
        let query = self
            .client
            .query(&self.base_key, definition, self.options.clone())?;
        instances.retain(|_, weak| is_live(weak));
        instances.insert(identity, query.downgrade());
        Ok(query)
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances().values().filter(|weak| is_live(weak)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn base_key(&self) -> &str {
        &self.base_key
    }
}

fn is_live<T: QueryData, P: QueryParams>(weak: &Weak<QueryInner<T, P>>) -> bool {
    weak.upgrade().is_some_and(|inner| !inner.is_disposed())
}
