//! Query definitions
//!
//! A [`QueryDefinition`] bundles the fetch function with the parameters it
//! was built for. Definitions are immutable; a new one is built whenever the
//! parameters change.

use crate::abort::AbortSignal;
use crate::FetchError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// An async data source for a query.
#[async_trait]
pub trait QueryFetcher<T>: Send + Sync {
    /// Fetch a fresh value. Implementations should stop early once
    /// `signal` reports an abort, typically returning [`FetchError::Aborted`].
    async fn fetch(&self, signal: AbortSignal) -> Result<T, FetchError>;
}

/// Adapts an async closure into a [`QueryFetcher`].
#[derive(Clone)]
pub struct FnFetcher<F>(pub F);

#[async_trait]
impl<T, F, Fut> QueryFetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn(AbortSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    async fn fetch(&self, signal: AbortSignal) -> Result<T, FetchError> {
        (self.0)(signal).await
    }
}

/// Fetch function plus the parameters and flags of one invocation.
pub struct QueryDefinition<T, P> {
    pub fetcher: Arc<dyn QueryFetcher<T>>,
    pub params: P,
    pub enabled: bool,
    pub tags: BTreeSet<String>,
}

impl<T, P: Clone> Clone for QueryDefinition<T, P> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            params: self.params.clone(),
            enabled: self.enabled,
            tags: self.tags.clone(),
        }
    }
}

impl<T, P: fmt::Debug> fmt::Debug for QueryDefinition<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("params", &self.params)
            .field("enabled", &self.enabled)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl<T: 'static, P> QueryDefinition<T, P> {
    pub fn new(fetcher: Arc<dyn QueryFetcher<T>>, params: P) -> Self {
        Self {
            fetcher,
            params,
            enabled: true,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Build a definition from an async closure.
///
/// ```ignore
/// let def = query_executor(|_signal| async { Ok(vec![1, 2, 3]) }, (), true);
/// ```
pub fn query_executor<T, P, F, Fut>(fetch: F, params: P, enabled: bool) -> QueryDefinition<T, P>
where
    T: Send + 'static,
    F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    QueryDefinition::new(Arc::new(FnFetcher(fetch)), params).with_enabled(enabled)
}
