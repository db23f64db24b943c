//! Cache key construction.
//!
//! A [`CacheKey`] can only be built from a base key plus serialized
//! parameters (or the base key alone when serialization fails), so two
//! instances agree on a key exactly when they agree on both parts.

use quarry_core::constants::CACHE_KEY_SEPARATOR;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Custom parameter serializer, replacing the default JSON encoding.
pub type ParamSerializer<P> = Arc<dyn Fn(&P) -> Result<String, String> + Send + Sync>;

/// `base::serialized-params`, identifying one cross-parameter cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    inner: String,
    base_len: usize,
}

impl CacheKey {
    /// Build a key using the default JSON serialization of `params`.
    pub fn new<P: Serialize>(base: &str, params: &P) -> Self {
        match serde_json::to_string(params) {
            Ok(serialized) => Self::from_parts(base, &serialized),
            Err(e) => Self::fallback(base, &e.to_string()),
        }
    }

    /// Build a key with a caller-supplied serializer, falling back to JSON
    /// when none is given.
    pub fn with_serializer<P: Serialize>(
        base: &str,
        params: &P,
        serializer: Option<&ParamSerializer<P>>,
    ) -> Self {
        match serializer {
            Some(serialize) => match serialize(params) {
                Ok(serialized) => Self::from_parts(base, &serialized),
                Err(reason) => Self::fallback(base, &reason),
            },
            None => Self::new(base, params),
        }
    }

    fn from_parts(base: &str, serialized: &str) -> Self {
        Self {
            inner: format!("{base}{CACHE_KEY_SEPARATOR}{serialized}"),
            base_len: base.len(),
        }
    }

    fn fallback(base: &str, reason: &str) -> Self {
        tracing::warn!(
            query_key = base,
            reason,
            "Failed to serialize query params, falling back to base key"
        );
        Self::base_only(base)
    }

    /// A key carrying no parameter component.
    pub fn base_only(base: &str) -> Self {
        Self {
            inner: base.to_string(),
            base_len: base.len(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// The base key this cache key was built from.
    pub fn base(&self) -> &str {
        &self.inner[..self.base_len]
    }

    /// The serialized parameter part, if any.
    pub fn params_part(&self) -> Option<&str> {
        self.inner[self.base_len..].strip_prefix(CACHE_KEY_SEPARATOR)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}
