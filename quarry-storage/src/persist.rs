//! Persistence adapters for the displayed data of a query.
//!
//! Adapters are synchronous and only ever see the final data a query
//! shows, never the cache store's internals.

use quarry_core::constants::PERSIST_KEY_PREFIX;
use quarry_core::CacheError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Synchronous key-value storage for persisted query data.
pub trait SyncStorage<T>: Send + Sync {
    fn get_item(&self, key: &str) -> Option<T>;

    fn set_item(&self, key: &str, value: T);

    fn remove_item(&self, key: &str);
}

/// Storage key used for a query's persisted data.
pub fn persist_key(query_key: &str) -> String {
    format!("{PERSIST_KEY_PREFIX}{query_key}")
}

// ============================================================================
// MEMORY
// ============================================================================

/// In-process storage holding values as-is. Clones share the same map.
#[derive(Debug)]
pub struct MemoryStorage<T> {
    items: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> Clone for MemoryStorage<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for MemoryStorage<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T> MemoryStorage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync> SyncStorage<T> for MemoryStorage<T> {
    fn get_item(&self, key: &str) -> Option<T> {
        self.items.read().ok()?.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: T) {
        if let Ok(mut items) = self.items.write() {
            items.insert(key.to_string(), value);
        }
    }

    fn remove_item(&self, key: &str) {
        if let Ok(mut items) = self.items.write() {
            items.remove(key);
        }
    }
}

// ============================================================================
// JSON
// ============================================================================

/// String-valued storage holding JSON documents, shaped like browser
/// `localStorage`. Several [`JsonStorage`] views may share one backend.
pub type JsonBackend = Arc<RwLock<HashMap<String, String>>>;

/// Stores values as JSON text.
///
/// Values that fail to encode or decode are logged and treated as absent.
pub struct JsonStorage<T> {
    backend: JsonBackend,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStorage<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonStorage<T> {
    fn default() -> Self {
        Self::with_backend(JsonBackend::default())
    }
}

impl<T> JsonStorage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: JsonBackend) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    pub fn backend(&self) -> JsonBackend {
        Arc::clone(&self.backend)
    }

    /// The raw JSON text stored under `key`.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.backend.read().ok()?.get(key).cloned()
    }
}

impl<T: Serialize + DeserializeOwned> JsonStorage<T> {
    /// Encode `value` without storing it.
    pub fn encode(key: &str, value: &T) -> Result<String, CacheError> {
        serde_json::to_string(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn decode(key: &str, raw: &str) -> Result<T, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<T: Serialize + DeserializeOwned> SyncStorage<T> for JsonStorage<T> {
    fn get_item(&self, key: &str) -> Option<T> {
        let raw = self.raw(key)?;
        match Self::decode(key, &raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable persisted value");
                None
            }
        }
    }

    fn set_item(&self, key: &str, value: T) {
        let encoded = match Self::encode(key, &value) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key, error = %e, "Skipping persist of unencodable value");
                return;
            }
        };
        if let Ok(mut backend) = self.backend.write() {
            backend.insert(key.to_string(), encoded);
        }
    }

    fn remove_item(&self, key: &str) {
        if let Ok(mut backend) = self.backend.write() {
            backend.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[test]
    fn test_persist_key_prefix() {
        assert_eq!(persist_key("me"), "quarry_persist_me");
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.set_item("a", 1u32);
        assert_eq!(storage.get_item("a"), Some(1));
        storage.remove_item("a");
        assert_eq!(storage.get_item("a"), None);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_json_storage_shares_backend() {
        let writer: JsonStorage<Profile> = JsonStorage::new();
        let reader: JsonStorage<Profile> = JsonStorage::with_backend(writer.backend());

        let profile = Profile {
            name: "ada".to_string(),
            visits: 3,
        };
        writer.set_item("profile", profile.clone());

        assert_eq!(reader.get_item("profile"), Some(profile));
        assert!(writer.raw("profile").unwrap().contains("\"visits\":3"));
    }

    #[test]
    fn test_json_storage_discards_corrupt_value() {
        let storage: JsonStorage<Profile> = JsonStorage::new();
        storage
            .backend()
            .write()
            .unwrap()
            .insert("profile".to_string(), "{not json".to_string());
        assert_eq!(storage.get_item("profile"), None);
    }
}
