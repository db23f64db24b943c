//! Tag registry
//!
//! Maps tags to live query instances so callers can invalidate groups of
//! queries without holding references to them. Every instance registers on
//! creation and unregisters when its [`TagRegistration`] drops, so the
//! registry only ever holds live instances.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use uuid::Uuid;

/// An instance that can be invalidated by tag.
pub(crate) trait TagTarget: Send + Sync {
    fn invalidate_by_tag(self: Arc<Self>);
}

struct TagEntry {
    tags: BTreeSet<String>,
    target: Weak<dyn TagTarget>,
}

/// Registry of live, tagged query instances.
#[derive(Default)]
pub struct TagRegistry {
    entries: RwLock<HashMap<Uuid, TagEntry>>,
}

impl std::fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, TagEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, TagEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        id: Uuid,
        tags: BTreeSet<String>,
        target: Weak<dyn TagTarget>,
    ) -> TagRegistration {
        self.write().insert(id, TagEntry { tags, target });
        TagRegistration {
            registry: Arc::downgrade(self),
            id,
        }
    }

    /// Live instances carrying any of `tags`.
    pub(crate) fn matching(&self, tags: &[&str]) -> Vec<Arc<dyn TagTarget>> {
        self.read()
            .values()
            .filter(|entry| tags.iter().any(|tag| entry.tags.contains(*tag)))
            .filter_map(|entry| entry.target.upgrade())
            .collect()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Tags registered for the instance `id`.
    pub fn tags_of(&self, id: Uuid) -> Option<BTreeSet<String>> {
        self.read().get(&id).map(|entry| entry.tags.clone())
    }
}

/// Removes its instance from the registry when dropped.
#[derive(Debug)]
pub(crate) struct TagRegistration {
    registry: Weak<TagRegistry>,
    id: Uuid,
}

impl Drop for TagRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl TagTarget for Counter {
        fn invalidate_by_tag(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn target(counter: &Arc<Counter>) -> Weak<dyn TagTarget> {
        let strong: Arc<dyn TagTarget> = Arc::clone(counter) as Arc<dyn TagTarget>;
        Arc::downgrade(&strong)
    }

    #[test]
    fn test_matching_by_any_tag() {
        let registry = Arc::new(TagRegistry::new());
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        let _ra = registry.register(Uuid::now_v7(), tags(&["todos", "user:1"]), target(&a));
        let _rb = registry.register(Uuid::now_v7(), tags(&["todos"]), target(&b));

        for t in registry.matching(&["user:1"]) {
            t.invalidate_by_tag();
        }
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 0);

        assert_eq!(registry.matching(&["todos", "other"]).len(), 2);
        assert!(registry.matching(&["other"]).is_empty());
    }

    #[test]
    fn test_registration_drop_unregisters() {
        let registry = Arc::new(TagRegistry::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let id = Uuid::now_v7();
        let registration = registry.register(id, tags(&["t"]), target(&counter));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tags_of(id), Some(tags(&["t"])));

        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dead_targets_are_not_returned() {
        let registry = Arc::new(TagRegistry::new());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let _registration = registry.register(Uuid::now_v7(), tags(&["t"]), target(&counter));
        drop(counter);
        assert!(registry.matching(&["t"]).is_empty());
    }
}
