//! Cache entries and slot states.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The last successful result recorded under one cache key.
///
/// Entries are immutable snapshots. Writers replace the whole entry, so a
/// reader holding an `Arc<CacheEntry>` never observes a partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T, P> {
    /// Final data after `on_success` and `merge`.
    pub data: T,
    /// Parameters of the fetch that produced `data`.
    pub params: P,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
}

impl<T, P> CacheEntry<T, P> {
    pub fn new(data: T, params: P, timestamp: DateTime<Utc>) -> Self {
        Self {
            data,
            params,
            timestamp,
        }
    }
}

/// What a bucket holds for a key.
///
/// `Vacant` and `Cleared` are deliberately distinct: a merge function can
/// tell "never fetched" from "fetched, then invalidated".
#[derive(Debug, PartialEq)]
pub enum CacheSlot<T, P> {
    /// The key has never been written.
    Vacant,
    /// The key was invalidated and holds no data.
    Cleared,
    /// The key holds a result.
    Filled(Arc<CacheEntry<T, P>>),
}

impl<T, P> Clone for CacheSlot<T, P> {
    fn clone(&self) -> Self {
        match self {
            Self::Vacant => Self::Vacant,
            Self::Cleared => Self::Cleared,
            Self::Filled(entry) => Self::Filled(Arc::clone(entry)),
        }
    }
}

impl<T, P> CacheSlot<T, P> {
    pub fn entry(&self) -> Option<&Arc<CacheEntry<T, P>>> {
        match self {
            Self::Filled(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&T> {
        self.entry().map(|entry| &entry.data)
    }

    pub fn is_vacant(&self) -> bool {
        matches!(self, Self::Vacant)
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::Cleared)
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled(_))
    }
}

impl<T, P> From<Option<Arc<CacheEntry<T, P>>>> for CacheSlot<T, P> {
    fn from(value: Option<Arc<CacheEntry<T, P>>>) -> Self {
        match value {
            Some(entry) => Self::Filled(entry),
            None => Self::Cleared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_accessors() {
        let entry = Arc::new(CacheEntry::new(vec![1, 2], 0u32, Utc::now()));
        let filled = CacheSlot::Filled(Arc::clone(&entry));
        assert!(filled.is_filled());
        assert_eq!(filled.data(), Some(&vec![1, 2]));

        let cleared: CacheSlot<Vec<i32>, u32> = None.into();
        assert!(cleared.is_cleared());
        assert!(cleared.data().is_none());

        let vacant: CacheSlot<Vec<i32>, u32> = CacheSlot::Vacant;
        assert!(vacant.is_vacant());
        assert_ne!(vacant, cleared);
    }
}
