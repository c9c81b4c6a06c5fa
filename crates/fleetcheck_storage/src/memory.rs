//! In-memory key-value store for testing.

use crate::error::StorageResult;
use crate::store::{validate_key, KeyValueStore};
use parking_lot::RwLock;
use std::collections::HashMap;

/// An in-memory key-value store.
///
/// Suitable for unit tests, integration tests and sessions that don't need
/// persistence. The store is thread-safe and can be shared across tasks.
///
/// # Example
///
/// ```rust
/// use fleetcheck_storage::{InMemoryStore, KeyValueStore};
///
/// let store = InMemoryStore::new();
/// store.save("k", b"v").unwrap();
/// assert!(store.contains("k").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `entries`.
    ///
    /// Useful for testing recovery and migration scenarios.
    #[must_use]
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        Self {
            data: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    /// Returns the stored keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KeyValueStore for InMemoryStore {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.data.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.data.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.keys().is_empty());
        assert_eq!(store.load("records").unwrap(), None);
    }

    #[test]
    fn save_and_load() {
        let store = InMemoryStore::new();
        store.save("records", b"[1,2]").unwrap();
        assert_eq!(store.load("records").unwrap(), Some(b"[1,2]".to_vec()));
    }

    #[test]
    fn save_replaces_value() {
        let store = InMemoryStore::new();
        store.save("k", b"first").unwrap();
        store.save("k", b"second").unwrap();
        assert_eq!(store.load("k").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn remove_missing_is_ok() {
        let store = InMemoryStore::new();
        store.remove("nothing").unwrap();
        store.save("k", b"v").unwrap();
        store.remove("k").unwrap();
        assert!(!store.contains("k").unwrap());
    }

    #[test]
    fn with_entries_prepopulates() {
        let store = InMemoryStore::with_entries([("a", b"1".to_vec()), ("b", b"2".to_vec())]);
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn invalid_key_rejected() {
        let store = InMemoryStore::new();
        assert!(store.save("a/b", b"v").is_err());
    }
}
