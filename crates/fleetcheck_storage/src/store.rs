//! Key-value store trait definition.

use crate::error::{StorageError, StorageResult};

/// A persistent blob store addressed by string keys.
///
/// # Invariants
///
/// - `load` returns exactly the bytes most recently passed to `save`
/// - `save` replaces the whole value atomically from the reader's view
/// - `remove` of a missing key is not an error
/// - Stores must be `Send + Sync`; every handle may be shared across tasks
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Loads the blob stored under `key`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the write fails.
    fn save(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or the removal fails.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Returns true if a value is stored under `key`.
    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.load(key)?.is_some())
    }
}

/// Checks that `key` is non-empty and only uses `[A-Za-z0-9_.-]`.
///
/// Keys double as file names for [`super::FileStore`], so every store
/// applies the same rule.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
