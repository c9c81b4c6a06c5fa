//! File-based key-value store for persistent storage.

use crate::error::StorageResult;
use crate::store::{validate_key, KeyValueStore};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A directory-backed key-value store.
///
/// Each key is stored in its own file `<dir>/<key>`. Writes go to a
/// temporary sibling file which is synced and then renamed over the target,
/// so a crash mid-write leaves either the old or the new value on disk.
///
/// # Example
///
/// ```no_run
/// use fleetcheck_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("state")).unwrap();
/// store.save("records", b"[]").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl KeyValueStore for FileStore {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!(".{key}.tmp"));

        let _guard = self.write_lock.lock();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_store() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("state")).unwrap();
        assert!(store.dir().exists());
        assert_eq!(store.load("records").unwrap(), None);
    }

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("records", b"hello").unwrap();
        assert_eq!(store.load("records").unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn persistence_across_reopens() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.save("offline_queue", b"[\"item\"]").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            store.load("offline_queue").unwrap(),
            Some(b"[\"item\"]".to_vec())
        );
    }

    #[test]
    fn overwrite_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("k", b"one").unwrap();
        store.save("k", b"two").unwrap();
        assert_eq!(store.load("k").unwrap(), Some(b"two".to_vec()));
        assert!(!dir.path().join(".k.tmp").exists());
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save("k", b"v").unwrap();
        store.remove("k").unwrap();
        assert!(!dir.path().join("k").exists());
        store.remove("k").unwrap();
    }

    #[test]
    fn rejects_traversal_keys() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.save("../escape", b"v").is_err());
    }
}
