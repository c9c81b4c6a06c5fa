//! Remote document store abstraction.
//!
//! The remote side is a plain tree of folders and files addressed by
//! `/`-separated paths relative to the store root. The engine only needs
//! list, read, write, create-folder and delete-folder; everything else
//! (tokens, paging, status mapping) belongs to the implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fleetcheck_model::Checklist;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// One child of a remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Name within the parent folder.
    pub name: String,
    /// Store-specific identifier, when the store has one.
    pub id: Option<String>,
    /// True for folders.
    pub is_folder: bool,
    /// Size in bytes for files.
    pub size: Option<u64>,
}

impl RemoteEntry {
    /// A folder entry.
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            is_folder: true,
            size: None,
        }
    }

    /// A file entry.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            id: None,
            is_folder: false,
            size: Some(size),
        }
    }
}

/// A remote store of folders and files.
///
/// Implementations report a missing path as [`SyncError::NotFound`], an
/// existing one on exclusive create as [`SyncError::AlreadyExists`] and a
/// rejected credential as [`SyncError::Unauthorized`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Lists the direct children of a folder.
    async fn list_children(&self, path: &str) -> SyncResult<Vec<RemoteEntry>>;

    /// Reads a file.
    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Writes a file. Without `overwrite`, an existing file is an error.
    async fn write_file(&self, path: &str, bytes: &[u8], overwrite: bool) -> SyncResult<()>;

    /// Creates one folder; its parent must exist.
    async fn create_folder(&self, path: &str) -> SyncResult<()>;

    /// Deletes a folder and everything below it.
    async fn delete_folder(&self, path: &str) -> SyncResult<()>;

    /// Creates every missing folder along `path`. Idempotent.
    async fn ensure_folder(&self, path: &str) -> SyncResult<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);

            match self.list_children(&current).await {
                Ok(_) => {}
                Err(SyncError::NotFound(_)) => match self.create_folder(&current).await {
                    Ok(()) | Err(SyncError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Remote paths of one organization's data.
///
/// ```text
/// <base>/<scope>/Data/<id>/<id>.json
/// <base>/<scope>/Data/<id>/<id>_backup.json
/// <base>/<scope>/Checklists/<title>.json
/// <base>/<scope>/Checklists/<title>_backup.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    /// Creates the layout for `base_path` and an organization scope.
    pub fn new(base_path: &str, scope: &str) -> Self {
        let root = [base_path, scope]
            .iter()
            .flat_map(|part| part.split('/'))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self { root }
    }

    /// Organization root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Folder holding one sub-folder per record.
    pub fn data_dir(&self) -> String {
        format!("{}/Data", self.root)
    }

    /// Folder of one record.
    pub fn record_dir(&self, id: Uuid) -> String {
        format!("{}/Data/{id}", self.root)
    }

    /// Primary file of a record.
    pub fn record_file(&self, id: Uuid) -> String {
        format!("{}/Data/{id}/{id}.json", self.root)
    }

    /// Backup file of a record.
    pub fn record_backup(&self, id: Uuid) -> String {
        format!("{}/Data/{id}/{id}_backup.json", self.root)
    }

    /// Folder holding checklist definitions.
    pub fn checklists_dir(&self) -> String {
        format!("{}/Checklists", self.root)
    }

    /// Primary file of a checklist.
    pub fn checklist_file(&self, checklist: &Checklist) -> String {
        self.checklist_file_for_stem(&checklist.file_stem())
    }

    /// Backup file of a checklist.
    pub fn checklist_backup(&self, checklist: &Checklist) -> String {
        self.checklist_backup_for_stem(&checklist.file_stem())
    }

    pub(crate) fn checklist_file_for_stem(&self, stem: &str) -> String {
        format!("{}/Checklists/{stem}.json", self.root)
    }

    pub(crate) fn checklist_backup_for_stem(&self, stem: &str) -> String {
        format!("{}/Checklists/{stem}_backup.json", self.root)
    }
}

/// Splits `path` into its parent and final segment.
fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Default)]
struct RemoteTree {
    folders: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl RemoteTree {
    fn has_folder(&self, path: &str) -> bool {
        path.is_empty() || self.folders.contains(path)
    }
}

/// In-memory remote store with fault injection.
///
/// The root folder (`""`) always exists.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    tree: Mutex<RemoteTree>,
    offline: AtomicBool,
    unauthorized_remaining: AtomicUsize,
    failing_writes: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryRemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`SyncError::NotConnected`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with [`SyncError::Unauthorized`].
    pub fn fail_next_unauthorized(&self, count: usize) {
        self.unauthorized_remaining.store(count, Ordering::SeqCst);
    }

    /// Makes writes to paths containing `fragment` fail with a transport error.
    pub fn fail_writes_containing(&self, fragment: impl Into<String>) {
        self.failing_writes.lock().push(fragment.into());
    }

    /// Clears write failures.
    pub fn clear_write_failures(&self) {
        self.failing_writes.lock().clear();
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Writes a file, creating missing parent folders.
    pub fn put_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let path = normalize(path);
        let mut tree = self.tree.lock();
        let mut parent = split_parent(&path).0;
        while !parent.is_empty() {
            tree.folders.insert(parent.to_string());
            parent = split_parent(parent).0;
        }
        tree.files.insert(path, bytes.into());
    }

    /// Returns a file's content.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().files.get(&normalize(path)).cloned()
    }

    /// All file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.tree.lock().files.keys().cloned().collect()
    }

    /// Returns true if the folder exists.
    pub fn folder_exists(&self, path: &str) -> bool {
        self.tree.lock().has_folder(&normalize(path))
    }

    /// Number of `read_file` calls.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_file` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `list_children` calls.
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Number of `delete_folder` calls.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicUsize) -> SyncResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        let rejected = self
            .unauthorized_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(SyncError::Unauthorized("token expired".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn list_children(&self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        self.enter(&self.lists).await?;
        let path = normalize(path);
        let tree = self.tree.lock();
        if !tree.has_folder(&path) {
            return Err(SyncError::NotFound(path));
        }

        let folders = tree
            .folders
            .iter()
            .filter(|folder| split_parent(folder).0 == path)
            .map(|folder| RemoteEntry::folder(split_parent(folder).1));
        let files = tree
            .files
            .iter()
            .filter(|(file, _)| split_parent(file).0 == path)
            .map(|(file, bytes)| RemoteEntry::file(split_parent(file).1, bytes.len() as u64));
        Ok(folders.chain(files).collect())
    }

    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>> {
        self.enter(&self.reads).await?;
        let path = normalize(path);
        self.tree
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or(SyncError::NotFound(path))
    }

    async fn write_file(&self, path: &str, bytes: &[u8], overwrite: bool) -> SyncResult<()> {
        self.enter(&self.writes).await?;
        let path = normalize(path);
        if self
            .failing_writes
            .lock()
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
        {
            return Err(SyncError::transport_retryable(format!("write to {path} failed")));
        }

        let mut tree = self.tree.lock();
        if !tree.has_folder(split_parent(&path).0) {
            return Err(SyncError::NotFound(split_parent(&path).0.to_string()));
        }
        if !overwrite && tree.files.contains_key(&path) {
            return Err(SyncError::AlreadyExists(path));
        }
        tree.files.insert(path, bytes.to_vec());
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> SyncResult<()> {
        self.enter(&self.writes).await?;
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if !tree.has_folder(split_parent(&path).0) {
            return Err(SyncError::NotFound(split_parent(&path).0.to_string()));
        }
        if tree.has_folder(&path) {
            return Err(SyncError::AlreadyExists(path));
        }
        tree.folders.insert(path);
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> SyncResult<()> {
        self.enter(&self.deletes).await?;
        let path = normalize(path);
        let mut tree = self.tree.lock();
        if path.is_empty() || !tree.folders.contains(&path) {
            return Err(SyncError::NotFound(path));
        }
        let prefix = format!("{path}/");
        tree.folders
            .retain(|folder| folder != &path && !folder.starts_with(&prefix));
        tree.files.retain(|file, _| !file.starts_with(&prefix));
        Ok(())
    }
}
