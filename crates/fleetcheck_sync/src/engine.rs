//! Sync engine.
//!
//! A full pass fetches the remote record set, reconciles it with the local
//! one, applies the result to the [`LocalReplica`] and uploads whatever the
//! remote side is missing. At most one remote-writing operation runs at a
//! time; a caller arriving while one is in flight gets
//! [`SyncError::AlreadyInProgress`] instead of waiting.

use crate::config::SyncConfig;
use crate::credentials::{organization_scope, CredentialProvider};
use crate::error::{SyncError, SyncResult};
use crate::payload::PayloadCodec;
use crate::queue::OperationDispatcher;
use crate::remote::{RemoteLayout, RemoteStore};
use crate::replica::{ChangeOrigin, LocalReplica, Mutation};
use crate::secret::KeyService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetcheck_model::{
    detect_conflicts, merge, Checklist, ConflictPolicy, ConflictResolution, DriverRecord,
    OperationKind, PendingOperation, SyncConflict,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No remote-writing operation is running.
    Idle,
    /// A pass or push is running.
    Syncing,
}

impl SyncState {
    /// Returns true if the engine is busy.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Full passes that completed.
    pub passes_completed: u64,
    /// Full passes that failed.
    pub passes_failed: u64,
    /// Remote records decoded across passes.
    pub records_fetched: u64,
    /// Records uploaded by passes and pushes.
    pub records_pushed: u64,
    /// Conflicts merged automatically.
    pub conflicts_resolved: u64,
    /// Remote records skipped because neither file decoded.
    pub decode_failures: u64,
    /// Retries after a rejected credential.
    pub auth_retries: u64,
    /// Completion time of the last successful pass.
    pub last_sync: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of a full pass.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Remote records decoded.
    pub fetched: usize,
    /// Local records replaced by a merge.
    pub merged: usize,
    /// Remote-only records added locally.
    pub appended: usize,
    /// Records uploaded.
    pub uploaded: usize,
    /// Records whose upload failed, with the reason.
    pub upload_failures: Vec<(Uuid, String)>,
    /// Remote records skipped as undecodable.
    pub decode_failures: usize,
    /// Conflicts merged automatically.
    pub resolved_conflicts: usize,
    /// Conflicts left untouched for a manual decision.
    pub conflicts: Vec<SyncConflict>,
    /// Whether the local record set changed.
    pub local_changed: bool,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl PassReport {
    /// Returns true if every upload succeeded and nothing awaits a decision.
    pub fn is_clean(&self) -> bool {
        self.upload_failures.is_empty() && self.conflicts.is_empty()
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Uploaded record ids.
    pub pushed: Vec<Uuid>,
    /// Records whose upload failed, with the reason.
    pub failed: Vec<(Uuid, String)>,
}

/// What a pass must do, computed from the two record sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Records to write locally: merges and remote-only records.
    pub updates: Vec<DriverRecord>,
    /// Records to upload.
    pub uploads: Vec<DriverRecord>,
    /// Local records replaced by a merge.
    pub merged: usize,
    /// Remote-only records.
    pub appended: usize,
    /// Conflicts merged automatically.
    pub resolved: usize,
    /// Conflicts held back under [`ConflictPolicy::Manual`].
    pub unresolved: Vec<SyncConflict>,
    /// Local records not uploaded because their remote copy is unreadable.
    pub withheld: Vec<Uuid>,
}

/// Reconciles the local set with the remote set.
///
/// Per local record:
/// - absent remotely: upload it
/// - local strictly newer: keep it, upload it
/// - remote newer or equally old: replace it with `merge(local, remote)`,
///   and upload the merge if the remote copy lacks part of it
///
/// Remote-only records are appended. Under [`ConflictPolicy::Manual`],
/// conflicting records are left alone on both sides.
///
/// `unreadable` lists records whose remote folder exists but could not be
/// decoded. Their local copy is kept and not uploaded, so a payload this
/// device cannot read is never overwritten with older data.
pub fn reconcile(
    local: &[DriverRecord],
    remote: Vec<DriverRecord>,
    unreadable: &[Uuid],
    policy: ConflictPolicy,
) -> Reconciliation {
    let mut out = Reconciliation::default();
    let conflicts = detect_conflicts(local, &remote);
    let conflicting: HashSet<Uuid> = conflicts.iter().map(|c| c.record_id).collect();
    let auto = policy.auto_resolves();
    if !auto {
        out.unresolved = conflicts;
    }
    let unreadable: HashSet<Uuid> = unreadable.iter().copied().collect();

    let remote_by_id: HashMap<Uuid, &DriverRecord> = remote.iter().map(|r| (r.id, r)).collect();
    for ours in local {
        let in_conflict = conflicting.contains(&ours.id);
        if in_conflict && !auto {
            continue;
        }
        let Some(theirs) = remote_by_id.get(&ours.id) else {
            if unreadable.contains(&ours.id) {
                out.withheld.push(ours.id);
            } else {
                out.uploads.push(ours.clone());
            }
            continue;
        };
        if ours.last_evaluated > theirs.last_evaluated {
            out.uploads.push(ours.clone());
            continue;
        }

        let merged = merge(ours, theirs);
        if in_conflict {
            out.resolved += 1;
        }
        if merged != **theirs {
            out.uploads.push(merged.clone());
        }
        if merged != *ours {
            out.merged += 1;
            out.updates.push(merged);
        }
    }

    let local_ids: HashSet<Uuid> = local.iter().map(|r| r.id).collect();
    for theirs in remote {
        if !local_ids.contains(&theirs.id) {
            out.appended += 1;
            out.updates.push(theirs);
        }
    }
    out
}

#[derive(Debug, Default)]
struct RemoteFetch {
    records: Vec<DriverRecord>,
    /// Record folders whose payloads did not decode.
    undecodable: Vec<Uuid>,
}

/// Resets the engine to idle when a guarded operation ends or is dropped.
struct PassGuard<'a> {
    in_flight: &'a AtomicBool,
    state: &'a RwLock<SyncState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        *self.state.write() = SyncState::Idle;
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

/// The sync engine manages synchronization with the remote store.
pub struct SyncEngine<R: RemoteStore> {
    config: SyncConfig,
    remote: Arc<R>,
    credentials: Arc<dyn CredentialProvider>,
    codec: PayloadCodec,
    replica: Arc<LocalReplica>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    in_flight: AtomicBool,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Creates a new sync engine.
    pub fn new(
        config: SyncConfig,
        remote: Arc<R>,
        credentials: Arc<dyn CredentialProvider>,
        keys: Arc<KeyService>,
        replica: Arc<LocalReplica>,
    ) -> Self {
        let codec = PayloadCodec::new(keys, &config);
        Self {
            config,
            remote,
            credentials,
            codec,
            replica,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local replica.
    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    /// The payload codec.
    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    /// Remote paths for the current account.
    pub fn layout(&self) -> RemoteLayout {
        let account = self.credentials.account();
        let scope = organization_scope(account.as_deref(), &self.config.fallback_scope);
        RemoteLayout::new(&self.config.base_path, &scope)
    }

    fn begin(&self) -> SyncResult<PassGuard<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync already in progress, rejecting");
            return Err(SyncError::AlreadyInProgress);
        }
        *self.state.write() = SyncState::Syncing;
        Ok(PassGuard {
            in_flight: &self.in_flight,
            state: &self.state,
        })
    }

    /// Runs `operation`; on a rejected credential, invalidates it and runs
    /// `operation` exactly once more.
    async fn with_auth_retry<T, F, Fut>(&self, mut operation: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        match operation().await {
            Err(e) if e.is_unauthorized() => {
                warn!(error = %e, "credential rejected, refreshing and retrying once");
                self.stats.write().auth_retries += 1;
                self.credentials.invalidate().await;
                operation().await
            }
            result => result,
        }
    }

    /// Runs a full bidirectional pass.
    pub async fn full_pass(&self) -> SyncResult<PassReport> {
        let _guard = self.begin()?;
        let started = Instant::now();
        let layout = self.layout();
        let layout = &layout;
        info!(root = layout.root(), "sync pass started");

        let result = self
            .with_auth_retry(move || self.run_full_pass(layout))
            .await;

        let mut stats = self.stats.write();
        match result {
            Ok(report) => {
                let report = PassReport {
                    duration: started.elapsed(),
                    ..report
                };
                info!(
                    fetched = report.fetched,
                    merged = report.merged,
                    appended = report.appended,
                    uploaded = report.uploaded,
                    upload_failures = report.upload_failures.len(),
                    decode_failures = report.decode_failures,
                    conflicts = report.conflicts.len(),
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync pass finished"
                );
                stats.passes_completed += 1;
                stats.records_fetched += report.fetched as u64;
                stats.records_pushed += report.uploaded as u64;
                stats.conflicts_resolved += report.resolved_conflicts as u64;
                stats.decode_failures += report.decode_failures as u64;
                stats.last_sync = self.replica.last_synced();
                stats.last_error = None;
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "sync pass failed");
                stats.passes_failed += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_full_pass(&self, layout: &RemoteLayout) -> SyncResult<PassReport> {
        let snapshot = self.replica.records();
        let fetched = self.fetch_remote_records(layout).await?;
        let fetched_count = fetched.records.len();
        let decode_failures = fetched.undecodable.len();

        let reconciliation = reconcile(
            &snapshot,
            fetched.records,
            &fetched.undecodable,
            self.config.conflict_policy,
        );
        for conflict in &reconciliation.unresolved {
            info!(record_id = %conflict.record_id, "conflict held for manual resolution");
        }
        for id in &reconciliation.withheld {
            warn!(record_id = %id, "remote copy unreadable, local record not uploaded");
        }

        let changed = self.replica.apply_pass(&snapshot, reconciliation.updates)?;
        let push = self.push_records(layout, &reconciliation.uploads).await?;
        self.replica.mark_synced(Utc::now())?;

        Ok(PassReport {
            fetched: fetched_count,
            merged: reconciliation.merged,
            appended: reconciliation.appended,
            uploaded: push.pushed.len(),
            upload_failures: push.failed,
            decode_failures,
            resolved_conflicts: reconciliation.resolved,
            conflicts: reconciliation.unresolved,
            local_changed: !changed.is_empty(),
            duration: Duration::ZERO,
        })
    }

    /// Uploads `records` without fetching or merging.
    pub async fn push_only(&self, records: &[DriverRecord]) -> SyncResult<PushReport> {
        let _guard = self.begin()?;
        let layout = self.layout();
        let layout = &layout;

        let result = self
            .with_auth_retry(move || self.push_records(layout, records))
            .await;
        if let Ok(report) = &result {
            self.stats.write().records_pushed += report.pushed.len() as u64;
        }
        result
    }

    /// Uploads one record; any failure is returned.
    pub async fn push_record(&self, record: &DriverRecord) -> SyncResult<()> {
        let _guard = self.begin()?;
        let layout = self.layout();
        let layout = &layout;

        self.with_auth_retry(move || async move {
            self.remote.ensure_folder(&layout.data_dir()).await?;
            self.upload_record(layout, record).await
        })
        .await?;
        self.stats.write().records_pushed += 1;
        Ok(())
    }

    /// Deletes a record's remote folder. A missing folder is not an error.
    pub async fn delete_remote_record(&self, id: Uuid) -> SyncResult<()> {
        let _guard = self.begin()?;
        let layout = self.layout();
        let layout = &layout;

        self.with_auth_retry(move || async move {
            match self.remote.delete_folder(&layout.record_dir(id)).await {
                Ok(()) | Err(SyncError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await?;
        info!(record_id = %id, "remote record deleted");
        Ok(())
    }

    /// Uploads a checklist definition and its backup.
    pub async fn push_checklist(&self, checklist: &Checklist) -> SyncResult<()> {
        let _guard = self.begin()?;
        let layout = self.layout();
        let layout = &layout;
        let blob = self.codec.encode_json(checklist)?;
        let blob = blob.as_slice();

        self.with_auth_retry(move || async move {
            self.remote.ensure_folder(&layout.checklists_dir()).await?;
            self.remote
                .write_file(&layout.checklist_file(checklist), blob, true)
                .await?;
            self.remote
                .write_file(&layout.checklist_backup(checklist), blob, true)
                .await
        })
        .await?;
        debug!(title = %checklist.title, "checklist uploaded");
        Ok(())
    }

    /// Downloads every remote checklist and stores it locally.
    ///
    /// Read-only on the remote side, so it does not take the sync guard.
    pub async fn fetch_checklists(&self) -> SyncResult<Vec<Checklist>> {
        let layout = self.layout();
        let layout = &layout;
        let checklists = self
            .with_auth_retry(move || self.fetch_remote_checklists(layout))
            .await?;

        for checklist in &checklists {
            self.replica
                .apply_from(Mutation::UpsertChecklist(checklist.clone()), ChangeOrigin::Sync)?;
        }
        Ok(checklists)
    }

    /// Applies a manual decision for a conflict held by a pass.
    ///
    /// The chosen record replaces the local one and is uploaded unless it
    /// is the remote version already.
    pub async fn resolve_conflict(
        &self,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
    ) -> SyncResult<DriverRecord> {
        let resolved = conflict.resolve(resolution);
        self.replica
            .apply_from(Mutation::UpsertRecord(resolved.clone()), ChangeOrigin::Sync)?;
        if resolved != conflict.remote {
            self.push_record(&resolved).await?;
        }
        info!(record_id = %resolved.id, ?resolution, "conflict resolved");
        Ok(resolved)
    }

    async fn fetch_remote_records(&self, layout: &RemoteLayout) -> SyncResult<RemoteFetch> {
        let mut fetch = RemoteFetch::default();
        let entries = match self.remote.list_children(&layout.data_dir()).await {
            Ok(entries) => entries,
            Err(SyncError::NotFound(_)) => {
                debug!(root = layout.root(), "no remote data yet");
                return Ok(fetch);
            }
            Err(e) => return Err(e),
        };

        for entry in entries.into_iter().filter(|e| e.is_folder) {
            let Ok(id) = Uuid::parse_str(&entry.name) else {
                debug!(name = %entry.name, "ignoring non-record folder");
                continue;
            };
            let paths = [layout.record_file(id), layout.record_backup(id)];
            match self.read_first_decodable::<DriverRecord>(&paths).await? {
                Some(record) if record.id == id => fetch.records.push(record),
                Some(record) => {
                    warn!(folder = %id, record_id = %record.id, "record id does not match its folder, skipping");
                    fetch.undecodable.push(id);
                }
                None => {
                    warn!(record_id = %id, "remote record and backup undecodable, skipping");
                    fetch.undecodable.push(id);
                }
            }
        }
        Ok(fetch)
    }

    async fn fetch_remote_checklists(&self, layout: &RemoteLayout) -> SyncResult<Vec<Checklist>> {
        let entries = match self.remote.list_children(&layout.checklists_dir()).await {
            Ok(entries) => entries,
            Err(SyncError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let stems: BTreeSet<&str> = entries
            .iter()
            .filter(|e| !e.is_folder)
            .filter_map(|e| checklist_stem(&e.name))
            .collect();

        let mut checklists = Vec::new();
        for stem in stems {
            let paths = [
                layout.checklist_file_for_stem(stem),
                layout.checklist_backup_for_stem(stem),
            ];
            match self.read_first_decodable::<Checklist>(&paths).await? {
                Some(checklist) => checklists.push(checklist),
                None => warn!(stem, "remote checklist and backup undecodable, skipping"),
            }
        }
        Ok(checklists)
    }

    /// Reads `paths` in order and returns the first payload that decodes.
    ///
    /// Decode failures are contained; connectivity and credential errors
    /// abort.
    async fn read_first_decodable<T: DeserializeOwned + Send>(
        &self,
        paths: &[String],
    ) -> SyncResult<Option<T>> {
        for path in paths {
            match self.remote.read_file(path).await {
                Ok(blob) => match self.codec.decode_json::<T>(&blob).await {
                    Ok(value) => return Ok(Some(value)),
                    Err(e) => warn!(path = %path, error = %e, "remote payload undecodable"),
                },
                Err(e) if e.is_unauthorized() || e.is_connectivity() => return Err(e),
                Err(e) => debug!(path = %path, error = %e, "remote payload unavailable"),
            }
        }
        Ok(None)
    }

    async fn push_records(
        &self,
        layout: &RemoteLayout,
        records: &[DriverRecord],
    ) -> SyncResult<PushReport> {
        let mut report = PushReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        self.remote.ensure_folder(&layout.data_dir()).await?;

        for record in records {
            match self.upload_record(layout, record).await {
                Ok(()) => report.pushed.push(record.id),
                Err(e) if e.is_unauthorized() => return Err(e),
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "record upload failed");
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Writes a record's primary and backup files. The data folder must exist.
    async fn upload_record(&self, layout: &RemoteLayout, record: &DriverRecord) -> SyncResult<()> {
        let blob = self.codec.encode_json(record)?;
        match self.remote.create_folder(&layout.record_dir(record.id)).await {
            Ok(()) | Err(SyncError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.remote
            .write_file(&layout.record_file(record.id), &blob, true)
            .await?;
        self.remote
            .write_file(&layout.record_backup(record.id), &blob, true)
            .await?;
        debug!(record_id = %record.id, bytes = blob.len(), "record uploaded");
        Ok(())
    }
}

fn checklist_stem(name: &str) -> Option<&str> {
    name.strip_suffix("_backup.json")
        .or_else(|| name.strip_suffix(".json"))
        .filter(|stem| !stem.is_empty())
}

#[async_trait]
impl<R: RemoteStore + 'static> OperationDispatcher for SyncEngine<R> {
    async fn dispatch(&self, operation: &PendingOperation) -> SyncResult<()> {
        match operation.kind {
            OperationKind::RecordUpsert => {
                let queued = DriverRecord::from_json(&operation.payload)?;
                // The replica may hold a newer version than the one queued.
                let record = self.replica.record(queued.id).unwrap_or(queued);
                self.push_record(&record).await
            }
            OperationKind::RecordDelete => {
                let id = Uuid::from_slice(&operation.payload).map_err(|e| {
                    SyncError::Protocol(format!("queued delete has no record id: {e}"))
                })?;
                self.delete_remote_record(id).await
            }
            OperationKind::ChecklistUpsert => {
                let checklist: Checklist = serde_json::from_slice(&operation.payload)?;
                self.push_checklist(&checklist).await
            }
        }
    }
}

impl<R: RemoteStore> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
