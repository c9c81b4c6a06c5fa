//! Local replica: the record and checklist collections the UI works on.
//!
//! Writes go through [`LocalReplica::apply`] with a [`Mutation`] command;
//! every applied mutation is persisted and then announced to the
//! subscribed [`ReplicaObserver`]s. The sync engine writes through the same
//! replica with [`ChangeOrigin::Sync`], which observers such as auto-sync
//! use to ignore their own echoes.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use fleetcheck_model::{merge, Checklist, DriverRecord};
use fleetcheck_storage::KeyValueStore;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Store key of the record collection.
pub const RECORDS_KEY: &str = "records";
/// Store key of the checklist collection.
pub const CHECKLISTS_KEY: &str = "checklists";
/// Store key of the last successful sync time.
pub const LAST_SYNCED_KEY: &str = "last_synced";

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user edit.
    Local,
    /// The sync engine applying remote data.
    Sync,
}

/// A write to the replica.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert or replace a record (matched by id).
    UpsertRecord(DriverRecord),
    /// Remove a record.
    DeleteRecord(Uuid),
    /// Insert or replace a checklist (matched by title).
    UpsertChecklist(Checklist),
}

/// Notification sent after a mutation was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaChange {
    /// A record was inserted or replaced.
    RecordUpserted {
        /// Record id.
        id: Uuid,
        /// Who made the change.
        origin: ChangeOrigin,
    },
    /// A record was removed.
    RecordDeleted {
        /// Record id.
        id: Uuid,
        /// Who made the change.
        origin: ChangeOrigin,
    },
    /// A checklist was inserted or replaced.
    ChecklistUpserted {
        /// Checklist title.
        title: String,
        /// Who made the change.
        origin: ChangeOrigin,
    },
    /// A sync pass rewrote several records.
    RecordsUpdated {
        /// Ids of the merged or appended records.
        ids: Vec<Uuid>,
    },
}

impl ReplicaChange {
    /// Who caused the change.
    pub fn origin(&self) -> ChangeOrigin {
        match self {
            ReplicaChange::RecordUpserted { origin, .. }
            | ReplicaChange::RecordDeleted { origin, .. }
            | ReplicaChange::ChecklistUpserted { origin, .. } => *origin,
            ReplicaChange::RecordsUpdated { .. } => ChangeOrigin::Sync,
        }
    }
}

/// Subscriber to replica changes.
///
/// Called synchronously after the change is persisted; implementations
/// should hand work off rather than block.
pub trait ReplicaObserver: Send + Sync {
    /// Handles one change.
    fn on_change(&self, change: &ReplicaChange);
}

#[derive(Debug, Default)]
struct ReplicaState {
    records: Vec<DriverRecord>,
    checklists: Vec<Checklist>,
    last_synced: Option<DateTime<Utc>>,
}

/// The local record set, its checklists and the last sync time.
pub struct LocalReplica {
    store: Arc<dyn KeyValueStore>,
    state: RwLock<ReplicaState>,
    observers: RwLock<Vec<Arc<dyn ReplicaObserver>>>,
}

impl LocalReplica {
    /// Loads the replica from `store`.
    ///
    /// A corrupted record collection is migrated entry by entry; entries
    /// that cannot be salvaged are dropped. Corrupted checklists or sync
    /// time are reset. Only storage I/O errors fail.
    pub fn open(store: Arc<dyn KeyValueStore>) -> SyncResult<Self> {
        let records = match store.load(RECORDS_KEY)? {
            Some(bytes) => match serde_json::from_slice::<Vec<DriverRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "local records unreadable, migrating");
                    let migrated = migrate_records(&bytes);
                    store.save(RECORDS_KEY, &serde_json::to_vec(&migrated)?)?;
                    migrated
                }
            },
            None => Vec::new(),
        };

        let checklists = match store.load(CHECKLISTS_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "local checklists unreadable, resetting");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let last_synced = store
            .load(LAST_SYNCED_KEY)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

        debug!(
            records = records.len(),
            checklists = checklists.len(),
            "local replica loaded"
        );

        Ok(Self {
            store,
            state: RwLock::new(ReplicaState {
                records,
                checklists,
                last_synced,
            }),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Registers an observer.
    pub fn subscribe(&self, observer: Arc<dyn ReplicaObserver>) {
        self.observers.write().push(observer);
    }

    /// All records.
    pub fn records(&self) -> Vec<DriverRecord> {
        self.state.read().records.clone()
    }

    /// One record.
    pub fn record(&self, id: Uuid) -> Option<DriverRecord> {
        self.state.read().records.iter().find(|r| r.id == id).cloned()
    }

    /// All checklists.
    pub fn checklists(&self) -> Vec<Checklist> {
        self.state.read().checklists.clone()
    }

    /// One checklist by title.
    pub fn checklist(&self, title: &str) -> Option<Checklist> {
        self.state
            .read()
            .checklists
            .iter()
            .find(|c| c.title == title)
            .cloned()
    }

    /// Time of the last successful sync pass.
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_synced
    }

    /// Applies a user edit.
    pub fn apply(&self, mutation: Mutation) -> SyncResult<()> {
        self.apply_from(mutation, ChangeOrigin::Local)
    }

    /// Applies a mutation on behalf of `origin`.
    ///
    /// The new collection is persisted before it replaces the in-memory
    /// one; on a storage error nothing changes and no observer is called.
    pub(crate) fn apply_from(&self, mutation: Mutation, origin: ChangeOrigin) -> SyncResult<()> {
        let change = {
            let mut state = self.state.write();
            match mutation {
                Mutation::UpsertRecord(record) => {
                    let id = record.id;
                    let mut records = state.records.clone();
                    upsert_by(&mut records, record, |r| r.id == id);
                    self.persist_records(&records)?;
                    state.records = records;
                    ReplicaChange::RecordUpserted { id, origin }
                }
                Mutation::DeleteRecord(id) => {
                    let mut records = state.records.clone();
                    records.retain(|r| r.id != id);
                    self.persist_records(&records)?;
                    state.records = records;
                    ReplicaChange::RecordDeleted { id, origin }
                }
                Mutation::UpsertChecklist(checklist) => {
                    let title = checklist.title.clone();
                    let mut checklists = state.checklists.clone();
                    upsert_by(&mut checklists, checklist, |c| c.title == title);
                    self.store
                        .save(CHECKLISTS_KEY, &serde_json::to_vec(&checklists)?)?;
                    state.checklists = checklists;
                    ReplicaChange::ChecklistUpserted { title, origin }
                }
            }
        };
        self.notify(&change);
        Ok(())
    }

    /// Applies the records produced by a sync pass started from `snapshot`.
    ///
    /// A record unchanged since the snapshot is replaced; a record edited
    /// during the pass is merged with the pass result; a record deleted
    /// during the pass stays deleted. Returns the ids actually written.
    /// On a storage error the replica is left as it was.
    pub(crate) fn apply_pass(
        &self,
        snapshot: &[DriverRecord],
        updates: Vec<DriverRecord>,
    ) -> SyncResult<Vec<Uuid>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let before: HashMap<Uuid, &DriverRecord> = snapshot.iter().map(|r| (r.id, r)).collect();

        let ids = {
            let mut state = self.state.write();
            let mut records = state.records.clone();
            let mut ids = Vec::new();
            for update in updates {
                let id = update.id;
                let current = records.iter_mut().find(|r| r.id == id);
                match (current, before.get(&id)) {
                    (Some(current), Some(seen)) if current == *seen => *current = update,
                    (Some(current), _) => {
                        debug!(record_id = %id, "record edited during sync, merging again");
                        *current = merge(current, &update);
                    }
                    (None, Some(_)) => {
                        debug!(record_id = %id, "record deleted during sync, skipping");
                        continue;
                    }
                    (None, None) => records.push(update),
                }
                ids.push(id);
            }
            if !ids.is_empty() {
                self.persist_records(&records)?;
                state.records = records;
            }
            ids
        };

        if !ids.is_empty() {
            self.notify(&ReplicaChange::RecordsUpdated { ids: ids.clone() });
        }
        Ok(ids)
    }

    /// Stores the time of a successful sync.
    pub(crate) fn mark_synced(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.store.save(LAST_SYNCED_KEY, &serde_json::to_vec(&at)?)?;
        self.state.write().last_synced = Some(at);
        Ok(())
    }

    fn persist_records(&self, records: &[DriverRecord]) -> SyncResult<()> {
        self.store.save(RECORDS_KEY, &serde_json::to_vec(records)?)?;
        Ok(())
    }

    fn notify(&self, change: &ReplicaChange) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_change(change);
        }
    }
}

impl std::fmt::Debug for LocalReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("LocalReplica")
            .field("records", &state.records.len())
            .field("checklists", &state.checklists.len())
            .field("last_synced", &state.last_synced)
            .finish_non_exhaustive()
    }
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, matches: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| matches(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

/// Salvages records from a collection written by an older app version.
///
/// Missing `id` gets a fresh one, missing `name` an empty one; the other
/// fields already default. Entries that still fail to parse are dropped.
fn migrate_records(bytes: &[u8]) -> Vec<DriverRecord> {
    let Ok(Value::Array(entries)) = serde_json::from_slice::<Value>(bytes) else {
        warn!("local records are not a JSON array, resetting");
        return Vec::new();
    };

    let total = entries.len();
    let records: Vec<DriverRecord> = entries
        .into_iter()
        .filter_map(|entry| {
            let Value::Object(mut fields) = entry else {
                return None;
            };
            fields
                .entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            fields
                .entry("name")
                .or_insert_with(|| Value::String(String::new()));
            serde_json::from_value(Value::Object(fields)).ok()
        })
        .collect();

    if records.len() < total {
        warn!(
            dropped = total - records.len(),
            kept = records.len(),
            "dropped unrecoverable local records"
        );
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_model::{ChecklistKind, ValidationState};
    use fleetcheck_storage::{InMemoryStore, StorageError, StorageResult};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory store whose writes fail while `full` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryStore,
        full: AtomicBool,
    }

    impl KeyValueStore for FlakyStore {
        fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &[u8]) -> StorageResult<()> {
            if self.full.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                )));
            }
            self.inner.save(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ReplicaChange>>);

    impl ReplicaObserver for Recorder {
        fn on_change(&self, change: &ReplicaChange) {
            self.0.lock().push(change.clone());
        }
    }

    fn replica() -> (LocalReplica, Arc<InMemoryStore>, Arc<Recorder>) {
        let store = Arc::new(InMemoryStore::new());
        let replica = LocalReplica::open(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        replica.subscribe(recorder.clone());
        (replica, store, recorder)
    }

    #[test]
    fn apply_persists_and_notifies() {
        let (replica, store, recorder) = replica();
        let record = DriverRecord::new("Ada");
        let id = record.id;

        replica.apply(Mutation::UpsertRecord(record.clone())).unwrap();
        assert_eq!(replica.record(id), Some(record));
        assert!(store.load(RECORDS_KEY).unwrap().is_some());

        replica.apply(Mutation::DeleteRecord(id)).unwrap();
        assert!(replica.records().is_empty());

        assert_eq!(
            *recorder.0.lock(),
            vec![
                ReplicaChange::RecordUpserted { id, origin: ChangeOrigin::Local },
                ReplicaChange::RecordDeleted { id, origin: ChangeOrigin::Local },
            ]
        );
    }

    #[test]
    fn reopen_restores_state() {
        let (replica, store, _) = replica();
        replica.apply(Mutation::UpsertRecord(DriverRecord::new("Ada"))).unwrap();
        replica
            .apply(Mutation::UpsertChecklist(Checklist::new("Semestriel", ChecklistKind::Periodic)))
            .unwrap();
        let at = Utc::now();
        replica.mark_synced(at).unwrap();

        let reopened = LocalReplica::open(store).unwrap();
        assert_eq!(reopened.records(), replica.records());
        assert!(reopened.checklist("Semestriel").is_some());
        assert_eq!(reopened.last_synced(), Some(at));
    }

    #[test]
    fn checklists_upsert_by_title() {
        let (replica, _, recorder) = replica();
        let mut checklist = Checklist::new("Semestriel", ChecklistKind::Periodic);
        replica.apply(Mutation::UpsertChecklist(checklist.clone())).unwrap();
        checklist.kind = ChecklistKind::Specialized;
        replica.apply(Mutation::UpsertChecklist(checklist)).unwrap();

        assert_eq!(replica.checklists().len(), 1);
        assert_eq!(
            replica.checklist("Semestriel").unwrap().kind,
            ChecklistKind::Specialized
        );
        assert_eq!(recorder.0.lock().len(), 2);
    }

    #[test]
    fn apply_pass_merges_concurrent_edits() {
        let (replica, _, recorder) = replica();
        let at = Utc::now();
        let mut untouched = DriverRecord::new("Untouched");
        let mut edited = DriverRecord::new("Edited");
        let deleted = DriverRecord::new("Deleted");
        for record in [&untouched, &edited, &deleted] {
            replica.apply(Mutation::UpsertRecord(record.clone())).unwrap();
        }
        let snapshot = replica.records();

        // Edits made while the pass was running.
        edited.evaluate("Conduite", "q1", ValidationState::Validated, at);
        replica.apply(Mutation::UpsertRecord(edited.clone())).unwrap();
        replica.apply(Mutation::DeleteRecord(deleted.id)).unwrap();
        recorder.0.lock().clear();

        untouched.evaluate("Conduite", "q1", ValidationState::Partial, at);
        let mut edited_remote = edited.clone();
        edited_remote.checklist_states.clear();
        edited_remote.set_note("Conduite", "q2", "from remote");
        let appended = DriverRecord::new("Appended");

        let ids = replica
            .apply_pass(
                &snapshot,
                vec![untouched.clone(), edited_remote, deleted.clone(), appended.clone()],
            )
            .unwrap();

        assert_eq!(ids, vec![untouched.id, edited.id, appended.id]);
        assert_eq!(replica.record(untouched.id), Some(untouched));
        let merged = replica.record(edited.id).unwrap();
        assert_eq!(merged.state("Conduite", "q1"), ValidationState::Validated);
        assert_eq!(merged.note("Conduite", "q2"), "from remote");
        assert!(replica.record(deleted.id).is_none());
        assert_eq!(replica.record(appended.id), Some(appended));
        assert_eq!(*recorder.0.lock(), vec![ReplicaChange::RecordsUpdated { ids }]);
    }

    #[test]
    fn failed_writes_leave_the_replica_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let replica = LocalReplica::open(store.clone()).unwrap();
        let recorder = Arc::new(Recorder::default());
        replica.subscribe(recorder.clone());
        let kept = DriverRecord::new("Kept");
        replica.apply(Mutation::UpsertRecord(kept.clone())).unwrap();
        let snapshot = replica.records();
        recorder.0.lock().clear();

        store.full.store(true, Ordering::SeqCst);
        let lost = DriverRecord::new("Lost");
        assert!(replica.apply(Mutation::UpsertRecord(lost.clone())).is_err());
        assert!(replica.apply(Mutation::DeleteRecord(kept.id)).is_err());
        assert!(replica
            .apply(Mutation::UpsertChecklist(Checklist::new("Semestriel", ChecklistKind::Periodic)))
            .is_err());
        assert!(replica.apply_pass(&snapshot, vec![lost.clone()]).is_err());

        assert_eq!(replica.records(), vec![kept.clone()]);
        assert!(replica.checklists().is_empty());
        assert!(recorder.0.lock().is_empty());

        // Memory still matches disk.
        store.full.store(false, Ordering::SeqCst);
        let reopened = LocalReplica::open(store).unwrap();
        assert_eq!(reopened.records(), vec![kept]);
    }

    #[test]
    fn corrupted_records_are_migrated() {
        let id = Uuid::new_v4();
        let legacy = format!(
            r#"[{{"id":"{id}","name":"Ada","checklistStates":{{"C":{{"q":7}}}}}},
                {{"name":"No id"}},
                {{"id":"{id}","checklistStates":{{}}}},
                42]"#
        );
        let store = Arc::new(InMemoryStore::with_entries([(RECORDS_KEY, legacy.into_bytes())]));

        let replica = LocalReplica::open(store.clone()).unwrap();
        let records = replica.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "No id");
        assert_eq!(records[1].id, id);
        assert_eq!(records[1].name, "");

        let persisted: Vec<DriverRecord> =
            serde_json::from_slice(&store.load(RECORDS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted, records);
    }

    #[test]
    fn garbage_records_reset() {
        let store = Arc::new(InMemoryStore::with_entries([
            (RECORDS_KEY, b"\x00\x01garbage".to_vec()),
            (CHECKLISTS_KEY, b"{".to_vec()),
        ]));
        let replica = LocalReplica::open(store).unwrap();
        assert!(replica.records().is_empty());
        assert!(replica.checklists().is_empty());
    }
}
