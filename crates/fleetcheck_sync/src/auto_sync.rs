//! Debounced push of local edits.
//!
//! [`AutoSync`] subscribes to the [`LocalReplica`] and collects user edits
//! until the replica has been quiet for the debounce interval, then pushes
//! the batch. Whatever cannot be pushed is handed to the [`OfflineQueue`].
//! Changes applied by the sync engine itself are ignored.

use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::queue::OfflineQueue;
use crate::remote::RemoteStore;
use crate::replica::{ChangeOrigin, LocalReplica, ReplicaChange, ReplicaObserver};
use fleetcheck_model::{OperationKind, PendingOperation};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Forwards user edits to the auto-sync task.
struct ChangeForwarder {
    tx: mpsc::UnboundedSender<ReplicaChange>,
}

impl ReplicaObserver for ChangeForwarder {
    fn on_change(&self, change: &ReplicaChange) {
        if change.origin() == ChangeOrigin::Local {
            // The task is gone after shutdown.
            let _ = self.tx.send(change.clone());
        }
    }
}

/// Edits collected since the last flush.
#[derive(Debug, Default)]
struct PendingBatch {
    upserts: BTreeSet<Uuid>,
    deletes: BTreeSet<Uuid>,
    checklists: BTreeSet<String>,
}

impl PendingBatch {
    fn add(&mut self, change: &ReplicaChange) {
        match change {
            ReplicaChange::RecordUpserted { id, .. } => {
                self.deletes.remove(id);
                self.upserts.insert(*id);
            }
            ReplicaChange::RecordDeleted { id, .. } => {
                self.upserts.remove(id);
                self.deletes.insert(*id);
            }
            ReplicaChange::ChecklistUpserted { title, .. } => {
                self.checklists.insert(title.clone());
            }
            ReplicaChange::RecordsUpdated { .. } => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.checklists.is_empty()
    }
}

/// Handle to the background auto-sync task. Dropping it stops the task.
pub struct AutoSync {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AutoSync {
    /// Subscribes to `replica` and starts the debounce task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<R: RemoteStore + 'static>(
        engine: Arc<SyncEngine<R>>,
        replica: Arc<LocalReplica>,
        queue: Arc<OfflineQueue>,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        replica.subscribe(Arc::new(ChangeForwarder { tx }));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            engine,
            replica,
            queue,
            debounce,
        };
        let task = tokio::spawn(worker.run(rx, shutdown_rx));
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Stops the task after pushing or queueing the edits it holds.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "auto-sync task ended abnormally");
            }
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AutoSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSync")
            .field("running", &self.task.is_some())
            .finish()
    }
}

struct Worker<R: RemoteStore> {
    engine: Arc<SyncEngine<R>>,
    replica: Arc<LocalReplica>,
    queue: Arc<OfflineQueue>,
    debounce: Duration,
}

impl<R: RemoteStore + 'static> Worker<R> {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ReplicaChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batch = PendingBatch::default();
        let mut stopping = false;

        while !stopping {
            if batch.is_empty() {
                tokio::select! {
                    biased;
                    change = rx.recv() => match change {
                        Some(change) => batch.add(&change),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }

            // Wait until the replica has been quiet for a full interval.
            loop {
                tokio::select! {
                    biased;
                    change = tokio::time::timeout(self.debounce, rx.recv()) => match change {
                        Ok(Some(change)) => batch.add(&change),
                        Ok(None) => {
                            stopping = true;
                            break;
                        }
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => {
                        stopping = true;
                        break;
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }

            batch = self.flush(std::mem::take(&mut batch)).await;
            if !batch.is_empty() && stopping {
                self.enqueue_all(std::mem::take(&mut batch));
            }
        }
        debug!("auto-sync stopped");
    }

    /// Pushes a batch. Returns the part that must be retried because a
    /// sync pass was running; everything else is pushed or queued.
    async fn flush(&self, batch: PendingBatch) -> PendingBatch {
        if !self.queue.connectivity().is_online() {
            debug!("offline, queueing local edits");
            self.enqueue_all(batch);
            return PendingBatch::default();
        }

        let mut retry = PendingBatch::default();
        let mut queued_any = false;

        let records: Vec<_> = batch
            .upserts
            .iter()
            .filter_map(|id| self.replica.record(*id))
            .collect();
        if !records.is_empty() {
            match self.engine.push_only(&records).await {
                Ok(report) => {
                    info!(
                        pushed = report.pushed.len(),
                        failed = report.failed.len(),
                        "local edits pushed"
                    );
                    for (id, _) in &report.failed {
                        queued_any |= self.enqueue_record(*id);
                    }
                }
                Err(SyncError::AlreadyInProgress) => retry.upserts = batch.upserts,
                Err(e) => {
                    warn!(error = %e, records = records.len(), "push failed, queueing");
                    for record in &records {
                        queued_any |= self.enqueue_record(record.id);
                    }
                }
            }
        }

        for id in batch.deletes {
            match self.engine.delete_remote_record(id).await {
                Ok(()) => {}
                Err(SyncError::AlreadyInProgress) => {
                    retry.deletes.insert(id);
                }
                Err(e) => {
                    warn!(record_id = %id, error = %e, "remote delete failed, queueing");
                    queued_any |= self.enqueue_delete(id);
                }
            }
        }

        for title in batch.checklists {
            let Some(checklist) = self.replica.checklist(&title) else {
                continue;
            };
            match self.engine.push_checklist(&checklist).await {
                Ok(()) => {}
                Err(SyncError::AlreadyInProgress) => {
                    retry.checklists.insert(title);
                }
                Err(e) => {
                    warn!(title = %title, error = %e, "checklist push failed, queueing");
                    queued_any |= self.enqueue_checklist(&title);
                }
            }
        }

        // Anything queued earlier can go out now that the remote answered.
        if !queued_any && retry.is_empty() && !self.queue.is_empty() {
            self.queue.drain().await;
        }
        retry
    }

    fn enqueue_all(&self, batch: PendingBatch) {
        for id in batch.upserts {
            self.enqueue_record(id);
        }
        for id in batch.deletes {
            self.enqueue_delete(id);
        }
        for title in batch.checklists {
            self.enqueue_checklist(&title);
        }
    }

    fn enqueue_record(&self, id: Uuid) -> bool {
        let Some(record) = self.replica.record(id) else {
            return false;
        };
        let queued = record.to_json().map_err(SyncError::from).and_then(|payload| {
            self.queue.enqueue(
                OperationKind::RecordUpsert,
                payload,
                PendingOperation::named(record.name.clone()),
            )
        });
        report_enqueue(queued, OperationKind::RecordUpsert)
    }

    fn enqueue_delete(&self, id: Uuid) -> bool {
        let queued = self.queue.enqueue(
            OperationKind::RecordDelete,
            id.as_bytes().to_vec(),
            BTreeMap::new(),
        );
        report_enqueue(queued, OperationKind::RecordDelete)
    }

    fn enqueue_checklist(&self, title: &str) -> bool {
        let Some(checklist) = self.replica.checklist(title) else {
            return false;
        };
        let queued = serde_json::to_vec(&checklist)
            .map_err(SyncError::from)
            .and_then(|payload| {
                self.queue.enqueue(
                    OperationKind::ChecklistUpsert,
                    payload,
                    PendingOperation::named(title),
                )
            });
        report_enqueue(queued, OperationKind::ChecklistUpsert)
    }
}

fn report_enqueue(result: SyncResult<Uuid>, kind: OperationKind) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            error!(kind = kind.as_str(), error = %e, "failed to queue operation, edit will not be pushed");
            false
        }
    }
}
