//! Durable offline queue.
//!
//! Mutations that could not reach the remote store are kept here, in
//! enqueue order, and replayed through an [`OperationDispatcher`] when
//! connectivity returns. The queue is persisted after every change so
//! pending work survives restarts.

use crate::config::QueueConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fleetcheck_model::{OperationKind, PendingOperation};
use fleetcheck_storage::KeyValueStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Store key of the persisted queue.
pub const QUEUE_KEY: &str = "offline_queue";

/// Replays one queued operation against the remote store.
#[async_trait]
pub trait OperationDispatcher: Send + Sync {
    /// Performs the operation.
    async fn dispatch(&self, operation: &PendingOperation) -> SyncResult<()>;
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items dispatched.
    pub attempted: usize,
    /// Items that succeeded and left the queue.
    pub succeeded: usize,
    /// Items that failed and stay queued.
    pub failed: usize,
    /// Items that failed for the last time and were dropped.
    pub dropped: usize,
    /// Items skipped because a sync pass was running; no retry consumed.
    pub deferred: usize,
}

/// FIFO of pending operations with bounded retries.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    dispatcher: Arc<dyn OperationDispatcher>,
    connectivity: Connectivity,
    config: QueueConfig,
    items: Mutex<Vec<PendingOperation>>,
    draining: tokio::sync::Mutex<()>,
    /// Set by a drain that found another one running.
    rerun: AtomicBool,
}

impl OfflineQueue {
    /// Opens the queue, restoring persisted items. An unreadable queue is
    /// reset.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        dispatcher: Arc<dyn OperationDispatcher>,
        connectivity: Connectivity,
        config: QueueConfig,
    ) -> SyncResult<Arc<Self>> {
        let items = match store.load(QUEUE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "offline queue unreadable, resetting");
                Vec::new()
            }),
            None => Vec::new(),
        };

        Ok(Arc::new(Self {
            store,
            dispatcher,
            connectivity,
            config,
            items: Mutex::new(items),
            draining: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
        }))
    }

    /// Queues an operation. While online, a drain starts in the background.
    pub fn enqueue(
        self: &Arc<Self>,
        kind: OperationKind,
        payload: Vec<u8>,
        metadata: BTreeMap<String, String>,
    ) -> SyncResult<Uuid> {
        let operation = PendingOperation::new(kind, payload, metadata);
        let id = operation.id;
        info!(
            op_id = %id,
            kind = kind.as_str(),
            name = %operation.display_name(),
            "operation queued for later"
        );
        {
            let mut items = self.items.lock();
            items.push(operation);
            self.persist(&items)?;
        }

        if self.config.drain_on_enqueue && self.connectivity.is_online() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let queue = Arc::clone(self);
                handle.spawn(async move {
                    queue.drain().await;
                });
            }
        }
        Ok(id)
    }

    /// Replays every pending item once, in enqueue order.
    ///
    /// Items queued while the drain runs are included. Does nothing while
    /// offline; stops early if connectivity drops. If another drain is
    /// running, returns at once and the running drain scans again for
    /// items it has not seen.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let mut seen = HashSet::new();
        loop {
            {
                let Ok(_guard) = self.draining.try_lock() else {
                    debug!("drain already running");
                    self.rerun.store(true, Ordering::SeqCst);
                    break;
                };
                self.rerun.store(false, Ordering::SeqCst);
                self.drain_unseen(&mut seen, &mut report).await;
            }
            // An item queued after the last scan may have been left to us.
            if !self.rerun.swap(false, Ordering::SeqCst) || !self.connectivity.is_online() {
                break;
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                dropped = report.dropped,
                "offline queue drained"
            );
        }
        report
    }

    async fn drain_unseen(&self, seen: &mut HashSet<Uuid>, report: &mut DrainReport) {
        loop {
            if !self.connectivity.is_online() {
                debug!("offline, stopping drain");
                break;
            }
            let next = self
                .items
                .lock()
                .iter()
                .find(|item| !seen.contains(&item.id))
                .cloned();
            let Some(operation) = next else {
                break;
            };
            seen.insert(operation.id);

            if report.attempted > 0 && !self.config.inter_item_delay.is_zero() {
                tokio::time::sleep(self.config.inter_item_delay).await;
            }
            report.attempted += 1;

            let outcome = self.dispatcher.dispatch(&operation).await;
            if let Err(e) = self.settle(&operation, outcome, report) {
                error!(error = %e, "failed to persist offline queue");
            }
        }
    }

    fn settle(
        &self,
        operation: &PendingOperation,
        outcome: SyncResult<()>,
        report: &mut DrainReport,
    ) -> SyncResult<()> {
        let mut items = self.items.lock();
        let Some(index) = items.iter().position(|item| item.id == operation.id) else {
            // Removed or cleared while dispatching.
            return Ok(());
        };

        match outcome {
            Ok(()) => {
                debug!(op_id = %operation.id, "queued operation replayed");
                items.remove(index);
                report.succeeded += 1;
            }
            Err(SyncError::AlreadyInProgress) => {
                report.deferred += 1;
                return Ok(());
            }
            Err(e) => {
                let item = &mut items[index];
                item.retry_count += 1;
                if item.retry_count >= self.config.max_retries {
                    error!(
                        op_id = %item.id,
                        kind = item.kind.as_str(),
                        name = %item.display_name(),
                        retries = item.retry_count,
                        error = %e,
                        "dropping queued operation after too many failures"
                    );
                    items.remove(index);
                    report.dropped += 1;
                } else {
                    warn!(
                        op_id = %item.id,
                        retries = item.retry_count,
                        error = %e,
                        "queued operation failed, keeping it"
                    );
                    report.failed += 1;
                }
            }
        }
        self.persist(&items)
    }

    /// Drains every time connectivity goes from offline to online, and once
    /// at start if already online with items pending.
    pub fn watch_connectivity(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        let mut was_online = *rx.borrow_and_update();
        tokio::spawn(async move {
            if was_online && !queue.is_empty() {
                debug!(pending = queue.len(), "online at start, draining offline queue");
                queue.drain().await;
            }
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                if online && !was_online {
                    info!("connectivity restored, draining offline queue");
                    queue.drain().await;
                }
                was_online = online;
            }
        })
    }

    /// The connectivity signal gating drains.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Removes every item.
    pub fn clear(&self) -> SyncResult<()> {
        let mut items = self.items.lock();
        items.clear();
        self.persist(&items)
    }

    /// Removes one item. Returns false if it was not queued.
    pub fn remove(&self, id: Uuid) -> SyncResult<bool> {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| item.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.persist(&items)?;
        Ok(true)
    }

    /// Snapshot of the pending items, in order.
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.items.lock().clone()
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    fn persist(&self, items: &[PendingOperation]) -> SyncResult<()> {
        self.store.save(QUEUE_KEY, &serde_json::to_vec(items)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("pending", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_storage::InMemoryStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records dispatched operations; fails while `failing` is set and
    /// waits for `gate` while `gated` is set.
    #[derive(Default)]
    struct ScriptedDispatcher {
        failing: AtomicBool,
        busy: AtomicBool,
        gated: AtomicBool,
        gate: Notify,
        calls: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl OperationDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, operation: &PendingOperation) -> SyncResult<()> {
            self.calls.lock().push(operation.id);
            if self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if self.busy.load(Ordering::SeqCst) {
                return Err(SyncError::AlreadyInProgress);
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::NotConnected);
            }
            Ok(())
        }
    }

    fn queue(
        store: Arc<InMemoryStore>,
        dispatcher: Arc<ScriptedDispatcher>,
        connectivity: Connectivity,
    ) -> Arc<OfflineQueue> {
        OfflineQueue::open(
            store,
            dispatcher,
            connectivity,
            QueueConfig::default()
                .with_inter_item_delay(Duration::ZERO)
                .with_drain_on_enqueue(false),
        )
        .unwrap()
    }

    fn enqueue(queue: &Arc<OfflineQueue>, name: &str) -> Uuid {
        queue
            .enqueue(
                OperationKind::RecordUpsert,
                b"{}".to_vec(),
                PendingOperation::named(name),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn drains_in_enqueue_order() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let queue = queue(Arc::default(), dispatcher.clone(), Connectivity::new(true));
        let ids: Vec<Uuid> = ["a", "b", "c"].iter().map(|n| enqueue(&queue, n)).collect();

        let report = queue.drain().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 3);
        assert!(queue.is_empty());
        assert_eq!(*dispatcher.calls.lock(), ids);
    }

    #[tokio::test]
    async fn item_dropped_after_three_failed_drains() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        dispatcher.failing.store(true, Ordering::SeqCst);
        let queue = queue(Arc::default(), dispatcher.clone(), Connectivity::new(true));
        enqueue(&queue, "doomed");

        for attempt in 1..=2 {
            let report = queue.drain().await;
            assert_eq!(report.failed, 1);
            assert_eq!(queue.pending()[0].retry_count, attempt);
        }
        let third = queue.drain().await;
        assert_eq!(third.dropped, 1);
        assert!(queue.is_empty());

        let fourth = queue.drain().await;
        assert_eq!(fourth.attempted, 0);
        assert_eq!(dispatcher.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn in_progress_does_not_consume_retries() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        dispatcher.busy.store(true, Ordering::SeqCst);
        let queue = queue(Arc::default(), dispatcher.clone(), Connectivity::new(true));
        enqueue(&queue, "waiting");

        for _ in 0..5 {
            assert_eq!(queue.drain().await.deferred, 1);
        }
        assert_eq!(queue.pending()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn offline_drain_is_a_no_op() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let queue = queue(Arc::default(), dispatcher.clone(), Connectivity::new(false));
        enqueue(&queue, "later");

        assert_eq!(queue.drain().await, DrainReport::default());
        assert_eq!(queue.len(), 1);
        assert!(dispatcher.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn survives_restart() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let first = queue(store.clone(), dispatcher.clone(), Connectivity::new(false));
        let kept = enqueue(&first, "kept");
        let removed = enqueue(&first, "removed");
        assert!(first.remove(removed).unwrap());
        assert!(!first.remove(removed).unwrap());

        let reopened = queue(store, dispatcher, Connectivity::new(false));
        let pending = reopened.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, kept);
        assert_eq!(pending[0].display_name(), "kept");

        reopened.clear().unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn reconnect_triggers_drain() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let connectivity = Connectivity::new(false);
        let queue = queue(Arc::default(), dispatcher.clone(), connectivity.clone());
        let watcher = queue.watch_connectivity();
        enqueue(&queue, "pending");

        connectivity.set_online(true);
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        watcher.abort();
    }

    #[tokio::test]
    async fn reopened_online_queue_drains_when_watched() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let offline = queue(store.clone(), dispatcher.clone(), Connectivity::new(false));
        enqueue(&offline, "persisted");

        let reopened = queue(store, dispatcher.clone(), Connectivity::new(true));
        let watcher = reopened.watch_connectivity();
        wait_until_empty(&reopened).await;
        assert_eq!(dispatcher.calls.lock().len(), 1);
        watcher.abort();
    }

    #[tokio::test]
    async fn item_queued_behind_a_running_drain_is_replayed() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        dispatcher.gated.store(true, Ordering::SeqCst);
        let queue = OfflineQueue::open(
            Arc::new(InMemoryStore::new()),
            dispatcher.clone(),
            Connectivity::new(true),
            QueueConfig::default().with_inter_item_delay(Duration::ZERO),
        )
        .unwrap();

        enqueue(&queue, "first");
        for _ in 0..100 {
            if !dispatcher.calls.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.calls.lock().len(), 1);

        // The background drain holds the queue; these leave the work to it.
        assert_eq!(queue.drain().await.attempted, 0);
        enqueue(&queue, "second");
        tokio::time::sleep(Duration::from_millis(10)).await;

        dispatcher.gated.store(false, Ordering::SeqCst);
        dispatcher.gate.notify_one();
        wait_until_empty(&queue).await;
        assert_eq!(dispatcher.calls.lock().len(), 2);
        assert!(!queue.rerun.load(Ordering::SeqCst));
    }

    async fn wait_until_empty(queue: &OfflineQueue) {
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn enqueue_while_online_drains() {
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let queue = OfflineQueue::open(
            Arc::new(InMemoryStore::new()),
            dispatcher.clone(),
            Connectivity::new(true),
            QueueConfig::default().with_inter_item_delay(Duration::ZERO),
        )
        .unwrap();
        enqueue(&queue, "immediate");

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        assert_eq!(dispatcher.calls.lock().len(), 1);
    }
}
