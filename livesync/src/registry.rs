//! Subscription registry: one live stream per collection, reference
//! counted across subscribers.
//!
//! The first observer for a collection spawns its worker task; later
//! subscribers attach to the same underlying stream and each gets a
//! distinct handle. When the last handle is returned the worker shuts
//! down and the remote stream is cancelled. `subscribe`/`unsubscribe`
//! only touch registry bookkeeping — they never wait on network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

use crate::dispatch::DeltaObserver;
use crate::document::{CollectionName, Document, DocumentId};
use crate::engine::{AtomicEngineStats, EngineConfig};
use crate::mutation::PendingMutations;
use crate::reconciler::Reconciler;
use crate::store::RemoteStore;
use crate::worker::{CollectionWorker, WorkerCommand};
use crate::SyncError;

/// Externally visible lifecycle of a collection subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created; stream not yet attached.
    Pending,
    /// Stream attached and resynced; live events flowing.
    Active,
    /// Stream lost; the supervisor is retrying with backoff.
    Reconnecting,
    /// Last observer unregistered (or engine shut down); stream cancelled.
    Closed,
}

/// Proof of one observer registration; returned by `subscribe`, consumed
/// by `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    collection: CollectionName,
    observer_id: Uuid,
}

impl SubscriptionHandle {
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }
}

struct CollectionEntry {
    commands: mpsc::Sender<WorkerCommand>,
    status: watch::Receiver<SubscriptionState>,
    observers: usize,
}

/// Tracks the active subscription per collection name.
pub struct SubscriptionRegistry {
    store: Arc<dyn RemoteStore>,
    pending: Arc<PendingMutations>,
    stats: Arc<AtomicEngineStats>,
    config: EngineConfig,
    entries: RwLock<HashMap<CollectionName, CollectionEntry>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        store: Arc<dyn RemoteStore>,
        pending: Arc<PendingMutations>,
        stats: Arc<AtomicEngineStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            pending,
            stats,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer, spawning the collection worker on first use.
    pub async fn subscribe(
        &self,
        collection: &str,
        observer: Arc<dyn DeltaObserver>,
    ) -> Result<SubscriptionHandle, SyncError> {
        let name = CollectionName::new(collection)?;
        let mut entries = self.entries.write().await;

        if !entries.contains_key(&name) {
            entries.insert(name.clone(), self.spawn_worker(name.clone()));
            log::debug!("[{name}] first observer, worker spawned");
        }
        let entry = entries.get_mut(&name).ok_or(SyncError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        entry
            .commands
            .send(WorkerCommand::Register {
                observer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SyncError::Closed)?;
        let observer_id = reply_rx.await.map_err(|_| SyncError::Closed)?;
        entry.observers += 1;

        Ok(SubscriptionHandle {
            collection: name,
            observer_id,
        })
    }

    /// Return a handle; at zero observers the stream is cancelled.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SyncError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&handle.collection)
            .ok_or(SyncError::Closed)?;

        // A dead worker is treated the same as one we shut down.
        let _ = entry
            .commands
            .send(WorkerCommand::Unregister {
                observer_id: handle.observer_id,
            })
            .await;
        entry.observers = entry.observers.saturating_sub(1);

        if entry.observers == 0 {
            let _ = entry.commands.send(WorkerCommand::Shutdown).await;
            entries.remove(&handle.collection);
            log::debug!("[{}] last observer gone, worker shut down", handle.collection);
        }
        Ok(())
    }

    /// Current lifecycle state; collections never subscribed (or already
    /// torn down) report `Closed`.
    pub async fn subscription_state(&self, collection: &str) -> SubscriptionState {
        let Ok(name) = CollectionName::new(collection) else {
            return SubscriptionState::Closed;
        };
        let entries = self.entries.read().await;
        match entries.get(&name) {
            Some(entry) => *entry.status.borrow(),
            None => SubscriptionState::Closed,
        }
    }

    /// Copied view of the collection's snapshot.
    pub async fn snapshot(
        &self,
        collection: &str,
    ) -> Result<HashMap<DocumentId, Document>, SyncError> {
        let name = CollectionName::new(collection)?;
        let commands = {
            let entries = self.entries.read().await;
            entries
                .get(&name)
                .ok_or(SyncError::Closed)?
                .commands
                .clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(WorkerCommand::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| SyncError::Closed)?;
        reply_rx.await.map_err(|_| SyncError::Closed)
    }

    /// Number of collections with a live worker.
    pub async fn active_collections(&self) -> usize {
        self.entries.read().await.len()
    }

    fn spawn_worker(&self, name: CollectionName) -> CollectionEntry {
        let (commands_tx, commands_rx) = mpsc::channel(self.config.command_capacity);
        let (status_tx, status_rx) = watch::channel(SubscriptionState::Pending);

        let worker = CollectionWorker::new(
            self.store.clone(),
            Reconciler::new(name),
            self.pending.clone(),
            status_tx,
            self.stats.clone(),
            self.config.clone(),
        );
        tokio::spawn(worker.run(commands_rx));

        CollectionEntry {
            commands: commands_tx,
            status: status_rx,
            observers: 0,
        }
    }
}
