//! Per-collection worker task.
//!
//! Exactly one task owns a collection's reconciler snapshot and observer
//! list, so sequence assignment and snapshot mutation are single-owner by
//! construction — no lock, no torn reads. Everything reaches the worker
//! over channels: registry commands on one, stream events on the other,
//! multiplexed through `tokio::select!`. Workers for different collections
//! share nothing mutable and run fully in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::dispatch::{DeltaObserver, Dispatcher};
use crate::document::{Document, DocumentId};
use crate::engine::{AtomicEngineStats, EngineConfig};
use crate::mutation::PendingMutations;
use crate::reconciler::Reconciler;
use crate::registry::SubscriptionState;
use crate::store::{RemoteChange, RemoteStore, StreamEvent};
use crate::supervisor::{attach, Backoff};

use std::sync::atomic::Ordering;

/// Registry-to-worker requests.
pub(crate) enum WorkerCommand {
    Register {
        observer: Arc<dyn DeltaObserver>,
        reply: oneshot::Sender<Uuid>,
    },
    Unregister {
        observer_id: Uuid,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<DocumentId, Document>>,
    },
    Shutdown,
}

/// Why the streaming loop ended.
enum Exit {
    Shutdown,
    StreamLost(String),
}

pub(crate) struct CollectionWorker {
    store: Arc<dyn RemoteStore>,
    reconciler: Reconciler,
    dispatcher: Dispatcher,
    pending: Arc<PendingMutations>,
    status: watch::Sender<SubscriptionState>,
    stats: Arc<AtomicEngineStats>,
    config: EngineConfig,
}

impl CollectionWorker {
    pub(crate) fn new(
        store: Arc<dyn RemoteStore>,
        reconciler: Reconciler,
        pending: Arc<PendingMutations>,
        status: watch::Sender<SubscriptionState>,
        stats: Arc<AtomicEngineStats>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            dispatcher: Dispatcher::new(),
            pending,
            status,
            stats,
            config,
        }
    }

    /// Drive the subscription until the last observer unregisters.
    ///
    /// Lifecycle: `Pending` until the first attach + listing completes,
    /// then `Active`; `Reconnecting` after a stream loss until the resync
    /// listing has been applied; `Closed` on shutdown. Attach failures
    /// retry indefinitely with capped, jittered backoff.
    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<WorkerCommand>) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);

        loop {
            // Attach while staying responsive: observers may register (and
            // the registry may shut us down) before the stream is up.
            let store = self.store.clone();
            let collection = self.reconciler.collection().clone();
            let capacity = self.config.stream_capacity;
            let attach_fut = async move { attach(&store, &collection, capacity).await };
            tokio::pin!(attach_fut);
            let result = loop {
                tokio::select! {
                    result = &mut attach_fut => break result,
                    command = commands.recv() => {
                        match command {
                            Some(WorkerCommand::Shutdown) | None => {
                                self.status.send_replace(SubscriptionState::Closed);
                                log::info!(
                                    "[{}] subscription closed before attach",
                                    self.reconciler.collection()
                                );
                                return;
                            }
                            Some(command) => self.handle_command(command),
                        }
                    }
                }
            };

            let attached = match result {
                Ok(attached) => attached,
                Err(err) => {
                    let delay = backoff.next_delay();
                    log::warn!(
                        "[{}] attach failed ({err}), retrying in {delay:?}",
                        self.reconciler.collection()
                    );
                    if !self.idle_wait(delay, &mut commands).await {
                        return;
                    }
                    continue;
                }
            };

            let deltas = self.reconciler.resync(attached.listing);
            self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
            for delta in deltas {
                self.emit(&delta);
            }
            backoff.reset();
            self.status.send_replace(SubscriptionState::Active);
            log::info!(
                "[{}] stream active, {} documents",
                self.reconciler.collection(),
                self.reconciler.snapshot().len()
            );

            let handle = attached.handle;
            let mut events = attached.events;
            let exit = loop {
                tokio::select! {
                    command = commands.recv() => {
                        match command {
                            Some(WorkerCommand::Shutdown) | None => break Exit::Shutdown,
                            Some(command) => self.handle_command(command),
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Some(StreamEvent::Change(change)) => self.handle_change(change),
                            Some(StreamEvent::Disconnected { reason }) => {
                                break Exit::StreamLost(reason);
                            }
                            None => break Exit::StreamLost("stream channel closed".to_string()),
                        }
                    }
                }
            };

            match exit {
                Exit::Shutdown => {
                    handle.cancel();
                    self.status.send_replace(SubscriptionState::Closed);
                    log::info!("[{}] subscription closed", self.reconciler.collection());
                    return;
                }
                Exit::StreamLost(reason) => {
                    // Dropping the handle cancels the remote stream; events
                    // already in flight are discarded with the receiver.
                    drop(handle);
                    drop(events);
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.status.send_replace(SubscriptionState::Reconnecting);
                    log::warn!(
                        "[{}] stream lost ({reason}), reconnecting",
                        self.reconciler.collection()
                    );
                }
            }
        }
    }

    /// Sleep between attach attempts while staying responsive to commands.
    ///
    /// Returns false if the worker was shut down during the wait.
    async fn idle_wait(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::Receiver<WorkerCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => {
                    match command {
                        Some(WorkerCommand::Shutdown) | None => {
                            self.status.send_replace(SubscriptionState::Closed);
                            log::info!(
                                "[{}] subscription closed while disconnected",
                                self.reconciler.collection()
                            );
                            return false;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Register { observer, reply } => {
                let id = self.dispatcher.register(observer);
                let _ = reply.send(id);
            }
            WorkerCommand::Unregister { observer_id } => {
                self.dispatcher.unregister(observer_id);
            }
            WorkerCommand::Snapshot { reply } => {
                let _ = reply.send(self.reconciler.snapshot().documents());
            }
            // Handled by the callers' select loops.
            WorkerCommand::Shutdown => {}
        }
    }

    fn handle_change(&mut self, change: RemoteChange) {
        // Echo bookkeeping before reconciliation: a locally-initiated
        // write clears its pending entry even if the reconciler then folds
        // the event away as a duplicate.
        if let Some(matched) = self
            .pending
            .match_echo(self.reconciler.collection(), &change.id, change.kind)
        {
            self.stats.echoes_matched.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[{}] echo for '{}' matched pending mutation {}",
                self.reconciler.collection(),
                change.id,
                matched.correlation_id
            );
        }

        // Applied and discarded partition the incoming events.
        match self.reconciler.apply(change) {
            Some(delta) => {
                self.stats.events_applied.fetch_add(1, Ordering::Relaxed);
                self.emit(&delta);
            }
            None => {
                self.stats.events_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn emit(&mut self, delta: &crate::event::Delta) {
        let failures = self.dispatcher.dispatch(delta);
        self.stats.deltas_dispatched.fetch_add(1, Ordering::Relaxed);
        if failures > 0 {
            self.stats
                .observer_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CollectionName, Fields, Timestamp, Value};
    use crate::event::ChangeKind;
    use crate::testing::MemoryStore;
    use std::time::Duration as StdDuration;

    fn test_worker() -> (CollectionWorker, Arc<AtomicEngineStats>) {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let (status_tx, _status_rx) = watch::channel(SubscriptionState::Pending);
        let stats = Arc::new(AtomicEngineStats::default());
        let worker = CollectionWorker::new(
            store,
            Reconciler::new(CollectionName::new("projects").unwrap()),
            Arc::new(PendingMutations::new(StdDuration::from_secs(10))),
            status_tx,
            stats.clone(),
            EngineConfig::for_testing(),
        );
        (worker, stats)
    }

    fn change(id: &str, kind: ChangeKind, updated_at: i64) -> RemoteChange {
        let mut fields = Fields::new();
        fields.insert("v".to_string(), Value::from(updated_at as f64));
        RemoteChange {
            id: DocumentId::from(id),
            kind,
            document: Some(Document::with_timestamps(
                fields,
                Timestamp(0),
                Timestamp(updated_at),
            )),
        }
    }

    #[test]
    fn test_applied_and_discarded_counters_are_disjoint() {
        let (mut worker, stats) = test_worker();

        worker.handle_change(change("p1", ChangeKind::Added, 100));
        // Stale redelivery folds away and must not count as applied.
        worker.handle_change(change("p1", ChangeKind::Modified, 50));
        worker.handle_change(change("p1", ChangeKind::Modified, 200));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.events_applied, 2);
        assert_eq!(snapshot.events_discarded, 1);
        assert_eq!(snapshot.deltas_dispatched, 2);
    }

    #[test]
    fn test_echo_clears_pending_even_when_discarded() {
        let (mut worker, stats) = test_worker();
        worker.handle_change(change("p1", ChangeKind::Added, 100));

        worker.pending.register(
            CollectionName::new("projects").unwrap(),
            DocumentId::from("p1"),
            ChangeKind::Modified,
        );
        // The echo arrives stale; the pending entry still clears.
        worker.handle_change(change("p1", ChangeKind::Modified, 50));

        assert!(worker.pending.is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.echoes_matched, 1);
        assert_eq!(snapshot.events_discarded, 1);
    }
}
