//! Engine facade: construction, configuration and counters.
//!
//! A [`SyncEngine`] is built once from an injected [`RemoteStore`] and
//! handed around by reference. It owns the subscription registry, the
//! mutation gateway, the shared pending-mutation table and a background
//! sweeper that expires writes whose echo never arrived.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::dispatch::DeltaObserver;
use crate::document::{CollectionName, Document, DocumentId, Fields};
use crate::error::SyncError;
use crate::mutation::{MutationGateway, PendingMutations};
use crate::registry::{SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
use crate::store::RemoteStore;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stream event channel capacity per collection.
    pub stream_capacity: usize,
    /// Registry command channel capacity per collection.
    pub command_capacity: usize,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_cap: Duration,
    /// How long a mutation may wait for its echo before being dropped.
    pub mutation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 256,
            command_capacity: 64,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            mutation_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Config for tests: tight backoff and a short echo timeout so
    /// reconnect paths run in milliseconds.
    pub fn for_testing() -> Self {
        Self {
            stream_capacity: 64,
            command_capacity: 16,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(80),
            mutation_timeout: Duration::from_millis(250),
        }
    }
}

/// Lock-free engine counters, updated on the hot path via atomics.
#[derive(Debug, Default)]
pub(crate) struct AtomicEngineStats {
    pub events_applied: AtomicU64,
    pub events_discarded: AtomicU64,
    pub deltas_dispatched: AtomicU64,
    pub observer_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub resyncs: AtomicU64,
    pub echoes_matched: AtomicU64,
    pub echo_leaks: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Events that mutated the snapshot and produced a delta.
    pub events_applied: u64,
    /// Events folded away as stale/duplicate/absent-remove; disjoint from
    /// `events_applied`.
    pub events_discarded: u64,
    pub deltas_dispatched: u64,
    pub observer_failures: u64,
    pub reconnects: u64,
    pub resyncs: u64,
    pub echoes_matched: u64,
    /// Mutations whose echo never arrived inside the timeout.
    pub echo_leaks: u64,
}

impl AtomicEngineStats {
    pub(crate) fn snapshot(&self) -> EngineStats {
        EngineStats {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            deltas_dispatched: self.deltas_dispatched.load(Ordering::Relaxed),
            observer_failures: self.observer_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            echoes_matched: self.echoes_matched.load(Ordering::Relaxed),
            echo_leaks: self.echo_leaks.load(Ordering::Relaxed),
        }
    }
}

/// The synchronization engine.
///
/// Must be constructed inside a tokio runtime (workers and the echo
/// sweeper are spawned tasks). Dropping the engine shuts every worker
/// down: their command channels close and each cancels its stream.
pub struct SyncEngine {
    registry: SubscriptionRegistry,
    gateway: MutationGateway,
    pending: Arc<PendingMutations>,
    stats: Arc<AtomicEngineStats>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, config: EngineConfig) -> Self {
        let pending = Arc::new(PendingMutations::new(config.mutation_timeout));
        let stats = Arc::new(AtomicEngineStats::default());

        let registry =
            SubscriptionRegistry::new(store.clone(), pending.clone(), stats.clone(), config.clone());
        let gateway = MutationGateway::new(store, pending.clone());
        let sweeper = tokio::spawn(sweep_loop(
            pending.clone(),
            stats.clone(),
            config.mutation_timeout,
        ));

        Self {
            registry,
            gateway,
            pending,
            stats,
            sweeper,
        }
    }

    /// Engine with default configuration.
    pub fn with_defaults(store: Arc<dyn RemoteStore>) -> Self {
        Self::new(store, EngineConfig::default())
    }

    /// Register an observer on a collection, opening the shared stream on
    /// first use.
    pub async fn subscribe(
        &self,
        collection: &str,
        observer: Arc<dyn DeltaObserver>,
    ) -> Result<SubscriptionHandle, SyncError> {
        self.registry.subscribe(collection, observer).await
    }

    /// Return a handle; the stream closes when the last one is returned.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SyncError> {
        self.registry.unsubscribe(handle).await
    }

    /// Connectivity indicator for UI surfaces.
    pub async fn subscription_state(&self, collection: &str) -> SubscriptionState {
        self.registry.subscription_state(collection).await
    }

    /// Copied view of the current snapshot for a subscribed collection.
    pub async fn snapshot(
        &self,
        collection: &str,
    ) -> Result<HashMap<DocumentId, Document>, SyncError> {
        self.registry.snapshot(collection).await
    }

    /// Create a document; the store-assigned id is returned on ack.
    pub async fn create(
        &self,
        collection: &str,
        document: Document,
    ) -> Result<DocumentId, SyncError> {
        let name = CollectionName::new(collection)?;
        self.gateway.create(&name, document).await
    }

    /// Idempotent upsert with a caller-supplied id.
    pub async fn create_with_id(
        &self,
        collection: &str,
        id: DocumentId,
        document: Document,
    ) -> Result<DocumentId, SyncError> {
        let name = CollectionName::new(collection)?;
        self.gateway.create_with_id(&name, id, document).await
    }

    /// Merge a partial field map into an existing document.
    pub async fn update(
        &self,
        collection: &str,
        id: &DocumentId,
        partial: Fields,
    ) -> Result<(), SyncError> {
        let name = CollectionName::new(collection)?;
        self.gateway.update(&name, id, partial).await
    }

    /// Delete a document.
    pub async fn remove(&self, collection: &str, id: &DocumentId) -> Result<(), SyncError> {
        let name = CollectionName::new(collection)?;
        self.gateway.remove(&name, id).await
    }

    /// Current engine counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Number of mutations still waiting for their echo.
    pub fn pending_mutations(&self) -> usize {
        self.pending.len()
    }

    /// Number of collections with a live subscription worker.
    pub async fn active_collections(&self) -> usize {
        self.registry.active_collections().await
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Periodically expire mutations whose echo never arrived.
///
/// A leak is logged and counted, never retried: the write was already
/// acknowledged, so only the echo path is suspect.
async fn sweep_loop(
    pending: Arc<PendingMutations>,
    stats: Arc<AtomicEngineStats>,
    timeout: Duration,
) {
    let period = (timeout / 2).max(Duration::from_millis(25));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        for leaked in pending.sweep_expired(Instant::now()) {
            stats.echo_leaks.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[{}] no echo for mutation {} on '{}' within {timeout:?}, dropped",
                leaked.collection,
                leaked.correlation_id,
                leaked.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.stream_capacity, 256);
        assert_eq!(config.command_capacity, 64);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.mutation_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_stats_snapshot() {
        let atomic = AtomicEngineStats::default();
        atomic.events_applied.store(3, Ordering::Relaxed);
        atomic.echo_leaks.store(1, Ordering::Relaxed);
        let stats = atomic.snapshot();
        assert_eq!(stats.events_applied, 3);
        assert_eq!(stats.echo_leaks, 1);
        assert_eq!(stats.deltas_dispatched, 0);
    }
}
