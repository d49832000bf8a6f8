//! Delta fan-out to registered observers.
//!
//! Observers for a collection receive deltas in the exact order the
//! reconciler produced them; there is no reordering across observers. A
//! failing observer is logged and skipped — it never blocks delivery to
//! the remaining observers, never loses its own future deltas, and never
//! tears down the subscription. Observer callbacks run on the collection
//! worker task, so slow work must be offloaded (see [`ChannelObserver`]).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::Delta;

/// Error signalled by an observer; isolated at the dispatch boundary.
#[derive(Debug, Clone, Error)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A local consumer of reconciled deltas.
pub trait DeltaObserver: Send + Sync {
    fn on_delta(&self, delta: &Delta) -> Result<(), ObserverError>;
}

impl<F> DeltaObserver for F
where
    F: Fn(&Delta) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_delta(&self, delta: &Delta) -> Result<(), ObserverError> {
        self(delta)
    }
}

/// Observer that forwards deltas into an unbounded channel.
///
/// The standard way to move delta handling off the worker task: register
/// a `ChannelObserver` and consume the receiver wherever slow work is
/// allowed to happen.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Delta>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delta>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeltaObserver for ChannelObserver {
    fn on_delta(&self, delta: &Delta) -> Result<(), ObserverError> {
        self.tx
            .send(delta.clone())
            .map_err(|_| ObserverError::new("delta channel receiver dropped"))
    }
}

/// Fan-out counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub deltas_dispatched: u64,
    pub observer_failures: u64,
}

/// Ordered observer registry for one collection.
///
/// Owned by the collection worker; registration order is delivery order.
pub struct Dispatcher {
    observers: Vec<(Uuid, Arc<dyn DeltaObserver>)>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Register an observer; returns its handle id.
    pub fn register(&mut self, observer: Arc<dyn DeltaObserver>) -> Uuid {
        let id = Uuid::new_v4();
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer. Returns false if the id is unknown.
    pub fn unregister(&mut self, id: Uuid) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Deliver one delta to every observer, in registration order.
    ///
    /// Returns the number of observers that failed (already logged).
    pub fn dispatch(&mut self, delta: &Delta) -> usize {
        self.stats.deltas_dispatched += 1;
        let mut failures = 0;
        for (id, observer) in &self.observers {
            if let Err(err) = observer.on_delta(delta) {
                failures += 1;
                self.stats.observer_failures += 1;
                log::warn!(
                    "[{}] observer {} failed on delta for '{}': {}",
                    delta.collection,
                    id,
                    delta.id,
                    err
                );
            }
        }
        failures
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("observers", &self.observers.len())
            .field("stats", &self.stats)
            .finish()
    }
}
