//! Mutation gateway: correlated writes against the remote store.
//!
//! Every create/update/remove registers a [`PendingMutation`] before the
//! remote write goes out, and the matching echo — the same change arriving
//! back through the live stream — clears it. This is bookkeeping only:
//! echo deltas are dispatched to observers exactly like any other change,
//! so every caller converges on the one authoritative path. Pending
//! entries with no echo inside the timeout are dropped and logged as a
//! non-fatal leak; retrying is the caller's decision, never the engine's
//! (a blind retry could double-create).

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use std::sync::Arc;

use uuid::Uuid;

use crate::document::{CollectionName, Document, DocumentId, Fields};
use crate::error::SyncError;
use crate::event::ChangeKind;
use crate::store::RemoteStore;

/// A locally-initiated write awaiting its echo.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub correlation_id: Uuid,
    pub collection: CollectionName,
    pub id: DocumentId,
    pub expected_kind: ChangeKind,
    pub issued_at: Instant,
}

/// Shared table of writes awaiting echoes.
///
/// Registered by the gateway, matched by collection workers as echoes pass
/// through reconciliation, swept by the engine's background task.
pub struct PendingMutations {
    timeout: Duration,
    inner: Mutex<Vec<PendingMutation>>,
}

impl PendingMutations {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            inner: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingMutation>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a write about to be issued; returns its correlation id.
    pub fn register(
        &self,
        collection: CollectionName,
        id: DocumentId,
        expected_kind: ChangeKind,
    ) -> Uuid {
        let correlation_id = Uuid::new_v4();
        self.lock().push(PendingMutation {
            correlation_id,
            collection,
            id,
            expected_kind,
            issued_at: Instant::now(),
        });
        correlation_id
    }

    /// Drop a pending entry after a failed write.
    pub fn discard(&self, correlation_id: Uuid) -> bool {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|p| p.correlation_id != correlation_id);
        pending.len() != before
    }

    /// Match an incoming change against the oldest compatible entry.
    ///
    /// Removals match a pending remove. Added and Modified both match a
    /// pending upsert: an idempotent create of an existing id echoes as
    /// Modified, and the gateway cannot know in advance which one the
    /// store will report.
    pub fn match_echo(
        &self,
        collection: &CollectionName,
        id: &DocumentId,
        kind: ChangeKind,
    ) -> Option<PendingMutation> {
        let mut pending = self.lock();
        let position = pending.iter().position(|p| {
            p.collection == *collection && p.id == *id && kinds_compatible(p.expected_kind, kind)
        })?;
        Some(pending.remove(position))
    }

    /// Remove and return every entry older than the echo timeout.
    pub fn sweep_expired(&self, now: Instant) -> Vec<PendingMutation> {
        let mut pending = self.lock();
        let mut expired = Vec::new();
        pending.retain(|p| {
            if now.duration_since(p.issued_at) >= self.timeout {
                expired.push(p.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn kinds_compatible(expected: ChangeKind, echoed: ChangeKind) -> bool {
    match expected {
        ChangeKind::Removed => echoed == ChangeKind::Removed,
        ChangeKind::Added | ChangeKind::Modified => {
            matches!(echoed, ChangeKind::Added | ChangeKind::Modified)
        }
    }
}

/// Wraps remote writes with echo correlation.
pub struct MutationGateway {
    store: Arc<dyn RemoteStore>,
    pending: Arc<PendingMutations>,
}

impl MutationGateway {
    pub fn new(store: Arc<dyn RemoteStore>, pending: Arc<PendingMutations>) -> Self {
        Self { store, pending }
    }

    /// Create a document with a freshly generated id.
    ///
    /// The id is generated client-side (the way vendor SDKs do) so the
    /// pending entry can be registered before the write is issued.
    pub async fn create(
        &self,
        collection: &CollectionName,
        document: Document,
    ) -> Result<DocumentId, SyncError> {
        self.create_with_id(collection, DocumentId::generate(), document)
            .await
    }

    /// Idempotent upsert with a caller-supplied id.
    pub async fn create_with_id(
        &self,
        collection: &CollectionName,
        id: DocumentId,
        document: Document,
    ) -> Result<DocumentId, SyncError> {
        document.validate()?;
        let correlation_id =
            self.pending
                .register(collection.clone(), id.clone(), ChangeKind::Added);
        match self
            .store
            .write_document(collection, Some(id), document)
            .await
        {
            Ok(id) => {
                log::debug!("[{collection}] create '{id}' acknowledged");
                Ok(id)
            }
            Err(err) => {
                self.pending.discard(correlation_id);
                Err(SyncError::RemoteWrite(err))
            }
        }
    }

    /// Merge a partial field map into an existing document.
    ///
    /// Completes when the store acknowledges the write; callers that need
    /// "my write is visible" must separately await the matching delta.
    pub async fn update(
        &self,
        collection: &CollectionName,
        id: &DocumentId,
        partial: Fields,
    ) -> Result<(), SyncError> {
        let document = Document::new(partial);
        document.validate()?;
        let correlation_id =
            self.pending
                .register(collection.clone(), id.clone(), ChangeKind::Modified);
        match self
            .store
            .write_document(collection, Some(id.clone()), document)
            .await
        {
            Ok(_) => {
                log::debug!("[{collection}] update '{id}' acknowledged");
                Ok(())
            }
            Err(err) => {
                self.pending.discard(correlation_id);
                Err(SyncError::RemoteWrite(err))
            }
        }
    }

    /// Delete a document.
    pub async fn remove(
        &self,
        collection: &CollectionName,
        id: &DocumentId,
    ) -> Result<(), SyncError> {
        let correlation_id =
            self.pending
                .register(collection.clone(), id.clone(), ChangeKind::Removed);
        match self.store.delete_document(collection, id).await {
            Ok(()) => {
                log::debug!("[{collection}] remove '{id}' acknowledged");
                Ok(())
            }
            Err(err) => {
                self.pending.discard(correlation_id);
                Err(SyncError::RemoteWrite(err))
            }
        }
    }
}
