//! Remote document store abstraction.
//!
//! The engine never talks to a vendor SDK directly and never reaches for a
//! global client. A [`RemoteStore`] implementation is constructed once and
//! injected into the subscription registry and mutation gateway. Four
//! primitives are required:
//!
//! - `stream_collection` — live change subscription (server push)
//! - `list_collection`   — full listing, used for post-reconnect resync
//! - `write_document`    — merge-upsert of one document
//! - `delete_document`   — authoritative delete
//!
//! Methods return [`BoxFuture`] so the trait stays object-safe behind
//! `Arc<dyn RemoteStore>`.

use std::fmt;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::document::{CollectionName, Document, DocumentId};
use crate::event::ChangeKind;

/// Whether a store failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Transient,
    Permanent,
}

/// Failure reported by the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

/// A raw change as delivered by the live stream (no sequence yet).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub id: DocumentId,
    pub kind: ChangeKind,
    /// `None` exactly when `kind` is [`ChangeKind::Removed`].
    pub document: Option<Document>,
}

/// One notification pushed into the stream channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Change(RemoteChange),
    /// The stream failed; the supervisor will resubscribe with backoff.
    Disconnected { reason: String },
}

/// Cancels the underlying live query when dropped or cancelled.
pub struct StreamHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel (streams that end on receiver drop).
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Cancel the stream now instead of waiting for drop.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// The injected remote-store capability.
///
/// Implementations must deliver [`StreamEvent::Change`] notifications with
/// full document content and timestamps, and either push
/// [`StreamEvent::Disconnected`] or close the channel on network loss.
/// `write_document` has merge-upsert semantics: fields absent from the
/// written document survive on the server, and the server keeps the
/// original `created_at` on merge.
pub trait RemoteStore: Send + Sync {
    fn stream_collection<'a>(
        &'a self,
        collection: &'a CollectionName,
        events: mpsc::Sender<StreamEvent>,
    ) -> BoxFuture<'a, Result<StreamHandle, StoreError>>;

    fn list_collection<'a>(
        &'a self,
        collection: &'a CollectionName,
    ) -> BoxFuture<'a, Result<Vec<(DocumentId, Document)>, StoreError>>;

    fn write_document<'a>(
        &'a self,
        collection: &'a CollectionName,
        id: Option<DocumentId>,
        document: Document,
    ) -> BoxFuture<'a, Result<DocumentId, StoreError>>;

    fn delete_document<'a>(
        &'a self,
        collection: &'a CollectionName,
        id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}
