//! Normalized change events and the deltas produced by reconciling them.
//!
//! A [`ChangeEvent`] is what the reconciler processes: a raw store
//! notification stamped with a per-stream sequence number at the moment of
//! receipt. A [`Delta`] is the minimal net observable change that results,
//! the only thing observers ever see.

use crate::document::{CollectionName, Document, DocumentId};

/// What the remote store reported happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A store notification normalized for reconciliation.
///
/// `sequence` is assigned by the reconciler on receipt, not by the remote
/// store; it detects out-of-order replays across a reconnect. `document`
/// is `None` exactly when `kind` is [`ChangeKind::Removed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub id: DocumentId,
    pub kind: ChangeKind,
    pub document: Option<Document>,
    pub sequence: u64,
}

/// Net observable change after reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Modified,
    Removed,
}

/// The minimal delta delivered to observers.
///
/// `before`/`after` are owned copies; observers never hold references into
/// the live snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub collection: CollectionName,
    pub kind: DeltaKind,
    pub id: DocumentId,
    pub before: Option<Document>,
    pub after: Option<Document>,
    pub sequence: u64,
}
