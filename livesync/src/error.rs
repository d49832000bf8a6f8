//! Public error taxonomy for the synchronization engine.
//!
//! Stream failures never appear here: they are absorbed by the
//! reconnection supervisor and surface only as a subscription-state
//! change. Mutation failures are surfaced synchronously to the caller and
//! never auto-retried (a blind retry could double-create).

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller supplied a collection name the store cannot accept.
    #[error("invalid collection '{name}': {reason}")]
    InvalidCollection { name: String, reason: String },

    /// Document system fields are malformed; nothing was sent to the store.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// The remote store rejected or failed a mutation.
    #[error("remote write failed: {0}")]
    RemoteWrite(#[from] StoreError),

    /// The subscription or engine was already shut down.
    #[error("subscription closed")]
    Closed,
}
