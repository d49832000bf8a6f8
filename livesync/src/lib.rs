//! # livesync — Real-time collection synchronization engine
//!
//! Client-side sync core over a remote document store: subscribe to a
//! collection once, keep a local snapshot continuously reconciled against
//! server push, and fan out minimal deltas to application observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  subscribe/mutate  ┌──────────────────────┐
//! │ SyncEngine │ ◄─────────────────► │ SubscriptionRegistry │
//! │ (facade)   │                     │ (one entry per coll) │
//! └─────┬──────┘                     └──────────┬───────────┘
//!       │                                       │ spawns
//!       ▼                                       ▼
//! ┌────────────┐                     ┌──────────────────────┐
//! │ Mutation   │   pending echoes    │ CollectionWorker     │
//! │ Gateway    │ ◄─────────────────► │ reconcile + dispatch │
//! └─────┬──────┘                     └──────────┬───────────┘
//!       │                                       │ stream/list
//!       ▼                                       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ RemoteStore (injected: vendor SDK adapter or MemoryStore)│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]   — Collections, ids, timestamps, field values
//! - [`event`]      — Raw change events and net deltas
//! - [`store`]      — The injected remote-store trait and stream types
//! - [`reconciler`] — Last-write-wins snapshot reconciliation
//! - [`dispatch`]   — Observer registration and isolated fan-out
//! - [`supervisor`] — Capped exponential backoff and stream attachment
//! - [`mutation`]   — Write path with echo correlation
//! - [`registry`]   — Subscription lifecycle and worker ownership
//! - [`engine`]     — The public facade tying it together
//! - [`testing`]    — Deterministic [`MemoryStore`] for tests

pub mod dispatch;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod mutation;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod testing;

pub(crate) mod worker;

// Re-exports for convenience
pub use dispatch::{ChannelObserver, DeltaObserver, DispatchStats, Dispatcher, ObserverError};
pub use document::{CollectionName, Document, DocumentId, Fields, Timestamp, Value};
pub use engine::{EngineConfig, EngineStats, SyncEngine};
pub use error::SyncError;
pub use event::{ChangeEvent, ChangeKind, Delta, DeltaKind};
pub use mutation::{MutationGateway, PendingMutation, PendingMutations};
pub use reconciler::{Reconciler, ReconcilerStats, Snapshot};
pub use registry::{SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
pub use store::{
    RemoteChange, RemoteStore, StoreError, StoreErrorKind, StreamEvent, StreamHandle,
};
pub use supervisor::Backoff;
pub use testing::MemoryStore;
