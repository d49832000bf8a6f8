//! Deterministic in-memory remote store for tests and benches.
//!
//! [`MemoryStore`] behaves like a hosted document store seen from one
//! client: writes are applied to per-collection maps and echoed into every
//! open stream for that collection (the way a vendor live query echoes
//! your own mutations back), listings return the current authoritative
//! state, and faults can be injected one call at a time. `drop_streams`
//! simulates a network loss to exercise the reconnection path.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::document::{CollectionName, Document, DocumentId, Timestamp};
use crate::event::ChangeKind;
use crate::store::{RemoteChange, RemoteStore, StoreError, StreamEvent, StreamHandle};

struct StreamSlot {
    id: Uuid,
    tx: mpsc::Sender<StreamEvent>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<CollectionName, BTreeMap<DocumentId, Document>>,
    streams: HashMap<CollectionName, Vec<StreamSlot>>,
    fail_next_write: Option<StoreError>,
    fail_next_stream: Option<StoreError>,
    fail_next_list: Option<StoreError>,
}

/// In-memory [`RemoteStore`] with fault injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    writes: AtomicU64,
    deletes: AtomicU64,
    listings: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
        match inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next `write_document` call with the given error.
    pub fn fail_next_write(&self, err: StoreError) {
        Self::lock(&self.inner).fail_next_write = Some(err);
    }

    /// Fail the next `stream_collection` call with the given error.
    pub fn fail_next_stream(&self, err: StoreError) {
        Self::lock(&self.inner).fail_next_stream = Some(err);
    }

    /// Fail the next `list_collection` call with the given error.
    pub fn fail_next_list(&self, err: StoreError) {
        Self::lock(&self.inner).fail_next_list = Some(err);
    }

    /// Simulate a network loss: every open stream for the collection gets
    /// a `Disconnected` event and is then forgotten by the store.
    pub fn drop_streams(&self, collection: &CollectionName) {
        let mut inner = Self::lock(&self.inner);
        if let Some(slots) = inner.streams.remove(collection) {
            for slot in slots {
                let _ = slot.tx.try_send(StreamEvent::Disconnected {
                    reason: "simulated network loss".to_string(),
                });
            }
        }
    }

    /// Number of live streams the store is currently feeding.
    pub fn stream_count(&self, collection: &CollectionName) -> usize {
        Self::lock(&self.inner)
            .streams
            .get(collection)
            .map_or(0, |slots| slots.len())
    }

    /// Direct read of the authoritative document (test assertions).
    pub fn get(&self, collection: &CollectionName, id: &DocumentId) -> Option<Document> {
        Self::lock(&self.inner)
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    pub fn len(&self, collection: &CollectionName) -> usize {
        Self::lock(&self.inner)
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len())
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn listing_count(&self) -> u64 {
        self.listings.load(Ordering::Relaxed)
    }

    fn emit(inner: &mut Inner, collection: &CollectionName, change: RemoteChange) {
        if let Some(slots) = inner.streams.get_mut(collection) {
            slots.retain(|slot| {
                match slot.tx.try_send(StreamEvent::Change(change.clone())) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("memory store stream {} full, event dropped", slot.id);
                        true
                    }
                }
            });
        }
    }
}

impl RemoteStore for MemoryStore {
    fn stream_collection<'a>(
        &'a self,
        collection: &'a CollectionName,
        events: mpsc::Sender<StreamEvent>,
    ) -> BoxFuture<'a, Result<StreamHandle, StoreError>> {
        async move {
            let mut inner = Self::lock(&self.inner);
            if let Some(err) = inner.fail_next_stream.take() {
                return Err(err);
            }

            let slot_id = Uuid::new_v4();
            inner
                .streams
                .entry(collection.clone())
                .or_default()
                .push(StreamSlot {
                    id: slot_id,
                    tx: events,
                });

            let store = self.inner.clone();
            let name = collection.clone();
            Ok(StreamHandle::new(move || {
                let mut inner = Self::lock(&store);
                if let Some(slots) = inner.streams.get_mut(&name) {
                    slots.retain(|slot| slot.id != slot_id);
                }
            }))
        }
        .boxed()
    }

    fn list_collection<'a>(
        &'a self,
        collection: &'a CollectionName,
    ) -> BoxFuture<'a, Result<Vec<(DocumentId, Document)>, StoreError>> {
        async move {
            let mut inner = Self::lock(&self.inner);
            if let Some(err) = inner.fail_next_list.take() {
                return Err(err);
            }
            self.listings.fetch_add(1, Ordering::Relaxed);
            Ok(inner
                .collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .map(|(id, doc)| (id.clone(), doc.clone()))
                        .collect()
                })
                .unwrap_or_default())
        }
        .boxed()
    }

    fn write_document<'a>(
        &'a self,
        collection: &'a CollectionName,
        id: Option<DocumentId>,
        document: Document,
    ) -> BoxFuture<'a, Result<DocumentId, StoreError>> {
        async move {
            let mut inner = Self::lock(&self.inner);
            if let Some(err) = inner.fail_next_write.take() {
                return Err(err);
            }
            self.writes.fetch_add(1, Ordering::Relaxed);

            let id = id.unwrap_or_else(DocumentId::generate);
            let docs = inner.collections.entry(collection.clone()).or_default();

            let (kind, stored) = match docs.get(&id) {
                Some(existing) => {
                    // Merge-upsert: incoming fields win, created_at is
                    // kept, updated_at stays monotonic per id.
                    let mut merged = existing.clone();
                    for (key, value) in document.fields {
                        merged.fields.insert(key, value);
                    }
                    merged.updated_at = if document.updated_at > existing.updated_at {
                        document.updated_at
                    } else {
                        Timestamp(existing.updated_at.millis() + 1)
                    };
                    (ChangeKind::Modified, merged)
                }
                None => (ChangeKind::Added, document),
            };
            docs.insert(id.clone(), stored.clone());

            Self::emit(
                &mut inner,
                collection,
                RemoteChange {
                    id: id.clone(),
                    kind,
                    document: Some(stored),
                },
            );
            Ok(id)
        }
        .boxed()
    }

    fn delete_document<'a>(
        &'a self,
        collection: &'a CollectionName,
        id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        async move {
            let mut inner = Self::lock(&self.inner);
            self.deletes.fetch_add(1, Ordering::Relaxed);

            let removed = inner
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .is_some();
            if removed {
                Self::emit(
                    &mut inner,
                    collection,
                    RemoteChange {
                        id: id.clone(),
                        kind: ChangeKind::Removed,
                        document: None,
                    },
                );
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Fields;

    fn collection() -> CollectionName {
        CollectionName::new("projects").unwrap()
    }

    #[tokio::test]
    async fn test_write_then_list() {
        let store = MemoryStore::new();
        let id = store
            .write_document(&collection(), None, Document::new(Fields::new()))
            .await
            .unwrap();

        let listing = store.list_collection(&collection()).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0, id);
    }

    #[tokio::test]
    async fn test_write_echoes_into_open_stream() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = store.stream_collection(&collection(), tx).await.unwrap();

        let id = store
            .write_document(&collection(), Some(DocumentId::from("p1")), Document::new(Fields::new()))
            .await
            .unwrap();
        assert_eq!(id, DocumentId::from("p1"));

        match rx.recv().await.unwrap() {
            StreamEvent::Change(change) => {
                assert_eq!(change.id, DocumentId::from("p1"));
                assert_eq!(change.kind, ChangeKind::Added);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_write_is_modified_and_merges() {
        let store = MemoryStore::new();
        let id = DocumentId::from("p1");

        let mut fields = Fields::new();
        fields.insert("a".to_string(), crate::document::Value::from("1"));
        store
            .write_document(&collection(), Some(id.clone()), Document::new(fields))
            .await
            .unwrap();

        let mut partial = Fields::new();
        partial.insert("b".to_string(), crate::document::Value::from("2"));
        store
            .write_document(&collection(), Some(id.clone()), Document::new(partial))
            .await
            .unwrap();

        let doc = store.get(&collection(), &id).unwrap();
        assert!(doc.get("a").is_some(), "merge must keep earlier fields");
        assert!(doc.get("b").is_some());
    }

    #[tokio::test]
    async fn test_cancel_handle_detaches_stream() {
        let store = MemoryStore::new();
        let (tx, _rx) = mpsc::channel(16);
        let handle = store.stream_collection(&collection(), tx).await.unwrap();
        assert_eq!(store.stream_count(&collection()), 1);

        handle.cancel();
        assert_eq!(store.stream_count(&collection()), 0);
    }

    #[tokio::test]
    async fn test_drop_streams_sends_disconnected() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = store.stream_collection(&collection(), tx).await.unwrap();

        store.drop_streams(&collection());
        assert!(matches!(
            rx.recv().await.unwrap(),
            StreamEvent::Disconnected { .. }
        ));
        assert_eq!(store.stream_count(&collection()), 0);
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let store = MemoryStore::new();
        store.fail_next_write(StoreError::transient("flaky"));

        let err = store
            .write_document(&collection(), None, Document::new(Fields::new()))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        store
            .write_document(&collection(), None, Document::new(Fields::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_absent_is_quiet() {
        let store = MemoryStore::new();
        let (tx, mut rx) = mpsc::channel(16);
        let _handle = store.stream_collection(&collection(), tx).await.unwrap();

        store
            .delete_document(&collection(), &DocumentId::from("ghost"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err(), "no event for deleting an absent id");
    }
}
