//! Snapshot reconciliation: the single chokepoint through which every
//! change event flows.
//!
//! One reconciler exists per collection and is exclusively owned by that
//! collection's worker task, so snapshot mutation needs no lock by
//! construction. Incoming changes are stamped with a per-stream sequence
//! number, merged last-write-wins by `updated_at`, and reduced to the
//! minimal [`Delta`] — or to nothing when the event is stale, duplicate,
//! or removes an absent key. The same path handles live events and the
//! synthetic events generated from a post-reconnect full listing, which is
//! what makes an overlapping resync safe.

use std::collections::HashMap;

use crate::document::{CollectionName, Document, DocumentId};
use crate::event::{ChangeEvent, ChangeKind, Delta, DeltaKind};
use crate::store::RemoteChange;

/// Authoritative in-memory state for one collection.
///
/// Invariant: the snapshot reflects every applied event with
/// `sequence <= last_sequence`, in order; no such event is ever reapplied.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    documents: HashMap<DocumentId, Document>,
    last_sequence: u64,
}

impl Snapshot {
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Owned copy of the document map for external readers.
    pub fn documents(&self) -> HashMap<DocumentId, Document> {
        self.documents.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &Document)> {
        self.documents.iter()
    }
}

/// Counters for reconciliation outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub events_seen: u64,
    pub deltas_emitted: u64,
    pub stale_discarded: u64,
    pub duplicates_discarded: u64,
    pub absent_removals: u64,
}

/// Merges change events into the authoritative snapshot for one collection.
pub struct Reconciler {
    collection: CollectionName,
    snapshot: Snapshot,
    next_sequence: u64,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            snapshot: Snapshot::default(),
            next_sequence: 0,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    /// Stamp an incoming change and merge it into the snapshot.
    ///
    /// Returns the minimal observable delta, or `None` when the snapshot
    /// is unchanged: the incoming document is strictly older than what the
    /// snapshot holds (late delivery), byte-equal to it (duplicate
    /// delivery), or removes an id that is not present.
    pub fn apply(&mut self, change: RemoteChange) -> Option<Delta> {
        let sequence = self.next_sequence + 1;
        self.next_sequence = sequence;

        let event = ChangeEvent {
            collection: self.collection.clone(),
            id: change.id,
            kind: change.kind,
            document: change.document,
            sequence,
        };
        self.apply_event(event)
    }

    fn apply_event(&mut self, event: ChangeEvent) -> Option<Delta> {
        self.stats.events_seen += 1;
        self.snapshot.last_sequence = event.sequence;

        let delta = match event.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                let incoming = match event.document {
                    Some(doc) => doc,
                    None => {
                        log::warn!(
                            "[{}] {:?} event for '{}' carried no document, dropped",
                            self.collection,
                            event.kind,
                            event.id
                        );
                        return None;
                    }
                };
                self.upsert(event.id, incoming, event.sequence)
            }
            ChangeKind::Removed => self.remove(event.id, event.sequence),
        };

        if delta.is_some() {
            self.stats.deltas_emitted += 1;
        }
        delta
    }

    fn upsert(&mut self, id: DocumentId, incoming: Document, sequence: u64) -> Option<Delta> {
        match self.snapshot.documents.get(&id) {
            Some(existing) if existing.updated_at > incoming.updated_at => {
                // Late or replayed delivery; the snapshot never regresses.
                log::debug!(
                    "[{}] stale event for '{}' discarded ({} < {})",
                    self.collection,
                    id,
                    incoming.updated_at.millis(),
                    existing.updated_at.millis()
                );
                self.stats.stale_discarded += 1;
                None
            }
            Some(existing) if *existing == incoming => {
                self.stats.duplicates_discarded += 1;
                None
            }
            Some(_) => {
                let before = self.snapshot.documents.insert(id.clone(), incoming.clone());
                Some(Delta {
                    collection: self.collection.clone(),
                    kind: DeltaKind::Modified,
                    id,
                    before,
                    after: Some(incoming),
                    sequence,
                })
            }
            None => {
                self.snapshot.documents.insert(id.clone(), incoming.clone());
                Some(Delta {
                    collection: self.collection.clone(),
                    kind: DeltaKind::Added,
                    id,
                    before: None,
                    after: Some(incoming),
                    sequence,
                })
            }
        }
    }

    fn remove(&mut self, id: DocumentId, sequence: u64) -> Option<Delta> {
        match self.snapshot.documents.remove(&id) {
            Some(before) => Some(Delta {
                collection: self.collection.clone(),
                kind: DeltaKind::Removed,
                id,
                before: Some(before),
                after: None,
                sequence,
            }),
            None => {
                self.stats.absent_removals += 1;
                None
            }
        }
    }

    /// Reconcile a full listing against the snapshot.
    ///
    /// Every listed document runs through [`Reconciler::apply`] as a
    /// synthetic add/modify, so the `updated_at` staleness check protects
    /// against live events that raced ahead of the listing. Ids present in
    /// the snapshot but absent from the listing become synthetic removals:
    /// the store is authoritative for deletions that happened while
    /// disconnected. Applying the same listing twice yields no deltas the
    /// second time.
    pub fn resync(&mut self, listing: Vec<(DocumentId, Document)>) -> Vec<Delta> {
        let mut deltas = Vec::new();

        let mut listed: std::collections::HashSet<DocumentId> =
            std::collections::HashSet::with_capacity(listing.len());

        for (id, document) in listing {
            listed.insert(id.clone());
            let kind = if self.snapshot.contains(&id) {
                ChangeKind::Modified
            } else {
                ChangeKind::Added
            };
            let change = RemoteChange {
                id,
                kind,
                document: Some(document),
            };
            if let Some(delta) = self.apply(change) {
                deltas.push(delta);
            }
        }

        let vanished: Vec<DocumentId> = self
            .snapshot
            .documents
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            let change = RemoteChange {
                id,
                kind: ChangeKind::Removed,
                document: None,
            };
            if let Some(delta) = self.apply(change) {
                deltas.push(delta);
            }
        }

        deltas
    }
}
