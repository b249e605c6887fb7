use super::lock;
use crate::error::{Error, Result};
use crate::index::SearchIndex;
use crate::model::{EntityId, IndexDocument, IndexStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq)]
enum Stored {
    Live(IndexDocument),
    Tombstone,
}

#[derive(Default)]
struct IndexState {
    documents: HashMap<EntityId, Stored>,
    upserts: Vec<Vec<EntityId>>,
    tombstones: Vec<Vec<EntityId>>,
    rejected: HashSet<EntityId>,
}

/// In-memory search index that records every write call.
#[derive(Default)]
pub struct MemorySearchIndex {
    state: Mutex<IndexState>,
    unavailable: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a live document without recording a write.
    pub fn seed(&self, document: IndexDocument) {
        lock(&self.state)
            .documents
            .insert(document.id, Stored::Live(document));
    }

    pub fn document(&self, id: EntityId) -> Option<IndexDocument> {
        match lock(&self.state).documents.get(&id) {
            Some(Stored::Live(doc)) => Some(doc.clone()),
            _ => None,
        }
    }

    pub fn is_tombstoned(&self, id: EntityId) -> bool {
        matches!(lock(&self.state).documents.get(&id), Some(Stored::Tombstone))
    }

    /// Ids passed to each `upsert` call, in call order.
    pub fn upsert_calls(&self) -> Vec<Vec<EntityId>> {
        lock(&self.state).upserts.clone()
    }

    /// Ids passed to each `tombstone` call, in call order.
    pub fn tombstone_calls(&self) -> Vec<Vec<EntityId>> {
        lock(&self.state).tombstones.clone()
    }

    /// Total write calls of either kind.
    pub fn write_count(&self) -> usize {
        let state = lock(&self.state);
        state.upserts.len() + state.tombstones.len()
    }

    /// Make every call fail as if the index were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reject writes for `id` while accepting the rest of the batch.
    pub fn reject(&self, id: EntityId) {
        lock(&self.state).rejected.insert(id);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Index {
                status: 503,
                body: "service unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Apply `write` to every id not rejected, then report rejected ids.
    fn write_batch(
        &self,
        ids: Vec<EntityId>,
        mut write: impl FnMut(&mut IndexState, EntityId),
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let mut failed = Vec::new();
        for id in ids {
            if state.rejected.contains(&id) {
                failed.push(id);
            } else {
                write(&mut *state, id);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialBatchFailure { failed })
        }
    }
}

impl SearchIndex for MemorySearchIndex {
    async fn fetch_status(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, IndexStatus>> {
        self.check_available()?;
        let state = lock(&self.state);
        Ok(ids
            .iter()
            .filter_map(|id| {
                let status = match state.documents.get(id)? {
                    Stored::Live(doc) => IndexStatus {
                        updated: Some(doc.updated),
                        deleted: false,
                    },
                    Stored::Tombstone => IndexStatus {
                        updated: None,
                        deleted: true,
                    },
                };
                Some((*id, status))
            })
            .collect())
    }

    async fn upsert(&self, documents: &[IndexDocument]) -> Result<()> {
        self.check_available()?;
        lock(&self.state)
            .upserts
            .push(documents.iter().map(|d| d.id).collect());

        let by_id: HashMap<EntityId, &IndexDocument> =
            documents.iter().map(|d| (d.id, d)).collect();
        self.write_batch(documents.iter().map(|d| d.id).collect(), |state, id| {
            if let Some(doc) = by_id.get(&id) {
                state.documents.insert(id, Stored::Live((*doc).clone()));
            }
        })
    }

    async fn tombstone(&self, ids: &[EntityId]) -> Result<()> {
        self.check_available()?;
        lock(&self.state).tombstones.push(ids.to_vec());
        self.write_batch(ids.to_vec(), |state, id| {
            state.documents.insert(id, Stored::Tombstone);
        })
    }
}
