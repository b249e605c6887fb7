//! Batch indexer: primary entities in, index documents out.
//!
//! Used by the reconciler for needs-index tasks and directly for
//! administrative reindexing.

use super::{DocumentTransform, NoTransform, SearchIndex};
use crate::error::Result;
use crate::model::{EntityId, IndexDocument};
use crate::primary::PrimaryStore;
use crate::telemetry::{metrics, reconcile as spans};
use opentelemetry::KeyValue;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Instrument, debug};

/// What a call to [`BatchIndexer::index`] wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    /// Entities upserted as live documents.
    pub upserted: Vec<EntityId>,
    /// Entities missing or deleted in the primary store, tombstoned instead.
    pub tombstoned: Vec<EntityId>,
}

pub struct BatchIndexer<P, I> {
    primary: Arc<P>,
    index: Arc<I>,
    transform: Arc<dyn DocumentTransform>,
}

impl<P, I> Clone for BatchIndexer<P, I> {
    fn clone(&self) -> Self {
        Self {
            primary: Arc::clone(&self.primary),
            index: Arc::clone(&self.index),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<P: PrimaryStore, I: SearchIndex> BatchIndexer<P, I> {
    pub fn new(primary: Arc<P>, index: Arc<I>) -> Self {
        Self::with_transform(primary, index, Arc::new(NoTransform))
    }

    pub fn with_transform(
        primary: Arc<P>,
        index: Arc<I>,
        transform: Arc<dyn DocumentTransform>,
    ) -> Self {
        Self {
            primary,
            index,
            transform,
        }
    }

    /// Index the given entities.
    ///
    /// Live entities are transformed and upserted; ids that are missing or
    /// deleted in the primary store are tombstoned. Duplicate ids are written
    /// once.
    pub async fn index(&self, ids: &[EntityId]) -> Result<IndexOutcome> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<EntityId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(IndexOutcome::default());
        }

        let span = spans::start_batch_span(ids.len());
        async {
            let entities = self.primary.fetch_entities(&ids).await?;

            let mut documents = Vec::with_capacity(entities.len());
            let mut live = HashSet::with_capacity(entities.len());
            for entity in entities.iter().filter(|e| !e.deleted) {
                let mut document = IndexDocument::from_entity(entity);
                self.transform.transform(entity, &mut document);
                // The index key and version marker always come from the primary store.
                document.id = entity.id;
                document.updated = entity.updated;
                live.insert(entity.id);
                documents.push(document);
            }

            let tombstoned: Vec<EntityId> =
                ids.iter().copied().filter(|id| !live.contains(id)).collect();

            if !documents.is_empty() {
                self.index.upsert(&documents).await?;
                metrics::index_writes().add(
                    documents.len() as u64,
                    &[KeyValue::new("operation", "upsert")],
                );
            }
            if !tombstoned.is_empty() {
                self.index.tombstone(&tombstoned).await?;
                metrics::index_writes().add(
                    tombstoned.len() as u64,
                    &[KeyValue::new("operation", "tombstone")],
                );
            }

            debug!(
                upserted = documents.len(),
                tombstoned = tombstoned.len(),
                "batch indexed"
            );

            Ok(IndexOutcome {
                upserted: documents.into_iter().map(|d| d.id).collect(),
                tombstoned,
            })
        }
        .instrument(span)
        .await
    }
}
