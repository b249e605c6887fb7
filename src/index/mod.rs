//! Search index abstraction, the HTTP client, and the batch indexer.

pub mod batch;
pub mod http;

pub use batch::{BatchIndexer, IndexOutcome};
pub use http::HttpSearchIndex;

use crate::error::Result;
use crate::model::{Entity, EntityId, IndexDocument, IndexStatus};
use std::collections::HashMap;
use std::future::Future;

/// The secondary index kept consistent with the primary store.
///
/// Both writes are idempotent: repeating a call leaves the same final state.
pub trait SearchIndex: Send + Sync {
    /// Bulk point lookup. Ids never indexed are absent from the result.
    fn fetch_status(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<HashMap<EntityId, IndexStatus>>> + Send;

    fn upsert(&self, documents: &[IndexDocument]) -> impl Future<Output = Result<()>> + Send;

    /// Overwrite documents with a `{"deleted": true}` marker.
    fn tombstone(&self, ids: &[EntityId]) -> impl Future<Output = Result<()>> + Send;
}

/// Enrichment hook run on every document before it is upserted.
///
/// Only the body is kept: `id` and `updated` are reset from the entity after
/// the hook runs.
pub trait DocumentTransform: Send + Sync {
    fn transform(&self, entity: &Entity, document: &mut IndexDocument);
}

/// Leaves documents exactly as loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransform;

impl DocumentTransform for NoTransform {
    fn transform(&self, _entity: &Entity, _document: &mut IndexDocument) {}
}

impl<F> DocumentTransform for F
where
    F: Fn(&Entity, &mut IndexDocument) + Send + Sync,
{
    fn transform(&self, entity: &Entity, document: &mut IndexDocument) {
        self(entity, document)
    }
}
