//! Read-only view of the primary store.

use crate::error::Result;
use crate::model::{Entity, EntityId, PrimaryStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;

/// Bulk lookups against the store that owns the tracked entities.
///
/// Ids that do not exist are simply absent from the returned collections.
pub trait PrimaryStore: Send + Sync {
    fn fetch_status(
        &self,
        ids: &[EntityId],
    ) -> impl Future<Output = Result<HashMap<EntityId, PrimaryStatus>>> + Send;

    /// Load full entities for indexing.
    fn fetch_entities(&self, ids: &[EntityId]) -> impl Future<Output = Result<Vec<Entity>>> + Send;

    /// Ids of entities whose `updated` lies in `start..=end`.
    fn ids_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<EntityId>>> + Send;
}
