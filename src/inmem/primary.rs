use super::lock;
use crate::error::{Error, Result};
use crate::model::{Entity, EntityId, PrimaryStatus};
use crate::primary::PrimaryStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory primary store.
#[derive(Default)]
pub struct MemoryPrimaryStore {
    entities: Mutex<HashMap<EntityId, Entity>>,
    unavailable: AtomicBool,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity.
    pub fn put(&self, entity: Entity) {
        lock(&self.entities).insert(entity.id, entity);
    }

    /// Insert a live entity with the given version and body.
    pub fn put_live(&self, id: EntityId, updated: DateTime<Utc>, body: serde_json::Value) {
        let body = match body {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        self.put(Entity {
            id,
            updated,
            deleted: false,
            body,
        });
    }

    /// Flag an entity deleted (soft delete). No-op if absent.
    pub fn mark_deleted(&self, id: EntityId) {
        if let Some(entity) = lock(&self.entities).get_mut(&id) {
            entity.deleted = true;
        }
    }

    /// Remove an entity outright.
    pub fn remove(&self, id: EntityId) {
        lock(&self.entities).remove(&id);
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Database(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

impl PrimaryStore for MemoryPrimaryStore {
    async fn fetch_status(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, PrimaryStatus>> {
        self.check_available()?;
        let entities = lock(&self.entities);
        Ok(ids
            .iter()
            .filter_map(|id| entities.get(id).map(|e| (*id, e.status())))
            .collect())
    }

    async fn fetch_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        self.check_available()?;
        let entities = lock(&self.entities);
        Ok(ids.iter().filter_map(|id| entities.get(id).cloned()).collect())
    }

    async fn ids_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityId>> {
        self.check_available()?;
        let entities = lock(&self.entities);
        let mut matching: Vec<&Entity> = entities
            .values()
            .filter(|e| e.updated >= start && e.updated <= end)
            .collect();
        matching.sort_by_key(|e| e.updated);
        Ok(matching.into_iter().map(|e| e.id).collect())
    }
}
