//! Tag registry: which tags exist and how their payloads decode.
//!
//! Every tag maps to a [`TaskKind`]. Decoding a task checks the tag is known
//! and the payload matches the kind's schema, turning an untyped JSON map into
//! a [`TaskPayload`].

use crate::error::{Error, Result};
use crate::model::{EntityId, Task};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tag used by producers when a tracked entity changes.
pub const SYNC_ENTITY_TAG: &str = "sync_entity";

/// Tag used by the administrative date-range reindex.
pub const REINDEX_DATE_TAG: &str = "reindex_date";

/// The handler family a tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Synchronize one entity to the search index.
    SyncEntity,
}

/// A decoded task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPayload {
    SyncEntity { entity_id: EntityId },
}

/// Wire shape of a `SyncEntity` payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncEntityArgs {
    entity_id: EntityId,
}

impl TaskPayload {
    pub fn sync_entity(entity_id: EntityId) -> Self {
        TaskPayload::SyncEntity { entity_id }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::SyncEntity { .. } => TaskKind::SyncEntity,
        }
    }

    /// The JSON stored in the queue's `payload` column.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            TaskPayload::SyncEntity { entity_id } => serde_json::json!(SyncEntityArgs {
                entity_id: *entity_id
            }),
        }
    }
}

/// Registered tags, each bound to one [`TaskKind`].
#[derive(Debug, Clone)]
pub struct TagRegistry {
    kinds: HashMap<String, TaskKind>,
}

impl TagRegistry {
    /// A registry with no tags.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Register (or rebind) a tag.
    pub fn register(&mut self, tag: impl Into<String>, kind: TaskKind) -> &mut Self {
        self.kinds.insert(tag.into(), kind);
        self
    }

    pub fn kind_of(&self, tag: &str) -> Option<TaskKind> {
        self.kinds.get(tag).copied()
    }

    /// Decode a task's payload according to its tag.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPayload`] for an unregistered tag or a payload that
    /// does not match the tag's schema.
    pub fn decode(&self, task: &Task) -> Result<TaskPayload> {
        let malformed = |reason: String| Error::MalformedPayload {
            task_id: task.id,
            reason,
        };

        let kind = self
            .kind_of(&task.tag)
            .ok_or_else(|| malformed(format!("unknown tag {:?}", task.tag)))?;

        match kind {
            TaskKind::SyncEntity => {
                let args: SyncEntityArgs = serde_json::from_value(task.payload.clone())
                    .map_err(|e| malformed(e.to_string()))?;
                Ok(TaskPayload::SyncEntity {
                    entity_id: args.entity_id,
                })
            }
        }
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(SYNC_ENTITY_TAG, TaskKind::SyncEntity)
            .register(REINDEX_DATE_TAG, TaskKind::SyncEntity);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;
    use chrono::Utc;
    use uuid::Uuid;

    fn task(tag: &str, payload: serde_json::Value) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            enqueued_at: now,
            scheduled_at: now,
            tag: tag.to_string(),
            payload,
        }
    }

    #[test]
    fn decodes_sync_entity_for_default_tags() {
        let registry = TagRegistry::default();
        let entity_id = EntityId(Uuid::new_v4());
        let payload = TaskPayload::sync_entity(entity_id).to_value();

        for tag in [SYNC_ENTITY_TAG, REINDEX_DATE_TAG] {
            let decoded = registry.decode(&task(tag, payload.clone())).unwrap();
            assert_eq!(decoded, TaskPayload::SyncEntity { entity_id });
            assert_eq!(decoded.kind(), TaskKind::SyncEntity);
        }
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let registry = TagRegistry::default();
        let payload = TaskPayload::sync_entity(EntityId(Uuid::new_v4())).to_value();
        let err = registry.decode(&task("send_email", payload)).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }), "got {err:?}");
    }

    #[test]
    fn payload_without_entity_id_is_malformed() {
        let registry = TagRegistry::default();
        let err = registry
            .decode(&task(SYNC_ENTITY_TAG, serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }), "got {err:?}");

        let err = registry
            .decode(&task(
                SYNC_ENTITY_TAG,
                serde_json::json!({"entity_id": "not-a-uuid"}),
            ))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }), "got {err:?}");
    }

    #[test]
    fn registered_tags_extend_the_defaults() {
        let mut registry = TagRegistry::default();
        registry.register("storage.update_annotation", TaskKind::SyncEntity);
        assert_eq!(
            registry.kind_of("storage.update_annotation"),
            Some(TaskKind::SyncEntity)
        );
        assert_eq!(TagRegistry::empty().kind_of(SYNC_ENTITY_TAG), None);
    }
}
