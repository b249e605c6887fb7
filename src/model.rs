//! Core data model.
//!
//! A task is a durable "please propagate this entity" note written in the same
//! transaction as the primary-store mutation it tracks. Entities and index
//! documents are owned elsewhere; only the projections needed to compare them
//! live here.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A queue entry. Never updated in place, only inserted and deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Defines FIFO order among eligible tasks.
    pub enqueued_at: DateTime<Utc>,

    /// The task is not claimable until `scheduled_at < now`.
    pub scheduled_at: DateTime<Utc>,

    /// Selects how `payload` is decoded (see [`crate::queue::TagRegistry`]).
    pub tag: String,

    /// Opaque arguments. The queue itself never interprets these.
    pub payload: serde_json::Value,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Identifier shared by a primary entity and its index document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(EntityId)
    }
}

/// Primary-store projection used for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryStatus {
    pub updated: DateTime<Utc>,
    pub deleted: bool,
}

/// Index-side projection used for reconciliation.
///
/// Tombstones carry no `updated` marker, so they never compare equal to a live
/// primary version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStatus {
    pub updated: Option<DateTime<Utc>>,
    pub deleted: bool,
}

/// A full primary entity, as loaded for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub updated: DateTime<Utc>,
    pub deleted: bool,
    /// Every other column of the entity's row.
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn status(&self) -> PrimaryStatus {
        PrimaryStatus {
            updated: self.updated,
            deleted: self.deleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Index document
// ---------------------------------------------------------------------------

/// A live document ready to be written to the search index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: EntityId,
    pub updated: DateTime<Utc>,
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl IndexDocument {
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            updated: entity.updated,
            body: entity.body.clone(),
        }
    }

    /// The `_source` written to the index. `id`, `updated` and `deleted`
    /// always win over same-named keys in the body.
    pub fn to_source(&self) -> serde_json::Value {
        let mut source = self.body.clone();
        source.insert("id".to_string(), self.id.to_string().into());
        source.insert("updated".to_string(), format_version(self.updated).into());
        source.insert("deleted".to_string(), false.into());
        serde_json::Value::Object(source)
    }
}

/// Render a version marker with full microsecond precision so that a value
/// read back from the index compares equal to the primary store's.
pub fn format_version(updated: DateTime<Utc>) -> String {
    updated.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// Outcome of comparing one claimed task's entity across primary store and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Entity gone or deleted in the primary store.
    Obsolete,
    /// Entity live but missing from the index or at a different version.
    NeedsIndex,
    /// Index already holds the primary version.
    AlreadyConsistent,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::Obsolete => "obsolete",
            Disposition::NeedsIndex => "needs_index",
            Disposition::AlreadyConsistent => "already_consistent",
        };
        write!(f, "{s}")
    }
}
