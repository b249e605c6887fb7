//! Error types for searchsync-rs.

use crate::model::{EntityId, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("search index request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search index returned {status}: {body}")]
    Index { status: u16, body: String },

    #[error("search index rejected {} of the batch's documents", failed.len())]
    PartialBatchFailure { failed: Vec<EntityId> },

    #[error("malformed payload on task {task_id}: {reason}")]
    MalformedPayload { task_id: TaskId, reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same request might succeed.
    ///
    /// Only index-side failures are considered; database errors abort the
    /// tick and are retried by the next poll instead.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Index { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
