//! Claim-side queue abstraction.
//!
//! A claim is a transaction holding row locks on up to `limit` due tasks.
//! Everything done through a [`ClaimedBatch`] takes effect on
//! [`ClaimedBatch::commit`]; dropping the batch instead rolls back and makes
//! every claimed task claimable again.
//!
//! Producers do not go through this trait. They enqueue inside their own
//! transaction (see [`crate::db::queue::enqueue`]).

pub mod registry;

pub use registry::{REINDEX_DATE_TAG, SYNC_ENTITY_TAG, TagRegistry, TaskKind, TaskPayload};

use crate::error::Result;
use crate::model::{Task, TaskId};
use std::future::Future;

/// Source of claimable tasks.
pub trait TaskQueue: Send + Sync {
    type Claim: ClaimedBatch;

    /// Lock up to `limit` tasks with `scheduled_at < now`, oldest enqueued
    /// first, skipping rows already locked by another claimer.
    fn claim_due(&self, limit: i64) -> impl Future<Output = Result<Self::Claim>> + Send;
}

/// An open claim transaction and the tasks it locked.
pub trait ClaimedBatch: Send {
    /// Claimed tasks in FIFO order.
    fn tasks(&self) -> &[Task];

    /// Stage deletion of claimed tasks.
    fn delete(&mut self, ids: &[TaskId]) -> impl Future<Output = Result<()>> + Send;

    /// Stage moving a claimed task to the dead letter table.
    fn quarantine(&mut self, task: &Task, reason: &str) -> impl Future<Output = Result<()>> + Send;

    /// Apply all staged changes and release the locks.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discard staged changes and release the locks now rather than on drop.
    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}
