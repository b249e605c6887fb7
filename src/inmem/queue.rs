use super::lock;
use crate::error::Result;
use crate::model::{EntityId, Task, TaskId};
use crate::queue::{ClaimedBatch, TaskPayload, TaskQueue};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A quarantined task.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub task: Task,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    /// Committed tasks, in insertion order.
    tasks: Vec<Task>,
    /// Tasks held by an open claim.
    locked: HashSet<TaskId>,
    dead_letters: Vec<DeadLetter>,
    /// Shift applied to the wall clock, for testing scheduled tasks.
    clock_offset: Duration,
}

impl QueueState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

/// In-memory task queue.
///
/// Cloning shares the same queue, the way two consumer processes share one
/// table.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a producer transaction.
    pub fn begin(&self) -> MemoryProducerTx {
        MemoryProducerTx {
            queue: self.clone(),
            staged: Vec::new(),
        }
    }

    /// Enqueue and commit in one step.
    pub fn enqueue(
        &self,
        entity_id: EntityId,
        tag: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> TaskId {
        let mut tx = self.begin();
        let id = tx.enqueue(entity_id, tag, scheduled_at);
        tx.commit();
        id
    }

    /// Move the queue's clock forward.
    pub fn advance(&self, by: Duration) {
        lock(&self.state).clock_offset += by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        lock(&self.state).now()
    }

    /// Committed tasks, claimed or not.
    pub fn tasks(&self) -> Vec<Task> {
        lock(&self.state).tasks.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state).dead_letters.clone()
    }
}

/// Producer transaction. Staged tasks are discarded unless committed.
pub struct MemoryProducerTx {
    queue: MemoryQueue,
    staged: Vec<Task>,
}

impl MemoryProducerTx {
    pub fn enqueue_raw(
        &mut self,
        tag: &str,
        payload: serde_json::Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> TaskId {
        let now = self.queue.now();
        let task = Task {
            id: TaskId::new(),
            enqueued_at: now,
            scheduled_at: scheduled_at.unwrap_or(now),
            tag: tag.to_string(),
            payload,
        };
        let id = task.id;
        self.staged.push(task);
        id
    }

    pub fn enqueue(
        &mut self,
        entity_id: EntityId,
        tag: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> TaskId {
        self.enqueue_raw(tag, TaskPayload::sync_entity(entity_id).to_value(), scheduled_at)
    }

    pub fn enqueue_batch(
        &mut self,
        entity_ids: &[EntityId],
        tag: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Vec<TaskId> {
        entity_ids
            .iter()
            .map(|id| self.enqueue(*id, tag, scheduled_at))
            .collect()
    }

    pub fn commit(self) {
        let mut state = lock(&self.queue.state);
        state.tasks.extend(self.staged);
    }
}

impl TaskQueue for MemoryQueue {
    type Claim = MemoryClaim;

    async fn claim_due(&self, limit: i64) -> Result<MemoryClaim> {
        let mut state = lock(&self.state);
        let now = state.now();
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut due: Vec<Task> = state
            .tasks
            .iter()
            .filter(|t| t.scheduled_at < now && !state.locked.contains(&t.id))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        due.sort_by_key(|t| t.enqueued_at);
        due.truncate(limit);

        state.locked.extend(due.iter().map(|t| t.id));
        Ok(MemoryClaim {
            state: Arc::clone(&self.state),
            tasks: due,
            deleted: HashSet::new(),
            quarantined: Vec::new(),
            released: false,
        })
    }
}

/// Open claim on a [`MemoryQueue`]. Dropping it releases the locks and
/// discards staged changes.
pub struct MemoryClaim {
    state: Arc<Mutex<QueueState>>,
    tasks: Vec<Task>,
    deleted: HashSet<TaskId>,
    quarantined: Vec<DeadLetter>,
    released: bool,
}

impl MemoryClaim {
    fn release(&mut self, state: &mut QueueState) {
        for task in &self.tasks {
            state.locked.remove(&task.id);
        }
        self.released = true;
    }
}

impl ClaimedBatch for MemoryClaim {
    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    async fn delete(&mut self, ids: &[TaskId]) -> Result<()> {
        // Like DELETE ... WHERE id = ANY: only rows this claim holds are touched.
        let held: HashSet<TaskId> = self.tasks.iter().map(|t| t.id).collect();
        self.deleted
            .extend(ids.iter().copied().filter(|id| held.contains(id)));
        Ok(())
    }

    async fn quarantine(&mut self, task: &Task, reason: &str) -> Result<()> {
        self.deleted.insert(task.id);
        self.quarantined.push(DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let mut state = lock(&state);
        let deleted = std::mem::take(&mut self.deleted);
        state.tasks.retain(|t| !deleted.contains(&t.id));
        state.dead_letters.append(&mut self.quarantined);
        self.release(&mut state);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if !self.released {
            let state = Arc::clone(&self.state);
            let mut state = lock(&state);
            self.release(&mut state);
        }
    }
}
