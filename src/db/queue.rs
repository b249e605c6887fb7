//! Postgres task queue.
//!
//! Producers insert rows through [`enqueue`] / [`enqueue_batch`] on their own
//! connection or transaction. Consumers claim with `FOR UPDATE SKIP LOCKED`
//! inside a transaction that stays open until the batch is resolved.

use crate::error::Result;
use crate::model::{EntityId, Task, TaskId};
use crate::queue::{ClaimedBatch, TaskPayload, TaskQueue};
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Insert one task with an arbitrary payload.
///
/// Runs on the caller's connection; pass `&mut *tx` to make the task part of
/// the transaction that mutates the primary data. `scheduled_at` defaults to
/// the current transaction time.
pub async fn enqueue_raw(
    conn: &mut PgConnection,
    tag: &str,
    payload: &serde_json::Value,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<TaskId> {
    let id = TaskId::new();
    sqlx::query(
        "INSERT INTO task_queue (id, scheduled_at, tag, payload)
         VALUES ($1, COALESCE($2, now()), $3, $4)",
    )
    .bind(id.0)
    .bind(scheduled_at)
    .bind(tag)
    .bind(payload)
    .execute(conn)
    .await?;

    metrics::tasks_enqueued().add(1, &[KeyValue::new("tag", tag.to_string())]);
    Ok(id)
}

/// Enqueue a sync of one entity. Must run inside the mutating transaction.
pub async fn enqueue(
    conn: &mut PgConnection,
    entity_id: EntityId,
    tag: &str,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<TaskId> {
    let payload = TaskPayload::sync_entity(entity_id).to_value();
    enqueue_raw(conn, tag, &payload, scheduled_at).await
}

/// Enqueue syncs for many entities sharing a tag and schedule, in one statement.
pub async fn enqueue_batch(
    conn: &mut PgConnection,
    entity_ids: &[EntityId],
    tag: &str,
    scheduled_at: Option<DateTime<Utc>>,
) -> Result<Vec<TaskId>> {
    if entity_ids.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<TaskId> = entity_ids.iter().map(|_| TaskId::new()).collect();
    let payloads: Vec<serde_json::Value> = entity_ids
        .iter()
        .map(|e| TaskPayload::sync_entity(*e).to_value())
        .collect();

    sqlx::query(
        "INSERT INTO task_queue (id, scheduled_at, tag, payload)
         SELECT t.id, COALESCE($2, now()), $3, t.payload
         FROM UNNEST($1::uuid[], $4::jsonb[]) AS t(id, payload)",
    )
    .bind(ids.iter().map(|id| id.0).collect::<Vec<Uuid>>())
    .bind(scheduled_at)
    .bind(tag)
    .bind(payloads)
    .execute(conn)
    .await?;

    metrics::tasks_enqueued().add(ids.len() as u64, &[KeyValue::new("tag", tag.to_string())]);
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Queue depth as seen by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total: i64,
    /// Tasks whose `scheduled_at` has passed.
    pub due: i64,
}

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let (total, due): (i64, i64) = sqlx::query_as(
            "SELECT count(*), count(*) FILTER (WHERE scheduled_at < now()) FROM task_queue",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats { total, due })
    }
}

impl TaskQueue for PgTaskQueue {
    type Claim = PgClaim;

    async fn claim_due(&self, limit: i64) -> Result<PgClaim> {
        // Postgres rejects a negative LIMIT; treat it as "claim nothing".
        let limit = limit.max(0);
        let mut tx = self.pool.begin().await?;

        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, enqueued_at, scheduled_at, tag, payload
             FROM task_queue
             WHERE scheduled_at < now()
             ORDER BY enqueued_at, id
             LIMIT $1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let tasks: Vec<Task> = rows.into_iter().map(Task::from).collect();
        metrics::tasks_claimed().add(tasks.len() as u64, &[]);

        Ok(PgClaim { tx, tasks })
    }
}

/// Claim transaction. Dropping it without [`ClaimedBatch::commit`] rolls back.
pub struct PgClaim {
    tx: Transaction<'static, Postgres>,
    tasks: Vec<Task>,
}

impl ClaimedBatch for PgClaim {
    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    async fn delete(&mut self, ids: &[TaskId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM task_queue WHERE id = ANY($1)")
            .bind(ids.iter().map(|id| id.0).collect::<Vec<Uuid>>())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn quarantine(&mut self, task: &Task, reason: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_queue_dead_letter (id, enqueued_at, scheduled_at, tag, payload, reason)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(task.id.0)
        .bind(task.enqueued_at)
        .bind(task.scheduled_at)
        .bind(&task.tag)
        .bind(&task.payload)
        .bind(reason)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(task.id.0)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    enqueued_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    tag: String,
    payload: serde_json::Value,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Self {
            id: TaskId(row.id),
            enqueued_at: row.enqueued_at,
            scheduled_at: row.scheduled_at,
            tag: row.tag,
            payload: row.payload,
        }
    }
}
