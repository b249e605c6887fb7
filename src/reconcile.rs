//! The reconciler: one poll tick of claim, compare, index, delete.
//!
//! Each tick is a single unit of work inside one claim transaction:
//!
//! 1. claim up to `limit` due tasks (skip-locked);
//! 2. decode payloads, quarantining tasks that do not decode;
//! 3. fetch primary and index status for the distinct referenced entities;
//! 4. classify every task as obsolete, needs-index or already-consistent;
//! 5. index the distinct needs-index entities;
//! 6. delete every classified task and commit.
//!
//! Any error before step 6 commits rolls the claim back, discarding every staged
//! deletion and quarantine, so all claimed tasks come back on the next tick.
//! The index write in step 5 is not transactional with the queue; a crash
//! between 5 and 6 re-delivers tasks whose re-indexing is a no-op.

use crate::error::{Error, Result};
use crate::index::{BatchIndexer, DocumentTransform, NoTransform, SearchIndex};
use crate::model::{Disposition, EntityId, IndexStatus, PrimaryStatus, Task, TaskId};
use crate::primary::PrimaryStore;
use crate::queue::{ClaimedBatch, TagRegistry, TaskPayload, TaskQueue};
use crate::telemetry::{metrics, reconcile as spans};
use opentelemetry::KeyValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info, warn};

/// Classify one entity.
///
/// Staleness is plain inequality of the `updated` markers: an index that is
/// somehow ahead of the primary store is re-indexed too.
pub fn classify(
    entity_id: &EntityId,
    primary: &HashMap<EntityId, PrimaryStatus>,
    index: &HashMap<EntityId, IndexStatus>,
) -> Disposition {
    match primary.get(entity_id) {
        None => Disposition::Obsolete,
        Some(status) if status.deleted => Disposition::Obsolete,
        Some(status) => match index.get(entity_id) {
            Some(doc) if doc.updated == Some(status.updated) => Disposition::AlreadyConsistent,
            _ => Disposition::NeedsIndex,
        },
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub claimed: usize,
    pub obsolete: usize,
    pub already_consistent: usize,
    /// Tasks classified needs-index.
    pub needs_index: usize,
    /// Distinct entities handed to the batch indexer.
    pub indexed_entities: usize,
    pub quarantined: usize,
}

impl ReconcileReport {
    /// Tasks removed from the queue by this tick.
    pub fn resolved(&self) -> usize {
        self.obsolete + self.already_consistent + self.needs_index + self.quarantined
    }
}

pub struct Reconciler<Q, P, I> {
    queue: Q,
    primary: Arc<P>,
    index: Arc<I>,
    indexer: BatchIndexer<P, I>,
    registry: TagRegistry,
    limit: i64,
}

impl<Q, P, I> Reconciler<Q, P, I>
where
    Q: TaskQueue,
    P: PrimaryStore,
    I: SearchIndex,
{
    pub fn new(queue: Q, primary: Arc<P>, index: Arc<I>, limit: i64) -> Self {
        Self::with_transform(queue, primary, index, limit, Arc::new(NoTransform))
    }

    pub fn with_transform(
        queue: Q,
        primary: Arc<P>,
        index: Arc<I>,
        limit: i64,
        transform: Arc<dyn DocumentTransform>,
    ) -> Self {
        let indexer = BatchIndexer::with_transform(Arc::clone(&primary), Arc::clone(&index), transform);
        Self {
            queue,
            primary,
            index,
            indexer,
            registry: TagRegistry::default(),
            limit,
        }
    }

    /// Replace the default tag registry.
    pub fn with_registry(mut self, registry: TagRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The batch indexer used for needs-index tasks, for direct reindexing.
    pub fn indexer(&self) -> &BatchIndexer<P, I> {
        &self.indexer
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Run one poll tick.
    ///
    /// Errors from the primary store or the index abandon the whole tick.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let span = spans::start_tick_span(self.limit);
        let started = Instant::now();

        let result = self.tick(&span).instrument(span.clone()).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::tick_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("result", outcome)],
        );
        result
    }

    async fn tick(&self, span: &tracing::Span) -> Result<ReconcileReport> {
        let mut claim = self.queue.claim_due(self.limit).await?;
        let tasks = claim.tasks().to_vec();
        spans::record_claimed(span, tasks.len());

        let mut report = ReconcileReport {
            claimed: tasks.len(),
            ..Default::default()
        };
        if tasks.is_empty() {
            debug!("no due tasks");
            return Ok(report);
        }

        match self.resolve(&mut claim, &tasks, &mut report).await {
            Ok(resolved) => {
                claim.delete(&resolved).await?;
                claim.commit().await?;
            }
            Err(e) => {
                if let Err(rollback) = claim.rollback().await {
                    warn!(error = %rollback, "claim rollback failed");
                }
                return Err(e);
            }
        }

        record_dispositions(&report);
        Ok(report)
    }

    /// Quarantine, classify and index the claimed tasks. Returns the ids of
    /// every task to delete.
    async fn resolve(
        &self,
        claim: &mut Q::Claim,
        tasks: &[Task],
        report: &mut ReconcileReport,
    ) -> Result<Vec<TaskId>> {
        // Decode, quarantining anything that cannot be handled.
        let mut refs: Vec<(TaskId, EntityId)> = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.registry.decode(task) {
                Ok(TaskPayload::SyncEntity { entity_id }) => refs.push((task.id, entity_id)),
                Err(Error::MalformedPayload { task_id, reason }) => {
                    warn!(%task_id, tag = %task.tag, %reason, "quarantining malformed task");
                    claim.quarantine(task, &reason).await?;
                    report.quarantined += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let mut seen = HashSet::with_capacity(refs.len());
        let entity_ids: Vec<EntityId> = refs
            .iter()
            .map(|(_, entity_id)| *entity_id)
            .filter(|entity_id| seen.insert(*entity_id))
            .collect();

        let (primary, index) = tokio::try_join!(
            self.primary.fetch_status(&entity_ids),
            self.index.fetch_status(&entity_ids),
        )?;

        let mut resolved: Vec<TaskId> = Vec::with_capacity(refs.len());
        let mut to_index: Vec<EntityId> = Vec::new();
        let mut queued_for_index: HashSet<EntityId> = HashSet::new();
        for (task_id, entity_id) in &refs {
            match classify(entity_id, &primary, &index) {
                Disposition::Obsolete => report.obsolete += 1,
                Disposition::AlreadyConsistent => report.already_consistent += 1,
                Disposition::NeedsIndex => {
                    report.needs_index += 1;
                    if queued_for_index.insert(*entity_id) {
                        to_index.push(*entity_id);
                    }
                }
            }
            resolved.push(*task_id);
        }

        if report.obsolete > 0 {
            info!(
                count = report.obsolete,
                "deleting tasks whose entities were deleted from the primary store"
            );
        }
        if report.already_consistent > 0 {
            info!(
                count = report.already_consistent,
                "deleting tasks whose entities are already in sync"
            );
        }
        if !to_index.is_empty() {
            info!(entities = to_index.len(), tasks = report.needs_index, "indexing entities");
            self.indexer.index(&to_index).await?;
            report.indexed_entities = to_index.len();
        }

        Ok(resolved)
    }
}

fn record_dispositions(report: &ReconcileReport) {
    let counter = metrics::task_dispositions();
    for (disposition, count) in [
        (Disposition::Obsolete.to_string(), report.obsolete),
        (Disposition::NeedsIndex.to_string(), report.needs_index),
        (Disposition::AlreadyConsistent.to_string(), report.already_consistent),
        ("quarantined".to_string(), report.quarantined),
    ] {
        if count > 0 {
            counter.add(count as u64, &[KeyValue::new("disposition", disposition)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn id() -> EntityId {
        EntityId(Uuid::new_v4())
    }

    #[test]
    fn missing_or_deleted_entities_are_obsolete() {
        let gone = id();
        let deleted = id();
        let now = Utc::now();
        let primary = HashMap::from([(
            deleted,
            PrimaryStatus {
                updated: now,
                deleted: true,
            },
        )]);
        let index = HashMap::from([(
            deleted,
            IndexStatus {
                updated: Some(now),
                deleted: false,
            },
        )]);

        assert_eq!(classify(&gone, &primary, &index), Disposition::Obsolete);
        assert_eq!(classify(&deleted, &primary, &index), Disposition::Obsolete);
    }

    #[test]
    fn version_mismatch_in_either_direction_needs_index() {
        let now = Utc::now();
        let (missing, behind, ahead, tombstoned, same) = (id(), id(), id(), id(), id());
        let live = PrimaryStatus {
            updated: now,
            deleted: false,
        };
        let primary: HashMap<_, _> = [missing, behind, ahead, tombstoned, same]
            .into_iter()
            .map(|e| (e, live))
            .collect();
        let indexed = |updated| IndexStatus {
            updated,
            deleted: false,
        };
        let index = HashMap::from([
            (behind, indexed(Some(now - Duration::seconds(5)))),
            (ahead, indexed(Some(now + Duration::seconds(5)))),
            (
                tombstoned,
                IndexStatus {
                    updated: None,
                    deleted: true,
                },
            ),
            (same, indexed(Some(now))),
        ]);

        assert_eq!(classify(&missing, &primary, &index), Disposition::NeedsIndex);
        assert_eq!(classify(&behind, &primary, &index), Disposition::NeedsIndex);
        assert_eq!(classify(&ahead, &primary, &index), Disposition::NeedsIndex);
        assert_eq!(classify(&tombstoned, &primary, &index), Disposition::NeedsIndex);
        assert_eq!(classify(&same, &primary, &index), Disposition::AlreadyConsistent);
    }
}
