//! Administrative reindex by date range.

use super::Db;
use super::queue::enqueue_batch;
use crate::error::{Error, Result};
use crate::model::EntityId;
use crate::primary::PrimaryStore;
use crate::queue::REINDEX_DATE_TAG;
use chrono::{DateTime, Utc};
use tracing::info;

impl Db {
    /// Enqueue a sync for every entity updated in `start..=end`.
    ///
    /// All tasks are inserted in one transaction: either the whole range is
    /// queued or none of it is. Returns the number of tasks enqueued.
    pub async fn reindex_date<P: PrimaryStore>(
        &self,
        primary: &P,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        if end < start {
            return Err(Error::Other(format!(
                "reindex range ends ({end}) before it starts ({start})"
            )));
        }

        let ids: Vec<EntityId> = primary.ids_updated_between(start, end).await?;

        let mut tx = self.begin().await?;
        let enqueued = enqueue_batch(&mut *tx, &ids, REINDEX_DATE_TAG, None).await?;
        tx.commit().await?;

        info!(%start, %end, count = enqueued.len(), "queued date-range reindex");
        Ok(enqueued.len())
    }
}
