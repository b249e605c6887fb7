//! Primary store reader over a Postgres table.
//!
//! The table must have `id UUID`, `updated` and `deleted BOOLEAN` columns.
//! `updated` may be `TIMESTAMPTZ` or a naive `TIMESTAMP` holding UTC; the type
//! is looked up once, on first use. Every other column ends up in the entity
//! body.

use crate::config::validate_identifier;
use crate::error::{Error, Result};
use crate::model::{Entity, EntityId, PrimaryStatus};
use crate::primary::PrimaryStore;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Storage type of the `updated` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedColumn {
    /// `timestamp with time zone`
    Zoned,
    /// `timestamp without time zone`, values in UTC
    NaiveUtc,
}

impl UpdatedColumn {
    fn from_type_name(table: &str, type_name: &str) -> Result<Self> {
        match type_name {
            "timestamp with time zone" => Ok(Self::Zoned),
            "timestamp without time zone" => Ok(Self::NaiveUtc),
            other => Err(Error::Config(format!(
                "{table}.updated must be a timestamp column, found {other}"
            ))),
        }
    }

    /// Expression reading `updated` as a `TIMESTAMPTZ`.
    fn select(self) -> &'static str {
        match self {
            Self::Zoned => "t.updated",
            Self::NaiveUtc => "(t.updated AT TIME ZONE 'UTC')",
        }
    }

    /// Placeholder `$n` converted to the column's type, for range filters.
    fn bound(self, placeholder: &str) -> String {
        match self {
            Self::Zoned => placeholder.to_string(),
            Self::NaiveUtc => format!("({placeholder} AT TIME ZONE 'UTC')"),
        }
    }
}

#[derive(Clone)]
pub struct PgPrimaryStore {
    pool: PgPool,
    table: String,
    updated: OnceCell<UpdatedColumn>,
}

impl PgPrimaryStore {
    /// `table` is spliced into SQL and must be a plain (optionally
    /// schema-qualified) identifier.
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            updated: OnceCell::new(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Type of the `updated` column, queried from the catalog once.
    pub async fn updated_column(&self) -> Result<UpdatedColumn> {
        let kind = self
            .updated
            .get_or_try_init(|| self.detect_updated_column())
            .await?;
        Ok(*kind)
    }

    async fn detect_updated_column(&self) -> Result<UpdatedColumn> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT format_type(a.atttypid, NULL)
             FROM pg_attribute a
             WHERE a.attrelid = $1::text::regclass
               AND a.attname = 'updated'
               AND NOT a.attisdropped",
        )
        .bind(&self.table)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((type_name,)) => UpdatedColumn::from_type_name(&self.table, &type_name),
            None => Err(Error::Config(format!(
                "table {} has no updated column",
                self.table
            ))),
        }
    }
}

fn uuids(ids: &[EntityId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.0).collect()
}

impl PrimaryStore for PgPrimaryStore {
    async fn fetch_status(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, PrimaryStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let updated = self.updated_column().await?;

        let sql = format!(
            "SELECT t.id, {} AS updated, t.deleted FROM {} t WHERE t.id = ANY($1)",
            updated.select(),
            self.table
        );
        let rows: Vec<(Uuid, DateTime<Utc>, bool)> = sqlx::query_as(&sql)
            .bind(uuids(ids))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, updated, deleted)| (EntityId(id), PrimaryStatus { updated, deleted }))
            .collect())
    }

    async fn fetch_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let updated = self.updated_column().await?;

        let sql = format!(
            "SELECT t.id, {} AS updated, t.deleted,
                    to_jsonb(t) - 'id' - 'updated' - 'deleted' AS body
             FROM {} t WHERE t.id = ANY($1)",
            updated.select(),
            self.table
        );
        let rows: Vec<EntityRow> = sqlx::query_as(&sql)
            .bind(uuids(ids))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Entity::from).collect())
    }

    async fn ids_updated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EntityId>> {
        let updated = self.updated_column().await?;

        // Compare on the raw column so an index on `updated` stays usable.
        let sql = format!(
            "SELECT t.id FROM {} t WHERE t.updated >= {} AND t.updated <= {} ORDER BY t.updated",
            self.table,
            updated.bound("$1"),
            updated.bound("$2")
        );
        let rows: Vec<(Uuid,)> = sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| EntityId(id)).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EntityRow {
    id: Uuid,
    updated: DateTime<Utc>,
    deleted: bool,
    body: serde_json::Value,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        let body = match row.body {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            id: EntityId(row.id),
            updated: row.updated,
            deleted: row.deleted,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naive_columns_are_read_and_filtered_as_utc() {
        let kind = UpdatedColumn::from_type_name("annotation", "timestamp without time zone")
            .unwrap();
        assert_eq!(kind, UpdatedColumn::NaiveUtc);
        assert_eq!(kind.select(), "(t.updated AT TIME ZONE 'UTC')");
        assert_eq!(kind.bound("$1"), "($1 AT TIME ZONE 'UTC')");

        let kind =
            UpdatedColumn::from_type_name("annotation", "timestamp with time zone").unwrap();
        assert_eq!(kind.select(), "t.updated");
        assert_eq!(kind.bound("$2"), "$2");
    }

    #[test]
    fn non_timestamp_columns_are_rejected() {
        let err = UpdatedColumn::from_type_name("annotation", "text").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
