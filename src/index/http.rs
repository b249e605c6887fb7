//! Elasticsearch-compatible HTTP index client.
//!
//! Status lookups use an `ids` query restricted to the `updated` and `deleted`
//! source fields. Writes go through `_bulk`, one `index` action per document,
//! so re-sending a batch overwrites with identical content.

use super::SearchIndex;
use crate::config::{RetryPolicy, SearchConfig};
use crate::error::{Error, Result};
use crate::model::{EntityId, IndexDocument, IndexStatus};
use crate::telemetry::metrics;
use chrono::{DateTime, NaiveDateTime, Utc};
use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

pub struct HttpSearchIndex {
    client: reqwest::Client,
    config: SearchConfig,
}

impl HttpSearchIndex {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    /// Indices receiving writes: the live one, plus the reindex target if any.
    fn write_targets(&self) -> Vec<&str> {
        let mut targets = vec![self.config.index.as_str()];
        if let Some(target) = self.config.reindex_target.as_deref() {
            if target != self.config.index {
                targets.push(target);
            }
        }
        targets
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Send a request built by `build`, retrying transient failures per the
    /// configured policy. Non-success responses become [`Error::Index`].
    async fn send<F>(&self, operation: &'static str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let policy = self.config.retry;
        let mut retry = 0;
        loop {
            let mut request = build();
            if let Some(key) = &self.config.api_key {
                request = request.header(
                    reqwest::header::AUTHORIZATION,
                    format!("ApiKey {}", key.expose_secret()),
                );
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    Error::Index { status, body }
                }
                Err(e) => Error::Http(e),
            };

            if !error.is_transient() || retry >= policy.max_retries {
                return Err(error);
            }

            let delay = policy.delay(retry);
            warn!(operation, retry, ?delay, "search index call failed, retrying: {error}");
            metrics::index_retries().add(1, &[KeyValue::new("operation", operation)]);
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// Write one `index` action per (target, id, source) and fail if any item
    /// was rejected.
    async fn bulk_index(&self, items: Vec<(EntityId, serde_json::Value)>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for target in self.write_targets() {
            for (id, source) in &items {
                let action = serde_json::json!({"index": {"_index": target, "_id": id.to_string()}});
                body.push_str(&action.to_string());
                body.push('\n');
                body.push_str(&source.to_string());
                body.push('\n');
            }
        }

        let url = self.url("_bulk");
        let response = self
            .send("bulk", || {
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;

        let parsed: BulkResponse = response.json().await?;
        let failed = parsed.failed_ids();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialBatchFailure { failed })
        }
    }
}

impl SearchIndex for HttpSearchIndex {
    async fn fetch_status(&self, ids: &[EntityId]) -> Result<HashMap<EntityId, IndexStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query = serde_json::json!({
            "_source": ["updated", "deleted"],
            "query": {"ids": {"values": ids.iter().map(ToString::to_string).collect::<Vec<_>>()}},
            "size": ids.len(),
        });
        let url = self.url(&format!("{}/_search", self.config.index));
        let response = self
            .send("search", || self.client.post(&url).json(&query))
            .await?;

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.into_statuses())
    }

    async fn upsert(&self, documents: &[IndexDocument]) -> Result<()> {
        let items = documents.iter().map(|d| (d.id, d.to_source())).collect();
        self.bulk_index(items).await
    }

    async fn tombstone(&self, ids: &[EntityId]) -> Result<()> {
        let items = ids
            .iter()
            .map(|id| (*id, serde_json::json!({"deleted": true})))
            .collect();
        self.bulk_index(items).await
    }
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: HitSource,
}

#[derive(Debug, Default, Deserialize)]
struct HitSource {
    #[serde(default)]
    updated: Option<String>,
    #[serde(default)]
    deleted: bool,
}

impl SearchResponse {
    fn into_statuses(self) -> HashMap<EntityId, IndexStatus> {
        let mut statuses = HashMap::with_capacity(self.hits.hits.len());
        for hit in self.hits.hits {
            let Ok(id) = hit.id.parse::<EntityId>() else {
                warn!(id = %hit.id, "ignoring index document with a non-uuid id");
                continue;
            };
            let updated = hit.source.updated.as_deref().and_then(parse_version);
            statuses.insert(
                id,
                IndexStatus {
                    updated,
                    deleted: hit.source.deleted,
                },
            );
        }
        statuses
    }
}

/// Parse an `updated` marker. Timestamps without an offset are taken as UTC.
fn parse_version(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id")]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl BulkResponse {
    fn failed_ids(&self) -> Vec<EntityId> {
        if !self.errors {
            return Vec::new();
        }
        let mut failed: Vec<EntityId> = self
            .items
            .iter()
            .flat_map(|item| item.values())
            .filter(|item| item.error.is_some() || item.status >= 300)
            .filter_map(|item| item.id.parse().ok())
            .collect();
        failed.sort();
        failed.dedup();
        failed
    }
}
