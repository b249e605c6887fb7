//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or invalid.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod retry;

pub use retry::RetryPolicy;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub search: SearchConfig,
    /// Maximum number of tasks claimed per reconcile tick.
    pub sync_task_limit: i64,
    /// Tick interval for the bundled `serve` loop.
    pub poll_interval: Duration,
    /// Table holding the tracked entities (`id`, `updated`, `deleted` columns).
    pub primary_table: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Everything the HTTP index client needs, passed to it explicitly.
#[derive(Debug)]
pub struct SearchConfig {
    pub url: String,
    pub index: String,
    pub api_key: Option<SecretString>,
    /// Second index that receives every write while a reindex is in progress.
    pub reindex_target: Option<String>,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let sync_task_limit: i64 = parsed_var("SYNC_TASK_LIMIT", 1000)?;
        if sync_task_limit <= 0 {
            return Err(Error::Config(format!(
                "SYNC_TASK_LIMIT must be greater than zero, got {sync_task_limit}"
            )));
        }

        let primary_table = optional_var("PRIMARY_TABLE").unwrap_or_else(|| "annotation".into());
        validate_identifier(&primary_table)?;

        let retry = RetryPolicy {
            max_retries: parsed_var("INDEX_MAX_RETRIES", 2)?,
            interval_start: Duration::from_millis(parsed_var("INDEX_RETRY_START_MS", 200)?),
            interval_step: Duration::from_millis(parsed_var("INDEX_RETRY_STEP_MS", 200)?),
            interval_max: Duration::from_millis(parsed_var("INDEX_RETRY_MAX_MS", 600)?),
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            search: SearchConfig {
                url: required_var("SEARCH_URL")?,
                index: optional_var("SEARCH_INDEX").unwrap_or_else(|| "annotation".into()),
                api_key: optional_var("SEARCH_API_KEY").map(SecretString::from),
                reindex_target: optional_var("SEARCH_REINDEX_TARGET"),
                retry,
            },
            sync_task_limit,
            poll_interval: Duration::from_secs(parsed_var("POLL_INTERVAL_SECS", 60)?),
            primary_table,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and underscores.
///
/// The primary table name is spliced into SQL, so nothing else gets through.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(*p)) {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name: {name:?}")))
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}
