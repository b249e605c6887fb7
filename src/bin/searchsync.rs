//! searchsync CLI: run the reconciler and administer the task queue.

use anyhow::Context as _;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use searchsync_rs::config::Config;
use searchsync_rs::db::{Db, PgPrimaryStore, PgTaskQueue, queue};
use searchsync_rs::index::{BatchIndexer, HttpSearchIndex};
use searchsync_rs::model::EntityId;
use searchsync_rs::queue::SYNC_ENTITY_TAG;
use searchsync_rs::reconcile::Reconciler;
use searchsync_rs::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "searchsync", about = "Synchronize the search index from the primary store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Run a single reconcile tick
    Tick,
    /// Run reconcile ticks on a fixed interval until interrupted
    Serve,
    /// Queue entities for synchronization
    Enqueue {
        /// Entity IDs (UUIDs)
        #[arg(required = true)]
        ids: Vec<EntityId>,
        /// Task tag
        #[arg(long, default_value = SYNC_ENTITY_TAG)]
        tag: String,
        /// Delay before the tasks become claimable
        #[arg(long, default_value_t = 0)]
        delay_secs: i64,
    },
    /// Queue every entity updated within a date range
    ReindexDate {
        /// Range start (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: DateTime<Utc>,
        /// Range end, inclusive (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: DateTime<Utc>,
    },
    /// Index entities immediately, bypassing the queue
    Index {
        /// Entity IDs (UUIDs)
        #[arg(required = true)]
        ids: Vec<EntityId>,
    },
    /// Show queue depth
    Status,
}

/// Everything a command might need, built once from [`Config`].
struct App {
    db: Db,
    primary: Arc<PgPrimaryStore>,
    index: Arc<HttpSearchIndex>,
    sync_task_limit: i64,
    poll_interval: std::time::Duration,
}

impl App {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let db = Db::connect(config.database_url.expose_secret()).await?;
        db.migrate().await?;
        let primary = Arc::new(db.primary_store(&config.primary_table)?);
        let index = Arc::new(HttpSearchIndex::new(config.search)?);
        Ok(Self {
            db,
            primary,
            index,
            sync_task_limit: config.sync_task_limit,
            poll_interval: config.poll_interval,
        })
    }

    fn reconciler(&self) -> Reconciler<PgTaskQueue, PgPrimaryStore, HttpSearchIndex> {
        Reconciler::new(
            self.db.task_queue(),
            Arc::clone(&self.primary),
            Arc::clone(&self.index),
            self.sync_task_limit,
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "searchsync".to_string(),
        log_level: config.log_level.clone(),
    })?;

    // Connecting applies pending migrations.
    let app = App::connect(config).await?;

    match cli.command {
        Command::Migrate => {
            println!("Migrations applied.");
            Ok(())
        }
        Command::Tick => cmd_tick(&app).await,
        Command::Serve => cmd_serve(&app).await,
        Command::Enqueue {
            ids,
            tag,
            delay_secs,
        } => cmd_enqueue(&app, ids, tag, delay_secs).await,
        Command::ReindexDate { start, end } => {
            let count = app.db.reindex_date(app.primary.as_ref(), start, end).await?;
            println!("Queued {count} entities updated between {start} and {end}.");
            Ok(())
        }
        Command::Index { ids } => cmd_index(&app, ids).await,
        Command::Status => {
            let stats = app.db.task_queue().stats().await?;
            println!("Tasks:  {}", stats.total);
            println!("Due:    {}", stats.due);
            Ok(())
        }
    }
}

async fn cmd_tick(app: &App) -> anyhow::Result<()> {
    let reconciler = app.reconciler();
    let report = reconciler.reconcile().await?;
    println!(
        "Claimed {}: {} obsolete, {} already consistent, {} needs-index ({} entities indexed), {} quarantined",
        report.claimed,
        report.obsolete,
        report.already_consistent,
        report.needs_index,
        report.indexed_entities,
        report.quarantined,
    );
    Ok(())
}

async fn cmd_serve(app: &App) -> anyhow::Result<()> {
    let reconciler = app.reconciler();
    let interval = app.poll_interval;

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.notify_one();
    });

    info!(?interval, limit = reconciler.limit(), "reconciler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("reconciler shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                // A failed tick leaves its tasks claimable for the next one.
                if let Err(e) = reconciler.reconcile().await {
                    error!("reconcile tick failed: {e}");
                }
            }
        }
    }
}

async fn cmd_enqueue(
    app: &App,
    ids: Vec<EntityId>,
    tag: String,
    delay_secs: i64,
) -> anyhow::Result<()> {
    let scheduled_at = (delay_secs > 0).then(|| Utc::now() + Duration::seconds(delay_secs));

    let mut tx = app.db.begin().await?;
    let task_ids = queue::enqueue_batch(&mut *tx, &ids, &tag, scheduled_at).await?;
    tx.commit().await?;

    println!("Queued {} task(s) with tag {tag}.", task_ids.len());
    Ok(())
}

async fn cmd_index(app: &App, ids: Vec<EntityId>) -> anyhow::Result<()> {
    let indexer = BatchIndexer::new(Arc::clone(&app.primary), Arc::clone(&app.index));
    let outcome = indexer.index(&ids).await?;
    println!(
        "Upserted {}, tombstoned {}.",
        outcome.upserted.len(),
        outcome.tombstoned.len()
    );
    Ok(())
}

fn parse_date(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date {raw:?}, expected RFC 3339 or YYYY-MM-DD"))?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .context("invalid time of day")
}
