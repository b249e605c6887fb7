//! Metric instrument factories for searchsync-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"searchsync-rs"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("searchsync-rs")
}

/// Counter: tasks inserted by producers.
/// Labels: `tag`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("searchsync.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: tasks locked by a claim.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("searchsync.tasks.claimed")
        .with_description("Number of tasks claimed by reconcile ticks")
        .build()
}

/// Counter: claimed tasks by outcome.
/// Labels: `disposition` ("obsolete" | "needs_index" | "already_consistent" | "quarantined").
pub fn task_dispositions() -> Counter<u64> {
    meter()
        .u64_counter("searchsync.tasks.dispositions")
        .with_description("Claimed tasks by reconciliation outcome")
        .build()
}

/// Counter: documents written to the search index.
/// Labels: `operation` ("upsert" | "tombstone").
pub fn index_writes() -> Counter<u64> {
    meter()
        .u64_counter("searchsync.index.writes")
        .with_description("Documents written to the search index")
        .build()
}

/// Counter: retried search index calls.
/// Labels: `operation`.
pub fn index_retries() -> Counter<u64> {
    meter()
        .u64_counter("searchsync.index.retries")
        .with_description("Search index calls retried after a transient failure")
        .build()
}

/// Histogram: reconcile tick duration in milliseconds.
/// Labels: `result` ("ok" | "error").
pub fn tick_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("searchsync.tick.duration_ms")
        .with_description("Reconcile tick duration in milliseconds")
        .with_unit("ms")
        .build()
}
