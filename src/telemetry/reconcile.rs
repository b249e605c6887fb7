//! Reconcile span helpers.

use tracing::Span;

/// Start a span for one reconcile tick.
///
/// `tasks.claimed` is declared empty and filled in by [`record_claimed`].
pub fn start_tick_span(limit: i64) -> Span {
    tracing::info_span!(
        "reconcile.tick",
        "tasks.limit" = limit,
        "tasks.claimed" = tracing::field::Empty,
    )
}

pub fn record_claimed(span: &Span, claimed: usize) {
    span.record("tasks.claimed", claimed as u64);
}

/// Start a span for a batch index write.
pub fn start_batch_span(entities: usize) -> Span {
    tracing::info_span!("index.batch", "index.entities" = entities as u64)
}
