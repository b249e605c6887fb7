//! # searchsync-rs
//!
//! Keeps a search index consistent with a Postgres primary store without a
//! distributed transaction.
//!
//! Producers enqueue a task in the same transaction that mutates an entity
//! ([`db::queue::enqueue`]). A periodically invoked [`reconcile::Reconciler`]
//! claims due tasks with skip-locked row locks, compares each entity's
//! primary version with the index, and upserts, skips, or drops the task.
//! Delivery is at-least-once; reconciliation is idempotent.

pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod inmem;
pub mod model;
pub mod primary;
pub mod queue;
pub mod reconcile;
pub mod telemetry;
