//! In-memory implementations of the queue, primary store and search index.
//!
//! They follow the same contracts as the Postgres and HTTP backends (claims
//! skip locked tasks, producer writes appear only on commit, index writes are
//! idempotent) so reconciliation can be exercised without external services.
//! The store and index can be switched to fail, to exercise error paths.

mod index;
mod primary;
mod queue;

pub use index::MemorySearchIndex;
pub use primary::MemoryPrimaryStore;
pub use queue::{DeadLetter, MemoryClaim, MemoryProducerTx, MemoryQueue};

use std::sync::{Mutex, MutexGuard};

/// Lock ignoring poisoning: the guarded state stays consistent because every
/// critical section is panic-free.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
