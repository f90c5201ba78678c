//! # Fast Store: Cache + Pending Queue
//!
//! The fast store holds the two shared mutable structures of the system:
//!
//! ```text
//!            participant_id ──► AttendanceEvent
//!  ┌──────────────────────────────────────────────┐
//!  │ Fast Cache   "is this participant present?"  │  ◄── check / confirm
//!  └──────────────────────────────────────────────┘
//!  ┌──────────────────────────────────────────────┐
//!  │ Pending Queue  [e1, e2, e3, ...]  (FIFO)     │  ──► Batch Flusher ──► Ledger
//!  └──────────────────────────────────────────────┘
//! ```
//!
//! Both live behind one [`AttendanceStore`] trait so the same core runs on a
//! single process ([`MemoryStore`]) or on several processes sharing a file
//! ([`SqliteStore`]).
//!
//! ## Concurrency Contract
//!
//! - `put` followed by `get` on the same store returns the written value
//! - `drain_all` is atomic: no event is returned by two concurrent drains
//! - `insert_if_absent`, when supported, decides admission for one participant
//!   atomically across the cache *and* the queue
//!
//! Stores without the atomic primitive still work; the
//! [`IdempotencyGuard`](crate::guard::IdempotencyGuard) then serializes
//! admissions with a process-wide mutex instead.
//!
//! ## Flush Lease
//!
//! Every process sharing a store runs its own flusher task. The store-wide
//! flush lease ([`crate::lease::FlushLease`]) makes a drain-and-append and a
//! rehydration mutually exclusive across all of them: whoever holds it is the
//! only one moving events between queue, ledger and cache.
//!
//! ## Rust Pattern: Sync Trait, Async Callers
//!
//! Store calls are short, blocking I/O. The trait is synchronous and async
//! callers go through [`run_blocking`], which moves the call onto tokio's
//! blocking pool so a slow disk never stalls the runtime's worker threads.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Admission, AttendanceEvent, ParticipantId};

/// Shared fast store: the Fast Cache and the Pending Queue.
pub trait AttendanceStore: Send + Sync + 'static {
    // =========================================================================
    // Fast Cache
    // =========================================================================

    /// Returns the cached event for a participant.
    fn get(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>>;

    /// Writes a cache entry, overwriting any existing one.
    fn put(&self, event: &AttendanceEvent) -> Result<()>;

    fn contains(&self, participant_id: &ParticipantId) -> Result<bool> {
        Ok(self.get(participant_id)?.is_some())
    }

    /// Removes every cache entry. The queue is untouched.
    fn clear(&self) -> Result<()>;

    /// Replaces the whole cache with `events` in one step.
    ///
    /// Readers see either the old mapping or the new one, never a mix.
    fn replace_all(&self, events: Vec<AttendanceEvent>) -> Result<()>;

    fn cached_count(&self) -> Result<usize>;

    /// Snapshot of every cache entry, in no particular order.
    fn entries(&self) -> Result<Vec<AttendanceEvent>>;

    // =========================================================================
    // Pending Queue
    // =========================================================================

    /// Appends an event to the back of the queue.
    fn push(&self, event: &AttendanceEvent) -> Result<()>;

    /// Removes and returns every queued event, oldest first.
    fn drain_all(&self) -> Result<Vec<AttendanceEvent>>;

    fn pending_len(&self) -> Result<usize>;

    /// Snapshot of the queue, oldest first. The queue is not modified.
    fn pending_entries(&self) -> Result<Vec<AttendanceEvent>>;

    /// Returns the queued event for a participant, if one is queued.
    fn pending_find(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>>;

    fn pending_contains(&self, participant_id: &ParticipantId) -> Result<bool> {
        Ok(self.pending_find(participant_id)?.is_some())
    }

    /// Removes a participant's queued event. Returns `false` if none was
    /// queued (it may already have been drained).
    fn pending_remove(&self, participant_id: &ParticipantId) -> Result<bool>;

    /// Puts a drained batch back at the *front* of the queue, preserving its
    /// order ahead of anything admitted since the drain.
    fn requeue_front(&self, events: Vec<AttendanceEvent>) -> Result<()>;

    // =========================================================================
    // Flush Lease
    // =========================================================================

    /// Takes or renews the store-wide flush lease for `owner`, valid for
    /// `ttl`. Returns `false` while another owner holds an unexpired lease.
    ///
    /// The default grants every request, which is only correct when a single
    /// flusher task uses the store.
    fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let _ = (owner, ttl);
        Ok(true)
    }

    /// Gives the lease up if `owner` still holds it.
    fn release_lease(&self, owner: &str) -> Result<()> {
        let _ = owner;
        Ok(())
    }

    // =========================================================================
    // Atomic Admission
    // =========================================================================

    /// Whether [`insert_if_absent`](Self::insert_if_absent) is implemented.
    fn supports_insert_if_absent(&self) -> bool {
        false
    }

    /// Admits `event` unless its participant already has a cached or queued
    /// event, as one atomic step.
    ///
    /// - Cached: returns `AlreadyPresent(cached)`.
    /// - Queued but missing from the cache: restores the cache entry and
    ///   returns `AlreadyPresent(queued)`.
    /// - Neither: writes the event to both and returns `Admitted(event)`.
    fn insert_if_absent(&self, event: &AttendanceEvent) -> Result<Admission> {
        let _ = event;
        Err(Error::PreconditionViolated(
            "store does not support insert_if_absent".to_string(),
        ))
    }
}

/// Runs a blocking store call on tokio's blocking pool.
///
/// A panicked or cancelled task is reported as `StoreUnavailable`, the same
/// as any other store failure, so the admission path fails closed.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::StoreUnavailable(format!("store task failed: {e}")))?
}
