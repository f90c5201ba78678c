//! # Idempotency Guard
//!
//! Decides, once per participant, whether a confirmed check-in becomes a new
//! [`AttendanceEvent`] or resolves to the one that already exists.
//!
//! ## The Race This Prevents
//!
//! ```text
//! Operator A scans D100          Operator B scans D100
//!        │                              │
//!        ├── cache: absent              ├── cache: absent
//!        ├── enqueue event(A)           ├── enqueue event(B)     ← double count
//!        └── cache ← event(A)           └── cache ← event(B)     ← A's answer is now wrong
//! ```
//!
//! The check and the writes must be one indivisible step per participant.
//! Two ways to get that:
//!
//! 1. **Store primitive** (preferred): the store's `insert_if_absent` does
//!    the whole decision atomically, across processes if the store is shared.
//! 2. **Process-wide mutex** (fallback): for stores without the primitive,
//!    the guard holds a mutex across check-cache, check-queue, enqueue and
//!    cache-write. This only protects callers in *this* process.
//!
//! Either way, the critical section touches only the fast store. The ledger
//! is never called while admission is held.
//!
//! ## Fallback Ordering
//!
//! The fallback enqueues *before* writing the cache. If the process dies in
//! between, the event is queued but not cached; the next admission for that
//! participant finds it in the queue, restores the cache entry, and reports
//! `AlreadyPresent`. The opposite order could leave a cached event that is
//! never flushed.
//!
//! If the cache write fails after the enqueue succeeded, the queued event is
//! withdrawn before the error is returned. When it can't be withdrawn (the
//! flusher already took it, or the store failed again) the error says the
//! outcome is unknown; a rescan resolves it either way.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::AttendanceStore;
use crate::types::{Admission, AttendanceEvent, ParticipantId};

/// Serializes admission decisions for a store.
pub struct IdempotencyGuard {
    store: Arc<dyn AttendanceStore>,
    admission_lock: Mutex<()>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self {
            store,
            admission_lock: Mutex::new(()),
        }
    }

    /// The store this guard protects.
    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.store
    }

    /// Admits `candidate` for `participant_id` unless an event already exists.
    ///
    /// Returns `Admitted(candidate)` if this call created the event, or
    /// `AlreadyPresent(existing)` with the event every other caller sees.
    ///
    /// # Errors
    ///
    /// - `Error::PreconditionViolated` if the IDs are blank or the candidate
    ///   belongs to a different participant. Roster checks happen before this
    ///   call; reaching here with bad input is a caller bug.
    /// - `Error::StoreUnavailable` if the store failed. Nothing was admitted,
    ///   unless the message says the outcome is unknown (mutex fallback only).
    pub fn try_admit(
        &self,
        participant_id: &ParticipantId,
        candidate: AttendanceEvent,
    ) -> Result<Admission> {
        if participant_id.is_blank() {
            return Err(Error::PreconditionViolated(
                "participant id must not be empty".to_string(),
            ));
        }
        if candidate.recorded_by.is_blank() {
            return Err(Error::PreconditionViolated(
                "operator id must not be empty".to_string(),
            ));
        }
        if &candidate.participant_id != participant_id {
            return Err(Error::PreconditionViolated(format!(
                "candidate event is for '{}', not '{participant_id}'",
                candidate.participant_id
            )));
        }

        let admission = if self.store.supports_insert_if_absent() {
            self.store.insert_if_absent(&candidate)?
        } else {
            self.admit_locked(candidate)?
        };

        match &admission {
            Admission::Admitted(event) => {
                debug!(participant = %participant_id, operator = %event.recorded_by, "admitted")
            }
            Admission::AlreadyPresent(event) => {
                debug!(participant = %participant_id, recorded_by = %event.recorded_by, "already present")
            }
        }

        Ok(admission)
    }

    fn admit_locked(&self, candidate: AttendanceEvent) -> Result<Admission> {
        let _held = self
            .admission_lock
            .lock()
            .map_err(|_| Error::StoreUnavailable("admission lock poisoned".to_string()))?;

        if let Some(existing) = self.store.get(&candidate.participant_id)? {
            return Ok(Admission::AlreadyPresent(existing));
        }

        if let Some(queued) = self.store.pending_find(&candidate.participant_id)? {
            self.store.put(&queued)?;
            return Ok(Admission::AlreadyPresent(queued));
        }

        self.store.push(&candidate)?;
        if let Err(put_err) = self.store.put(&candidate) {
            return Err(self.withdraw(&candidate.participant_id, put_err));
        }
        Ok(Admission::Admitted(candidate))
    }

    /// Undoes an enqueue whose cache write failed.
    fn withdraw(&self, participant_id: &ParticipantId, cause: Error) -> Error {
        match self.store.pending_remove(participant_id) {
            Ok(true) => cause,
            Ok(false) => Error::StoreUnavailable(format!(
                "cache write failed ({cause}) after the event was already taken for flushing; \
                 check-in outcome unknown"
            )),
            Err(undo_err) => Error::StoreUnavailable(format!(
                "cache write failed ({cause}) and the queued event could not be withdrawn \
                 ({undo_err}); check-in outcome unknown"
            )),
        }
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("atomic", &self.store.supports_insert_if_absent())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
