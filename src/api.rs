//! # Async API for Rollcall
//!
//! [`Attendance`] is the handle request handlers hold. It ties together the
//! roster, the fast store, the idempotency guard and the flusher task, and
//! exposes the operator-facing controls:
//!
//! | Call | Does |
//! |------|------|
//! | `check` | Is this participant checked in? By whom, when? |
//! | `confirm` | Record a check-in (at most once per participant) |
//! | `flush_now` | Push queued check-ins to the ledger now |
//! | `rehydrate_now` | Rebuild the cache from the ledger |
//! | `stats` | Cache and queue sizes |
//! | `summary` | Totals per recording operator |
//!
//! ## Request Path
//!
//! ```text
//!  confirm(D100, OC7)
//!        │
//!        ├─ roster lookup ───────────── miss ──► Error::UnknownParticipant
//!        │
//!        ├─ spawn_blocking ─► IdempotencyGuard::try_admit
//!        │                     (cache + queue only, never the ledger)
//!        │
//!        ├─ queue ≥ threshold? ─► nudge flusher task (non-blocking)
//!        │
//!        └─► Admitted(event) | AlreadyPresent(original event)
//! ```
//!
//! The ledger is only ever touched by the flusher task, so a slow ledger
//! never shows up in check-in latency.
//!
//! ## Rust Concepts
//!
//! - **`Arc<dyn Trait>`**: store, ledger and roster are injected trait objects
//! - **`spawn_blocking`**: store calls are blocking I/O, kept off the async workers
//! - **Clone handle**: every clone talks to the same flusher task

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flusher::{spawn_flusher, BatchFlusher, FlushMetricsSnapshot, FlusherHandle};
use crate::guard::IdempotencyGuard;
use crate::ledger::{Ledger, SqliteLedger};
use crate::rehydrate::{RehydrateReport, Rehydrator};
use crate::roster::{Roster, StaticRoster};
use crate::store::{run_blocking, AttendanceStore, SqliteStore};
use crate::types::{
    Admission, AttendanceEvent, AttendanceSummary, CheckOutcome, OperatorId, ParticipantId,
    ParticipantProfile, Stats, VenueClock,
};

// =============================================================================
// Attendance - The Main Async Handle
// =============================================================================

/// The main async handle for check-ins.
///
/// # Thread Safety
///
/// `Attendance` is `Clone`, `Send` and `Sync`. Share it across tasks freely;
/// all clones use the same store and flusher task.
///
/// # Example
///
/// ```rust,no_run
/// use rollcall::{Attendance, Config};
///
/// #[tokio::main]
/// async fn main() -> rollcall::Result<()> {
///     let attendance = Attendance::open(&Config::from_env()?).await?;
///
///     let outcome = attendance.check("D100").await?;
///     if !outcome.already_present {
///         let admission = attendance.confirm("D100", "OC7").await?;
///         println!("checked in at {}", admission.event().recorded_at);
///     }
///
///     attendance.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Attendance {
    guard: Arc<IdempotencyGuard>,
    store: Arc<dyn AttendanceStore>,
    roster: Arc<dyn Roster>,
    clock: VenueClock,
    batch_threshold: usize,
    flusher: FlusherHandle,
}

impl Attendance {
    /// Wires up the core from injected collaborators and starts the flusher.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime (the flusher task is spawned
    /// here).
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        ledger: Arc<dyn Ledger>,
        roster: Arc<dyn Roster>,
        config: &Config,
    ) -> Result<Self> {
        let clock = config.clock()?;
        let flusher_config = config.flusher_config();

        let flusher = spawn_flusher(
            BatchFlusher::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                flusher_config.failure_policy,
            ),
            Rehydrator::new(Arc::clone(&store), ledger),
            flusher_config,
        );

        Ok(Self {
            guard: Arc::new(IdempotencyGuard::new(Arc::clone(&store))),
            store,
            roster,
            clock,
            batch_threshold: config.batch_threshold,
            flusher,
        })
    }

    /// Opens the file-backed deployment described by `config`: SQLite fast
    /// store, SQLite ledger, JSON roster.
    pub async fn open(config: &Config) -> Result<Self> {
        let roster = StaticRoster::from_json_file(&config.roster_path)?;
        let store = SqliteStore::open(&config.store_path)?;
        let ledger = SqliteLedger::open(&config.ledger_path)?;

        info!(
            store = %config.store_path.display(),
            ledger = %config.ledger_path.display(),
            participants = roster.len(),
            threshold = config.batch_threshold,
            interval_secs = config.flush_interval.as_secs(),
            policy = %config.failure_policy,
            "opened attendance"
        );

        Self::new(Arc::new(store), Arc::new(ledger), Arc::new(roster), config)
    }

    // =========================================================================
    // Check-in
    // =========================================================================

    /// Returns the participant's roster profile.
    ///
    /// # Errors
    ///
    /// - `Error::PreconditionViolated` for a blank ID
    /// - `Error::UnknownParticipant` if the ID is not on the roster
    pub fn profile(&self, participant_id: &ParticipantId) -> Result<ParticipantProfile> {
        if participant_id.is_blank() {
            return Err(Error::PreconditionViolated(
                "participant id must not be empty".to_string(),
            ));
        }
        self.roster
            .lookup(participant_id)
            .ok_or_else(|| Error::UnknownParticipant {
                participant_id: participant_id.to_string(),
            })
    }

    /// Looks up whether a participant is already checked in.
    ///
    /// A participant whose event is still queued counts as checked in.
    pub async fn check(&self, participant_id: impl Into<ParticipantId>) -> Result<CheckOutcome> {
        let participant_id = participant_id.into();
        self.profile(&participant_id)?;

        let store = Arc::clone(&self.store);
        let event = run_blocking(move || match store.get(&participant_id)? {
            Some(event) => Ok(Some(event)),
            None => store.pending_find(&participant_id),
        })
        .await?;

        Ok(CheckOutcome::from_event(event))
    }

    /// Records a check-in for `participant_id` by `operator`.
    ///
    /// The first confirmation for a participant creates the event. Every
    /// later one (including concurrent ones from other operators) returns
    /// `AlreadyPresent` with that same event.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownParticipant`: not on the roster, nothing recorded
    /// - `Error::PreconditionViolated`: blank participant or operator ID
    /// - `Error::StoreUnavailable`: nothing recorded; safe to retry
    pub async fn confirm(
        &self,
        participant_id: impl Into<ParticipantId>,
        operator: impl Into<OperatorId>,
    ) -> Result<Admission> {
        let participant_id = participant_id.into();
        let profile = self.profile(&participant_id)?;

        let candidate = AttendanceEvent::new(
            participant_id.clone(),
            &profile,
            operator.into(),
            self.clock.now(),
        );

        let guard = Arc::clone(&self.guard);
        let (admission, pending) = run_blocking(move || {
            let admission = guard.try_admit(&participant_id, candidate)?;
            let pending = if admission.is_admitted() {
                guard.store().pending_len()?
            } else {
                0
            };
            Ok((admission, pending))
        })
        .await?;

        if pending >= self.batch_threshold {
            self.flusher.notify_threshold();
        }

        Ok(admission)
    }

    // =========================================================================
    // Operational Controls
    // =========================================================================

    /// Flushes the Pending Queue to the ledger now.
    pub async fn flush_now(&self) -> Result<usize> {
        self.flusher.flush().await
    }

    /// Rebuilds the cache from the ledger.
    pub async fn rehydrate_now(&self) -> Result<RehydrateReport> {
        self.flusher.rehydrate().await
    }

    /// Cache and queue sizes.
    pub async fn stats(&self) -> Result<Stats> {
        let store = Arc::clone(&self.store);
        run_blocking(move || {
            Ok(Stats {
                cached_count: store.cached_count()?,
                pending_count: store.pending_len()?,
            })
        })
        .await
    }

    /// Attendance totals against the roster, per recording operator.
    pub async fn summary(&self) -> Result<AttendanceSummary> {
        let store = Arc::clone(&self.store);
        let entries = run_blocking(move || store.entries()).await?;
        Ok(AttendanceSummary::from_events(
            &entries,
            self.roster.registered_count(),
        ))
    }

    pub fn flush_metrics(&self) -> FlushMetricsSnapshot {
        self.flusher.metrics()
    }

    /// Flushes what is left and stops the flusher task.
    ///
    /// Returns the number of events written by the final flush. After this,
    /// `flush_now` and `rehydrate_now` fail with `Error::ShutDown`; check-ins
    /// still land in the store and are flushed by the next process.
    pub async fn shutdown(&self) -> Result<usize> {
        let flushed = self.flusher.shutdown().await?;
        info!(flushed, "attendance shut down");
        Ok(flushed)
    }
}

// =============================================================================
// Tests
// =============================================================================
