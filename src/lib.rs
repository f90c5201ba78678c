//! # Rollcall - Write-Behind Attendance Cache
//!
//! Rollcall records event check-ins: an operator scans a badge, sees who it
//! belongs to, confirms, and the participant is marked present exactly once.
//!
//! - **Fast answers**: "already checked in?" comes from a local store, not the
//!   slow ledger
//! - **At most once**: racing scans of the same badge produce one event
//! - **Write-behind**: confirmed check-ins are batched to the ledger in the
//!   background
//! - **Resync**: the cache can be rebuilt from the ledger on demand
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Attendance (async API)                     │
//! │            check · confirm · flush_now · rehydrate_now          │
//! └──────────────┬──────────────────────────────────┬───────────────┘
//!                │ spawn_blocking                   │ mpsc
//!                ▼                                  ▼
//! ┌──────────────────────────────┐   ┌─────────────────────────────┐
//! │      Idempotency Guard       │   │        Flusher Task         │
//! │   insert_if_absent / mutex   │   │  threshold · tick · manual  │
//! └──────────────┬───────────────┘   │  BatchFlusher · Rehydrator  │
//!                ▼                   └──────┬───────────────┬──────┘
//! ┌──────────────────────────────┐          │ drain         │ append / read_all
//! │   Fast Store                 │◄─────────┘               ▼
//! │   cache  participant → event │            ┌─────────────────────────┐
//! │   queue  [e1, e2, ...]       │            │   Ledger (slow, remote) │
//! └──────────────────────────────┘            └─────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **At most once**: a participant gets at most one event, and every
//!    caller sees that same event
//! 2. **Never un-present**: once the cache shows a participant as present,
//!    no flush failure or rehydration shows them as absent
//! 3. **Short critical section**: admission touches only the fast store,
//!    never the ledger
//! 4. **Ordered batches**: a flushed batch keeps queue order
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and `Result` alias
//! - [`types`]: Domain types (participant, event, ledger row, results)
//! - [`config`]: Environment-driven configuration
//! - [`schema`]: SQLite DDL and database initialization
//! - [`roster`]: Read-only participant lookup
//! - [`store`]: Fast Cache + Pending Queue
//! - [`guard`]: Idempotent admission
//! - [`ledger`]: Slow ledger client
//! - [`flusher`]: Batch flusher and its background task
//! - [`lease`]: Cross-process flush lease
//! - [`rehydrate`]: Cache rebuild from the ledger
//! - [`api`]: Async API (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for rollcall operations.
pub mod error;

/// Domain types: identifiers, attendance events, ledger rows and results.
///
/// Uses the newtype pattern so participant and operator IDs can't be mixed up.
pub mod types;

/// Configuration loaded from `ROLLCALL_*` environment variables.
pub mod config;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// The participant roster.
pub mod roster;

/// The fast store: Fast Cache and Pending Queue behind one trait.
///
/// [`MemoryStore`](store::MemoryStore) for a single process,
/// [`SqliteStore`](store::SqliteStore) for processes sharing a file.
pub mod store;

/// At-most-once admission of check-ins.
pub mod guard;

/// The slow, authoritative, append-only ledger.
pub mod ledger;

/// Batch flusher.
///
/// Drains the Pending Queue into the ledger on three triggers (manual,
/// queue threshold, periodic tick), all funnelled through one background
/// task so flushes never overlap.
pub mod flusher;

/// Store-wide lease that keeps flushes and rehydrations from overlapping
/// across processes.
pub mod lease;

/// Rebuilds the Fast Cache from a full ledger read.
pub mod rehydrate;

/// Async API for rollcall.
///
/// The main entry point is [`Attendance`](api::Attendance).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Attendance;
pub use config::Config;
pub use error::{Error, Result};
pub use flusher::{
    spawn_flusher, BatchFlusher, FailurePolicy, FlushMetricsSnapshot, FlusherConfig, FlusherHandle,
};
pub use guard::IdempotencyGuard;
pub use lease::FlushLease;
pub use ledger::{Ledger, MemoryLedger, SqliteLedger};
pub use rehydrate::{RehydrateReport, Rehydrator};
pub use roster::{Roster, StaticRoster};
pub use schema::Database;
pub use store::{AttendanceStore, MemoryStore, SqliteStore};

pub use types::{
    Admission, AttendanceEvent, AttendanceSummary, CheckOutcome, LedgerRow, OperatorId,
    ParticipantId, ParticipantProfile, RecordedAt, Stats, VenueClock,
};
