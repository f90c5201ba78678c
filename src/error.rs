//! # Error Handling for Rollcall
//!
//! This module defines the error types used throughout the crate. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures short and lets callers match on the cases they care about.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]`, so `?` converts library errors
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Rejected input | `UnknownParticipant`, `PreconditionViolated` | Show message, do not retry |
//! | Transient | `StoreUnavailable`, `Ledger`, `LedgerWriteFailed` | Ask the operator to retry |
//! | Data | `InvalidRecord`, `Json` | Skip the record, log it |
//! | Setup | `Schema`, `Config`, `Sqlite`, `Io`, `ShutDown` | Fix deployment |
//!
//! Note that "already checked in" is *not* an error. It is the
//! [`Admission::AlreadyPresent`](crate::types::Admission::AlreadyPresent)
//! result of a successful call.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in rollcall operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Rejected Input
    // =========================================================================

    /// The identifier is not on the roster.
    ///
    /// Raised by the public handle before anything reaches the admission path.
    /// The scan is rejected; nothing is written anywhere.
    #[error("participant '{participant_id}' not found")]
    UnknownParticipant {
        /// The identifier that was scanned or typed.
        participant_id: String,
    },

    /// An admission was attempted with inputs that can never be valid.
    ///
    /// # When This Happens
    ///
    /// - Empty participant or operator identifier
    /// - `try_admit` called with a candidate event for a different participant
    /// - A store asked for an atomic primitive it does not implement
    ///
    /// These indicate a caller bug, not a runtime condition.
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    // =========================================================================
    // Transient Errors (Caller may retry)
    // =========================================================================

    /// The fast store (cache or pending queue) could not be reached.
    ///
    /// # Fail Closed
    ///
    /// When this is returned from an admission, nothing was admitted. Asking
    /// the operator to scan again is always safe because admission is
    /// idempotent.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A call against the ledger failed (network, rate limit, I/O).
    #[error("ledger error: {0}")]
    Ledger(String),

    /// A drained batch could not be appended to the ledger.
    ///
    /// Whether the batch went back into the pending queue depends on the
    /// configured [`FailurePolicy`](crate::flusher::FailurePolicy).
    #[error("ledger write failed for {count} events: {reason}")]
    LedgerWriteFailed {
        /// Number of events in the failed batch.
        count: usize,
        /// Underlying ledger error message.
        reason: String,
    },

    // =========================================================================
    // Data Errors
    // =========================================================================

    /// A ledger row, wire record, or timestamp failed validation.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// JSON encoding or decoding failed (roster file, cache wire format).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Setup Errors
    // =========================================================================

    /// The on-disk schema does not match what this build expects.
    #[error("schema error: {0}")]
    Schema(String),

    /// A configuration value could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// SQLite operation failed outside of the admission path.
    ///
    /// Store implementations convert their own SQLite failures into
    /// [`Error::StoreUnavailable`] so the admission path reports a single,
    /// retryable condition. This variant covers schema setup and the
    /// file-backed ledger.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File system error (roster loading).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The background flusher has stopped; flush requests can no longer run.
    #[error("flusher has shut down")]
    ShutDown,
}

impl Error {
    /// Returns true if repeating the same call later may succeed.
    ///
    /// Admission is idempotent, so retrying a `confirm` after a retryable
    /// error can never double-count a participant.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Ledger(_) | Error::LedgerWriteFailed { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
