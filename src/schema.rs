//! # SQLite Schema for Rollcall
//!
//! This module defines the tables behind the SQLite-backed store and ledger,
//! and handles connection setup.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  attendance_cache            pending_queue             ledger_rows      │
//! │  ┌──────────────────────┐    ┌──────────────────────┐  ┌─────────────┐  │
//! │  │ participant_id (PK)  │    │ seq (PK, ordered)    │  │ row_id (PK) │  │
//! │  │ display_name         │    │ participant_id (UQ)  │  │ six TEXT    │  │
//! │  │ group_name           │    │ ...same fields...    │  │ cells       │  │
//! │  │ subgroup             │    └──────────────────────┘  └─────────────┘  │
//! │  │ recorded_by          │                                               │
//! │  │ recorded_at          │     rollcall_metadata                         │
//! │  └──────────────────────┘     ┌─────────────┐   flush_lease             │
//! │                               │ key (PK)    │   ┌─────────────────┐     │
//! │                               │ value       │   │ id = 1 (PK)     │     │
//! │                               └─────────────┘   │ owner           │     │
//! │                                                 │ expires_at_ms   │     │
//! │                                                 └─────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache and queue form the fast store. `ledger_rows` is a local stand-in
//! for the external sheet; it is usually a separate file, but every database
//! opened through [`Database`] gets the full schema so one file can host both.
//!
//! ## Why a Primary Key on the Cache?
//!
//! `participant_id` being the primary key of `attendance_cache` is what makes
//! "at most one event per participant" hold even across processes: a second
//! insert for the same key fails at the storage layer, whatever the callers
//! did.
//!
//! The ledger has no such constraint. It is append-only and may legitimately
//! contain duplicates (a hand edit, a retried batch); rehydration resolves
//! them.

use std::time::Duration;

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 2;

/// How long a connection waits on another writer before giving up.
///
/// Two processes sharing a store file serialize admissions through
/// `BEGIN IMMEDIATE`; the loser waits here instead of failing straight away.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The fast cache: one row per checked-in participant.
///
/// `group` is a reserved word in SQL, hence `group_name`.
const CREATE_ATTENDANCE_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS attendance_cache (
    participant_id TEXT PRIMARY KEY,
    display_name   TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    subgroup       TEXT,
    recorded_by    TEXT NOT NULL,
    recorded_at    TEXT NOT NULL
)
"#;

/// Events waiting to be flushed, in admission order.
///
/// # Ordering
///
/// `seq` gives FIFO order. A failed batch is re-inserted with `seq` values
/// below the current minimum so it drains first next time, which keeps the
/// original admission order intact.
///
/// # Uniqueness
///
/// A participant is queued at most once: the admission path only enqueues
/// after finding no cache entry, and the UNIQUE constraint backs that up.
const CREATE_PENDING_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS pending_queue (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    participant_id TEXT NOT NULL UNIQUE,
    display_name   TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    subgroup       TEXT,
    recorded_by    TEXT NOT NULL,
    recorded_at    TEXT NOT NULL
)
"#;

/// Append-only ledger rows, stored as raw cells.
///
/// Cells are plain TEXT with no validation. Rows are parsed (and possibly
/// rejected) on read, same as rows from a hand-edited sheet.
const CREATE_LEDGER_ROWS: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_rows (
    row_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    participant_id TEXT NOT NULL,
    display_name   TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    subgroup       TEXT NOT NULL,
    recorded_by    TEXT NOT NULL,
    recorded_at    TEXT NOT NULL
)
"#;

/// The store-wide flush lease: at most one row, owned by one flusher.
///
/// `expires_at_ms` is Unix time in milliseconds. An expired row counts as
/// free, so a process that dies holding the lease blocks others only until
/// it runs out.
const CREATE_FLUSH_LEASE: &str = r#"
CREATE TABLE IF NOT EXISTS flush_lease (
    id            INTEGER PRIMARY KEY CHECK (id = 1),
    owner         TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS rollcall_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the rollcall schema applied.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Holding a `Database` proves the pragmas ran and the schema version was
/// checked. Stores take ownership of the connection with
/// [`into_connection`](Self::into_connection) once setup is done.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use rollcall::Database;
    ///
    /// let db = Database::open("rollcall-cache.db")?;
    /// # Ok::<(), rollcall::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are private to their connection, so two stores
    /// built this way never share state.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper, returning the configured connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL lets the flusher drain while admissions keep reading.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_ATTENDANCE_CACHE)?;
        self.conn.execute_batch(CREATE_PENDING_QUEUE)?;
        self.conn.execute_batch(CREATE_LEDGER_ROWS)?;
        self.conn.execute_batch(CREATE_FLUSH_LEASE)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let stored = self.conn.query_row(
            "SELECT value FROM rollcall_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        );

        let existing: Option<i32> = match stored {
            Ok(value) => Some(value.parse().map_err(|_| {
                Error::Schema(format!("unreadable schema version '{value}'"))
            })?),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT OR IGNORE INTO rollcall_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, this build requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(conn: &Connection) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, attendance_cache, pending_queue, ledger_rows, flush_lease
        assert_eq!(table_count(&db.conn), 5);
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().expect("should create db");

        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM rollcall_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("should query version");

        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("old.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE rollcall_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update version");
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_unreadable_version_is_an_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("blob.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE rollcall_metadata SET value = x'01' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update version");
        }

        // A version that can't be read is not the same as no version at all.
        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));
    }

    #[test]
    fn test_garbled_version_is_a_schema_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("garbled.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE rollcall_metadata SET value = 'two' WHERE key = 'schema_version'",
                    [],
                )
                .expect("should update version");
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db.conn), 5);
    }

    #[test]
    fn test_cache_rejects_second_row_for_participant() {
        let conn = Database::open_in_memory().unwrap().into_connection();
        let insert = "INSERT INTO attendance_cache
                      (participant_id, display_name, group_name, subgroup, recorded_by, recorded_at)
                      VALUES ('D1', 'A', 'G', NULL, 'OC1', '2025-01-01 10:00:00')";

        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
