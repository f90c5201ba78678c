//! # SQLite-Backed Fast Store
//!
//! Cache and queue are two tables in one SQLite file (see [`crate::schema`]).
//! Several processes can open the same file; SQLite's write lock is the
//! cross-process mutex.
//!
//! ## Atomic Admission
//!
//! `insert_if_absent` runs as one `BEGIN IMMEDIATE` transaction:
//!
//! ```text
//! BEGIN IMMEDIATE            -- take the write lock up front
//!   SELECT cache row         -- present?  → AlreadyPresent
//!   SELECT queue row         -- queued?   → restore cache, AlreadyPresent
//!   INSERT queue row
//!   INSERT cache row
//! COMMIT
//! ```
//!
//! A deferred transaction would take only a read lock for the SELECTs, and
//! two processes could both see "absent" before either upgraded to write.
//! `IMMEDIATE` takes the write lock before the first read, so the second
//! process waits (up to the busy timeout) and then sees the first one's row.
//!
//! ## Flush Lease
//!
//! The lease is the single row of `flush_lease`: an owner and an expiry in
//! Unix milliseconds. It is read and written inside `BEGIN IMMEDIATE`, so two
//! processes can never both see it free.
//!
//! ## Error Mapping
//!
//! Every SQLite failure surfaces as [`Error::StoreUnavailable`]: from the
//! caller's point of view the store could not answer, and the operation can be
//! retried.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::types::{Admission, AttendanceEvent, OperatorId, ParticipantId, RecordedAt};

use super::AttendanceStore;

// =============================================================================
// SQL
// =============================================================================

const SELECT_CACHE: &str = "SELECT participant_id, display_name, group_name, subgroup, recorded_by, recorded_at
     FROM attendance_cache";

const SELECT_QUEUE: &str = "SELECT participant_id, display_name, group_name, subgroup, recorded_by, recorded_at
     FROM pending_queue";

const UPSERT_CACHE: &str = "INSERT OR REPLACE INTO attendance_cache
     (participant_id, display_name, group_name, subgroup, recorded_by, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_QUEUE: &str = "INSERT INTO pending_queue
     (participant_id, display_name, group_name, subgroup, recorded_by, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Requeue with an explicit `seq` so the batch lands ahead of newer events.
/// `OR REPLACE` lets the older event win if the participant was queued again
/// in the meantime.
const REQUEUE: &str = "INSERT OR REPLACE INTO pending_queue
     (seq, participant_id, display_name, group_name, subgroup, recorded_by, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

// =============================================================================
// SqliteStore
// =============================================================================

/// Fast store persisted in a SQLite file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self::from_connection(db.into_connection()))
    }

    /// Creates a private in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_connection(db.into_connection()))
    }

    /// Wraps a connection that already has the rollcall schema.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("sqlite store lock poisoned".to_string()))?;
        f(&mut conn).map_err(|e| Error::StoreUnavailable(e.to_string()))
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceEvent> {
    let recorded_at: String = row.get(5)?;
    let recorded_at = RecordedAt::parse(recorded_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(AttendanceEvent {
        participant_id: ParticipantId::new(row.get::<_, String>(0)?),
        display_name: row.get(1)?,
        group: row.get(2)?,
        subgroup: row.get(3)?,
        recorded_by: OperatorId::new(row.get::<_, String>(4)?),
        recorded_at,
    })
}

fn write_event(conn: &Connection, sql: &str, event: &AttendanceEvent) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            event.participant_id.as_str(),
            event.display_name,
            event.group,
            event.subgroup,
            event.recorded_by.as_str(),
            event.recorded_at.as_str(),
        ],
    )
}

fn find_cached(conn: &Connection, pid: &ParticipantId) -> rusqlite::Result<Option<AttendanceEvent>> {
    conn.query_row(
        &format!("{SELECT_CACHE} WHERE participant_id = ?1"),
        [pid.as_str()],
        event_from_row,
    )
    .optional()
}

fn find_queued(conn: &Connection, pid: &ParticipantId) -> rusqlite::Result<Option<AttendanceEvent>> {
    conn.query_row(
        &format!("{SELECT_QUEUE} WHERE participant_id = ?1"),
        [pid.as_str()],
        event_from_row,
    )
    .optional()
}

fn count(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(n as usize)
}

impl AttendanceStore for SqliteStore {
    fn get(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>> {
        self.with_conn(|conn| find_cached(conn, participant_id))
    }

    fn put(&self, event: &AttendanceEvent) -> Result<()> {
        self.with_conn(|conn| write_event(conn, UPSERT_CACHE, event).map(|_| ()))
    }

    fn clear(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM attendance_cache", []).map(|_| ()))
    }

    fn replace_all(&self, events: Vec<AttendanceEvent>) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM attendance_cache", [])?;
            for event in &events {
                write_event(&tx, UPSERT_CACHE, event)?;
            }
            tx.commit()
        })
    }

    fn cached_count(&self) -> Result<usize> {
        self.with_conn(|conn| count(conn, "attendance_cache"))
    }

    fn entries(&self) -> Result<Vec<AttendanceEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(SELECT_CACHE)?;
            let rows = stmt.query_map([], event_from_row)?;
            rows.collect()
        })
    }

    fn push(&self, event: &AttendanceEvent) -> Result<()> {
        self.with_conn(|conn| write_event(conn, INSERT_QUEUE, event).map(|_| ()))
    }

    fn drain_all(&self) -> Result<Vec<AttendanceEvent>> {
        let drained = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let events = {
                let mut stmt = tx.prepare(&format!("{SELECT_QUEUE} ORDER BY seq"))?;
                let rows = stmt.query_map([], event_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.execute("DELETE FROM pending_queue", [])?;
            tx.commit()?;
            Ok(events)
        })?;

        if !drained.is_empty() {
            debug!(count = drained.len(), "drained pending queue");
        }
        Ok(drained)
    }

    fn pending_len(&self) -> Result<usize> {
        self.with_conn(|conn| count(conn, "pending_queue"))
    }

    fn pending_entries(&self) -> Result<Vec<AttendanceEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_QUEUE} ORDER BY seq"))?;
            let rows = stmt.query_map([], event_from_row)?;
            rows.collect()
        })
    }

    fn pending_find(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>> {
        self.with_conn(|conn| find_queued(conn, participant_id))
    }

    fn pending_remove(&self, participant_id: &ParticipantId) -> Result<bool> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pending_queue WHERE participant_id = ?1",
                [participant_id.as_str()],
            )
            .map(|removed| removed > 0)
        })
    }

    fn requeue_front(&self, events: Vec<AttendanceEvent>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let min_seq: i64 =
                tx.query_row("SELECT COALESCE(MIN(seq), 1) FROM pending_queue", [], |row| {
                    row.get(0)
                })?;
            let base = min_seq - events.len() as i64;

            for (i, event) in events.iter().enumerate() {
                tx.execute(
                    REQUEUE,
                    params![
                        base + i as i64,
                        event.participant_id.as_str(),
                        event.display_name,
                        event.group,
                        event.subgroup,
                        event.recorded_by.as_str(),
                        event.recorded_at.as_str(),
                    ],
                )?;
            }
            tx.commit()
        })
    }

    fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let holder: Option<(String, i64)> = tx
                .query_row(
                    "SELECT owner, expires_at_ms FROM flush_lease WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let free = match &holder {
                None => true,
                Some((held_by, until)) => held_by == owner || *until <= now,
            };
            if free {
                tx.execute(
                    "INSERT OR REPLACE INTO flush_lease (id, owner, expires_at_ms) VALUES (1, ?1, ?2)",
                    params![owner, expires_at],
                )?;
            }
            tx.commit()?;
            Ok(free)
        })
    }

    fn release_lease(&self, owner: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM flush_lease WHERE id = 1 AND owner = ?1", [owner])
                .map(|_| ())
        })
    }

    fn supports_insert_if_absent(&self) -> bool {
        true
    }

    fn insert_if_absent(&self, event: &AttendanceEvent) -> Result<Admission> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let admission = if let Some(existing) = find_cached(&tx, &event.participant_id)? {
                Admission::AlreadyPresent(existing)
            } else if let Some(queued) = find_queued(&tx, &event.participant_id)? {
                write_event(&tx, UPSERT_CACHE, &queued)?;
                Admission::AlreadyPresent(queued)
            } else {
                write_event(&tx, INSERT_QUEUE, event)?;
                write_event(&tx, UPSERT_CACHE, event)?;
                Admission::Admitted(event.clone())
            };

            tx.commit()?;
            Ok(admission)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
