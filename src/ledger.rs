//! # Ledger Client
//!
//! The ledger is the slow, authoritative, append-only record of attendance.
//! In production it is a shared sheet behind a rate-limited network API; the
//! core only needs two calls from it:
//!
//! | Call | Used by | Frequency |
//! |------|---------|-----------|
//! | `append_rows` | Batch Flusher | once per batch |
//! | `read_all` | Rehydrator | on operator request |
//!
//! ## Rust Pattern: async-trait
//!
//! Ledger calls are network I/O, so the trait is async. `#[async_trait]`
//! boxes the returned futures, which keeps the trait object-safe: the flusher
//! holds an `Arc<dyn Ledger>` and never knows which backend it talks to.
//!
//! ## Implementations
//!
//! - [`MemoryLedger`]: in-process, with failure injection and artificial
//!   latency for tests and the stress binary
//! - [`SqliteLedger`]: a local file standing in for the sheet

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::schema::Database;
use crate::store::run_blocking;
use crate::types::{LedgerRow, LEDGER_COLUMNS};

/// Append-only authoritative store of attendance rows.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Appends rows in order, as one call.
    ///
    /// Either all rows are appended or the call fails. Implementations
    /// backed by a non-transactional API should document what a failure
    /// can leave behind.
    async fn append_rows(&self, rows: &[LedgerRow]) -> Result<()>;

    /// Returns every data row, in append order.
    ///
    /// Implementations may include a header row; callers skip it.
    async fn read_all(&self) -> Result<Vec<LedgerRow>>;
}

// =============================================================================
// MemoryLedger
// =============================================================================

/// Ledger held in memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<LedgerRow>>,
    fail_next: AtomicUsize,
    append_calls: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call, to imitate a slow network ledger.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Makes the next `n` append calls fail with `Error::Ledger`.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of all rows, in append order.
    pub fn rows(&self) -> Vec<LedgerRow> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    /// Number of `append_rows` calls that reached this ledger, failed or not.
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    /// Appends a row directly, as a person editing the sheet would.
    pub fn insert_manual(&self, row: LedgerRow) -> Result<()> {
        self.lock()?.push(row);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<LedgerRow>>> {
        self.rows
            .lock()
            .map_err(|_| Error::Ledger("memory ledger lock poisoned".to_string()))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn append_rows(&self, rows: &[LedgerRow]) -> Result<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Ledger("injected append failure".to_string()));
        }

        self.lock()?.extend_from_slice(rows);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LedgerRow>> {
        self.simulate_latency().await;
        Ok(self.lock()?.clone())
    }
}

// =============================================================================
// SqliteLedger
// =============================================================================

/// Ledger stored in the `ledger_rows` table of a SQLite file.
///
/// Each `append_rows` call is one transaction, so a failed append leaves
/// nothing behind.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_connection(Database::open(path)?.into_connection()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(
            Database::open_in_memory()?.into_connection(),
        ))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn append_blocking(conn: &Mutex<Connection>, rows: &[LedgerRow]) -> Result<()> {
        let mut conn = conn
            .lock()
            .map_err(|_| Error::Ledger("sqlite ledger lock poisoned".to_string()))?;
        let tx = conn.transaction().map_err(ledger_error)?;

        for row in rows {
            let cells = row.cells();
            if cells.len() != LEDGER_COLUMNS.len() {
                return Err(Error::Ledger(format!(
                    "row has {} cells, expected {}",
                    cells.len(),
                    LEDGER_COLUMNS.len()
                )));
            }
            tx.execute(
                "INSERT INTO ledger_rows
                 (participant_id, display_name, group_name, subgroup, recorded_by, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![cells[0], cells[1], cells[2], cells[3], cells[4], cells[5]],
            )
            .map_err(ledger_error)?;
        }

        tx.commit().map_err(ledger_error)
    }

    fn read_blocking(conn: &Mutex<Connection>) -> Result<Vec<LedgerRow>> {
        let conn = conn
            .lock()
            .map_err(|_| Error::Ledger("sqlite ledger lock poisoned".to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT participant_id, display_name, group_name, subgroup, recorded_by, recorded_at
                 FROM ledger_rows ORDER BY row_id",
            )
            .map_err(ledger_error)?;

        let rows = stmt
            .query_map([], |row| {
                (0..LEDGER_COLUMNS.len())
                    .map(|i| row.get::<_, String>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map(LedgerRow::new)
            })
            .map_err(ledger_error)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(ledger_error)
    }
}

fn ledger_error(e: rusqlite::Error) -> Error {
    Error::Ledger(e.to_string())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn append_rows(&self, rows: &[LedgerRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let rows = rows.to_vec();
        run_blocking(move || Self::append_blocking(&conn, &rows))
            .await
            .map_err(|e| match e {
                Error::StoreUnavailable(reason) => Error::Ledger(reason),
                other => other,
            })
    }

    async fn read_all(&self) -> Result<Vec<LedgerRow>> {
        let conn = Arc::clone(&self.conn);
        run_blocking(move || Self::read_blocking(&conn))
            .await
            .map_err(|e| match e {
                Error::StoreUnavailable(reason) => Error::Ledger(reason),
                other => other,
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
