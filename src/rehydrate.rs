//! # Rehydrator
//!
//! Rebuilds the Fast Cache from a full read of the ledger.
//!
//! ```text
//! Ledger rows ──► parse ──► first row per participant ──┐
//!                   │                                   ├──► replace_all(cache)
//!                   └─ malformed: skip + warn           │
//! Pending Queue (snapshot) ─── overlay if missing ──────┘
//! ```
//!
//! ## Resolution Rules
//!
//! - **Duplicates**: if the ledger holds several rows for one participant,
//!   the earliest row wins. Later rows are counted and ignored.
//! - **Malformed rows**: wrong column count, blank ID or operator, or an
//!   unparseable timestamp. Skipped with a `warn!`; rehydration carries on.
//! - **Queued events**: an event still waiting in the Pending Queue has no
//!   ledger row yet. It is overlaid onto the rebuilt mapping so a participant
//!   who is checked in never disappears from the cache.
//!
//! The Pending Queue itself is never modified.
//!
//! ## Serialization With Flushes
//!
//! If a rehydration read the ledger between a flush's drain and its append,
//! the in-flight events would be in neither source and would vanish from the
//! cache. Rehydration therefore holds the store-wide
//! [`FlushLease`](crate::lease::FlushLease) for its whole run, the same lease
//! every flush holds from drain to append, in every process sharing the
//! store. Within one process it also runs on the flusher task.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::lease::FlushLease;
use crate::ledger::Ledger;
use crate::store::{run_blocking, AttendanceStore};
use crate::types::{AttendanceEvent, ParticipantId};

/// What a rehydration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RehydrateReport {
    /// Data rows read from the ledger (header rows excluded).
    pub rows_read: usize,

    /// Participants restored from ledger rows.
    pub restored: usize,

    /// Later rows for a participant that already had one.
    pub duplicates_skipped: usize,

    /// Rows that failed to parse.
    pub malformed_skipped: usize,

    /// Queued events added because the ledger did not have them yet.
    pub pending_overlaid: usize,
}

impl RehydrateReport {
    /// Total cache entries after rehydration.
    pub fn cached(&self) -> usize {
        self.restored + self.pending_overlaid
    }
}

/// Rebuilds a store's cache from a ledger.
pub struct Rehydrator {
    store: Arc<dyn AttendanceStore>,
    ledger: Arc<dyn Ledger>,
    lease: FlushLease,
}

impl Rehydrator {
    pub fn new(store: Arc<dyn AttendanceStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            lease: FlushLease::new(Arc::clone(&store)),
            store,
            ledger,
        }
    }

    /// Reads the whole ledger and replaces the cache with what it says.
    ///
    /// # Errors
    ///
    /// - `Error::Ledger` if the ledger cannot be read. The cache is untouched.
    /// - `Error::StoreUnavailable` if the store fails or the flush lease
    ///   could not be taken.
    pub async fn rehydrate(&self) -> Result<RehydrateReport> {
        self.lease.run(|| self.rehydrate_leased()).await
    }

    async fn rehydrate_leased(&self) -> Result<RehydrateReport> {
        let rows = self.ledger.read_all().await?;

        let mut report = RehydrateReport::default();
        let mut mapping: HashMap<ParticipantId, AttendanceEvent> = HashMap::new();

        for (index, row) in rows.iter().enumerate() {
            if row.is_header() {
                continue;
            }
            report.rows_read += 1;

            match AttendanceEvent::from_row(row) {
                Ok(event) => match mapping.entry(event.participant_id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(event);
                    }
                    Entry::Occupied(_) => report.duplicates_skipped += 1,
                },
                Err(e) => {
                    warn!(row = index, error = %e, "skipping malformed ledger row");
                    report.malformed_skipped += 1;
                }
            }
        }
        report.restored = mapping.len();

        let store = Arc::clone(&self.store);
        report.pending_overlaid = run_blocking(move || {
            let mut overlaid = 0;
            for queued in store.pending_entries()? {
                if let Entry::Vacant(slot) = mapping.entry(queued.participant_id.clone()) {
                    slot.insert(queued);
                    overlaid += 1;
                }
            }
            store.replace_all(mapping.into_values().collect())?;

            // Admissions that landed after the snapshot above were wiped by
            // replace_all; put them back.
            for queued in store.pending_entries()? {
                if !store.contains(&queued.participant_id)? {
                    store.put(&queued)?;
                    overlaid += 1;
                }
            }
            Ok(overlaid)
        })
        .await?;

        info!(
            rows_read = report.rows_read,
            restored = report.restored,
            duplicates_skipped = report.duplicates_skipped,
            malformed_skipped = report.malformed_skipped,
            pending_overlaid = report.pending_overlaid,
            "rehydrated cache from ledger"
        );

        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::store::test_support::event;
    use crate::store::MemoryStore;
    use crate::types::LedgerRow;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryLedger>, Rehydrator) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let rehydrator = Rehydrator::new(store.clone(), ledger.clone());
        (store, ledger, rehydrator)
    }

    #[tokio::test]
    async fn test_first_row_wins() {
        let (store, ledger, rehydrator) = setup();
        let first = event("D1", "OC1", "2025-03-14 09:00:00");
        let later = event("D1", "OC2", "2025-03-14 10:00:00");

        ledger.insert_manual(LedgerRow::header()).unwrap();
        ledger.insert_manual(first.to_row()).unwrap();
        ledger.insert_manual(later.to_row()).unwrap();

        let report = rehydrator.rehydrate().await.unwrap();

        assert_eq!(report.rows_read, 2);
        assert_eq!(report.restored, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(store.get(&first.participant_id).unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let (store, ledger, rehydrator) = setup();
        let good = event("D2", "OC1", "2025-03-14 09:00:00");

        ledger
            .insert_manual(LedgerRow::new(vec!["D9".into(), "truncated".into()]))
            .unwrap();
        let mut bad_time = event("D3", "OC1", "2025-03-14 09:00:00").to_row().into_cells();
        bad_time[5] = "14/03/2025".into();
        ledger.insert_manual(LedgerRow::new(bad_time)).unwrap();
        ledger.insert_manual(good.to_row()).unwrap();

        let report = rehydrator.rehydrate().await.unwrap();

        assert_eq!(report.malformed_skipped, 2);
        assert_eq!(report.restored, 1);
        assert_eq!(store.cached_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replaces_stale_cache_entries() {
        let (store, ledger, rehydrator) = setup();
        let stale = event("D4", "OC1", "2025-03-14 09:00:00");
        store.put(&stale).unwrap();

        let report = rehydrator.rehydrate().await.unwrap();

        assert_eq!(report.cached(), 0);
        assert!(store.get(&stale.participant_id).unwrap().is_none());
        assert!(ledger.rows().is_empty());
    }

    #[tokio::test]
    async fn test_queued_events_stay_visible() {
        let (store, _ledger, rehydrator) = setup();
        let queued = event("D5", "OC1", "2025-03-14 09:00:00");
        store.insert_if_absent(&queued).unwrap();

        let report = rehydrator.rehydrate().await.unwrap();

        assert_eq!(report.pending_overlaid, 1);
        assert_eq!(store.get(&queued.participant_id).unwrap(), Some(queued));
        assert_eq!(store.pending_len().unwrap(), 1, "queue must be untouched");
    }

    #[tokio::test]
    async fn test_waits_for_flush_lease() {
        let (store, _ledger, rehydrator) = setup();
        let queued = event("D7", "OC1", "2025-03-14 09:00:00");
        store.insert_if_absent(&queued).unwrap();

        // Another process is mid-flush.
        assert!(store
            .try_acquire_lease("other-process", std::time::Duration::from_millis(150))
            .unwrap());

        let started = std::time::Instant::now();
        rehydrator.rehydrate().await.unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
        assert_eq!(store.get(&queued.participant_id).unwrap(), Some(queued));
    }

    #[tokio::test]
    async fn test_ledger_failure_leaves_cache_alone() {
        struct Broken;

        #[async_trait::async_trait]
        impl Ledger for Broken {
            async fn append_rows(&self, _rows: &[crate::types::LedgerRow]) -> Result<()> {
                Ok(())
            }
            async fn read_all(&self) -> Result<Vec<crate::types::LedgerRow>> {
                Err(crate::Error::Ledger("rate limited".into()))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let kept = event("D6", "OC1", "2025-03-14 09:00:00");
        store.put(&kept).unwrap();

        let rehydrator = Rehydrator::new(store.clone(), Arc::new(Broken));
        assert!(rehydrator.rehydrate().await.is_err());
        assert_eq!(store.get(&kept.participant_id).unwrap(), Some(kept));
    }
}
