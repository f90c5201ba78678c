//! # Flush Lease
//!
//! The flusher task serializes flushes and rehydrations inside one process.
//! When several processes share a store file, each has its own flusher task,
//! and that is no longer enough:
//!
//! ```text
//! Process A                          Process B
//! ─────────                          ─────────
//! drain [D1]        (queue empty)
//! append ... slow ...                read ledger        (no D1)
//!                                    snapshot queue     (no D1)
//!                                    replace cache      (D1 gone)
//!                                    confirm D1 → Admitted again
//! append done       (D1 row #1)      ... later flush    (D1 row #2)
//! ```
//!
//! The lease closes that window. Drain-and-append and rehydrate both run
//! while holding it, so for every process a batch is either still queued or
//! already in the ledger whenever the cache is rebuilt.
//!
//! ## Expiry
//!
//! The lease carries a TTL so a process that dies holding it does not wedge
//! the others. A holder whose work outlives the TTL loses its exclusivity;
//! the TTL must therefore stay well above the slowest ledger call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{run_blocking, AttendanceStore};

/// How long a lease stays valid without being released.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Pause between attempts while another process holds the lease.
const LEASE_RETRY: Duration = Duration::from_millis(25);

/// One holder's handle on the store-wide flush lease.
#[derive(Clone)]
pub struct FlushLease {
    store: Arc<dyn AttendanceStore>,
    owner: String,
    ttl: Duration,
}

impl FlushLease {
    /// Creates a handle with a fresh owner ID and the default TTL.
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self::with_ttl(store, DEFAULT_LEASE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn AttendanceStore>, ttl: Duration) -> Self {
        Self {
            store,
            owner: format!("{}-{:016x}", std::process::id(), rand::random::<u64>()),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs `work` while holding the lease, releasing it afterwards whether
    /// `work` succeeded or not.
    ///
    /// # Errors
    ///
    /// `Error::StoreUnavailable` if the lease could not be taken within one
    /// TTL, plus whatever `work` returns.
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        let result = work().await;
        self.release().await;
        result
    }

    async fn acquire(&self) -> Result<()> {
        // One full TTL plus a retry: long enough to outlast a dead holder.
        let deadline = Instant::now() + self.ttl + LEASE_RETRY;

        loop {
            let store = Arc::clone(&self.store);
            let owner = self.owner.clone();
            let ttl = self.ttl;
            if run_blocking(move || store.try_acquire_lease(&owner, ttl)).await? {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(Error::StoreUnavailable(
                    "flush lease is held by another process".to_string(),
                ));
            }
            debug!(owner = %self.owner, "flush lease busy, waiting");
            tokio::time::sleep(LEASE_RETRY).await;
        }
    }

    async fn release(&self) {
        let store = Arc::clone(&self.store);
        let owner = self.owner.clone();
        if let Err(e) = run_blocking(move || store.release_lease(&owner)).await {
            // The lease runs out on its own.
            warn!(owner = %self.owner, error = %e, "could not release flush lease");
        }
    }
}

impl std::fmt::Debug for FlushLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushLease")
            .field("owner", &self.owner)
            .field("ttl", &self.ttl)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
