//! Batch flushing: manual, threshold and periodic triggers, plus failure
//! handling.

mod common;

use std::time::Duration;

use common::{eventually, memory_attendance, numbered_roster, participant, quiet_config, roster};
use rollcall::{AttendanceEvent, AttendanceStore, Config, Error, FailurePolicy};

#[tokio::test]
async fn test_flush_with_empty_queue_is_a_no_op() {
    let harness = memory_attendance(roster(), &quiet_config());
    harness.attendance.confirm("D1", "OC1").await.unwrap();
    harness.attendance.flush_now().await.unwrap();

    let before = harness.attendance.stats().await.unwrap();
    let calls = harness.ledger.append_calls();

    assert_eq!(harness.attendance.flush_now().await.unwrap(), 0);
    assert_eq!(harness.attendance.stats().await.unwrap(), before);
    assert_eq!(harness.ledger.append_calls(), calls);
}

#[tokio::test]
async fn test_flush_keeps_confirmation_order() {
    let harness = memory_attendance(roster(), &quiet_config());
    for id in ["D100", "D1", "D2"] {
        harness.attendance.confirm(id, "OC1").await.unwrap();
    }

    assert_eq!(harness.attendance.flush_now().await.unwrap(), 3);

    let flushed: Vec<String> = harness
        .ledger
        .rows()
        .iter()
        .map(|row| row.cells()[0].clone())
        .collect();
    assert_eq!(flushed, ["D100", "D1", "D2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threshold_triggers_background_flush() {
    let config = Config {
        batch_threshold: 5,
        ..quiet_config()
    };
    let harness = memory_attendance(numbered_roster(12), &config);

    for i in 0..4 {
        harness.attendance.confirm(participant(i), "OC1").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.ledger.rows().is_empty(), "below threshold, nothing flushed");

    harness.attendance.confirm(participant(4), "OC1").await.unwrap();

    let ledger = harness.ledger.clone();
    eventually(Duration::from_secs(5), Duration::from_millis(10), || {
        (ledger.rows().len() == 5).then_some(())
    })
    .await;
    assert_eq!(harness.store.pending_len().unwrap(), 0);
    assert_eq!(harness.attendance.flush_metrics().batches_flushed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_periodic_tick_flushes_below_threshold() {
    let config = Config {
        flush_interval: Duration::from_secs(1),
        ..quiet_config()
    };
    let harness = memory_attendance(roster(), &config);

    harness.attendance.confirm("D1", "OC1").await.unwrap();
    harness.attendance.confirm("D2", "OC2").await.unwrap();

    let ledger = harness.ledger.clone();
    eventually(Duration::from_secs(5), Duration::from_millis(50), || {
        (ledger.rows().len() == 2).then_some(())
    })
    .await;
    assert_eq!(harness.store.pending_len().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_flush_requeues_without_duplicates() {
    let harness = memory_attendance(roster(), &quiet_config());
    harness.attendance.confirm("D1", "OC1").await.unwrap();
    harness.attendance.confirm("D2", "OC1").await.unwrap();

    harness.ledger.fail_next_appends(1);
    assert!(matches!(
        harness.attendance.flush_now().await,
        Err(Error::LedgerWriteFailed { count: 2, .. })
    ));

    // Still present, still queued, and duplicates are still refused.
    let stats = harness.attendance.stats().await.unwrap();
    assert_eq!(stats.pending_count, 2);
    assert_eq!(stats.cached_count, 2);
    assert!(harness.attendance.check("D1").await.unwrap().already_present);
    assert!(!harness.attendance.confirm("D1", "OC9").await.unwrap().is_admitted());

    harness.attendance.confirm("D100", "OC1").await.unwrap();
    assert_eq!(harness.attendance.flush_now().await.unwrap(), 3);

    let ids: Vec<String> = harness
        .ledger
        .rows()
        .iter()
        .map(|row| row.cells()[0].clone())
        .collect();
    assert_eq!(ids, ["D1", "D2", "D100"]);

    let metrics = harness.attendance.flush_metrics();
    assert_eq!(metrics.failed_batches, 1);
    assert_eq!(metrics.events_requeued, 2);
    assert_eq!(metrics.events_flushed, 3);
}

#[tokio::test]
async fn test_drop_policy_discards_batch_but_keeps_cache() {
    let config = Config {
        failure_policy: FailurePolicy::Drop,
        ..quiet_config()
    };
    let harness = memory_attendance(roster(), &config);
    harness.attendance.confirm("D1", "OC1").await.unwrap();

    harness.ledger.fail_next_appends(1);
    assert!(harness.attendance.flush_now().await.is_err());

    let stats = harness.attendance.stats().await.unwrap();
    assert_eq!(stats.pending_count, 0);
    assert_eq!(stats.cached_count, 1);
    assert_eq!(harness.attendance.flush_metrics().events_dropped, 1);
    assert!(harness.ledger.rows().is_empty());
}

#[tokio::test]
async fn test_shutdown_flushes_remaining_events() {
    let harness = memory_attendance(roster(), &quiet_config());
    harness.attendance.confirm("D1", "OC1").await.unwrap();

    assert_eq!(harness.attendance.shutdown().await.unwrap(), 1);
    assert_eq!(harness.ledger.rows().len(), 1);

    assert!(matches!(
        harness.attendance.flush_now().await,
        Err(Error::ShutDown)
    ));

    // Check-ins still land in the store after shutdown.
    assert!(harness.attendance.confirm("D2", "OC1").await.unwrap().is_admitted());
    let queued: Vec<AttendanceEvent> = harness.store.pending_entries().unwrap();
    assert_eq!(queued.len(), 1);
}
