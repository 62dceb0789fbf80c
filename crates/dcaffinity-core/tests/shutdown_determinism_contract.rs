//! Contract Test: Shutdown Determinism
//!
//! This test verifies that shutdown is deterministic and complete.
//!
//! Constraints verified:
//! - Both worker loops terminate on shutdown
//! - The store is flushed exactly once, after the loops stopped
//! - Callers waiting on a worker are released, never left hanging
//! - Probe results arriving after shutdown began are discarded
//! - A service that was never started shuts down cleanly
//!
//! If this test fails, someone has added:
//! - Worker loops that ignore the shutdown flag
//! - Waiters that outlive their worker
//! - Writes racing the final flush

mod common;

use common::*;
use dcaffinity_core::error::Error;
use dcaffinity_core::AffinityService;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn shutdown_terminates_both_workers() {
    let fixture = Fixture::new(&[("dc1", "Paris"), ("dc2", "Paris")]);
    let service = AffinityService::new(minimal_config("dc1", Some("Paris")), fixture.collaborators())
        .await
        .unwrap();
    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.is_running().await);

    let result = tokio::time::timeout(Duration::from_secs(5), service.shutdown()).await;
    assert!(result.is_ok(), "shutdown should finish within 5 seconds");
    tokio_test::assert_ok!(result.unwrap());

    assert!(!service.is_running().await);
    assert_eq!(fixture.store.flush_count(), 1, "store flushed exactly once");
}

#[tokio::test]
async fn waiting_caller_released_by_shutdown() {
    let fixture = Fixture::new(&[("dc1", "Paris"), ("dc2", "Paris")]);
    let service = Arc::new(
        AffinityService::new(minimal_config("dc1", Some("Paris")), fixture.collaborators())
            .await
            .unwrap(),
    );
    service.start().await.unwrap();
    service.force_refresh(false, true).await.unwrap();

    // The next refresh waits on a probe that only the timeout ends
    fixture.heartbeat.set("dc2", DcBehavior::Hang);
    let caller = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.force_refresh(false, true).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), service.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown must not wait on the caller");

    let released = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .expect("caller released")
        .unwrap();
    match released {
        Ok(()) | Err(Error::ShuttingDown) => {}
        Err(other) => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn late_probe_results_are_discarded() {
    let fixture = Fixture::new(&[("dc1", "Paris"), ("dc2", "Paris")]);
    let mut harness = Harness::new(&fixture, minimal_config("dc1", Some("Paris"))).await;
    harness.settle_state().await;
    harness.refresh().await;
    let before = fixture.row("dc2").await.unwrap();

    fixture.heartbeat.set("dc2", DcBehavior::Alive { delay_ms: 100 });
    let report = harness.cache.tick().await.unwrap();
    harness.cache_handle.request_shutdown();
    report.settle().await;

    let after = fixture.row("dc2").await.unwrap();
    assert_eq!(after.last_ping_at, before.last_ping_at, "result after shutdown must not be written");
}

#[tokio::test]
async fn never_started_service_shuts_down() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let service = AffinityService::new(minimal_config("dc1", Some("Paris")), fixture.collaborators())
        .await
        .unwrap();

    tokio_test::assert_ok!(service.shutdown().await);
    assert!(!service.is_running().await);
    assert_eq!(fixture.store.flush_count(), 1);
    assert_eq!(fixture.heartbeat.total_calls(), 0);
}
