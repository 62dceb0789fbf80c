//! Contract Test: Disable Against In-Flight Ticks
//!
//! This test verifies that turning affinity off is final even when a
//! worker tick is already running.
//!
//! Constraints verified:
//! - A state machine tick in progress cannot move the agent out of Legacy
//!   after disable returns
//! - A cache tick whose discovery was in flight does not repopulate the
//!   purged cache
//!
//! If this test fails, someone has:
//! - Read the HA mode or the state outside the transition lock
//! - Let the cache worker persist discovery results without re-checking
//!   that affinity is still on

mod common;

use common::*;
use dcaffinity_core::traits::{AffinityState, CacheStore, HaMode};
use dcaffinity_core::AffinityService;
use std::sync::Arc;
use std::time::Duration;

async fn armed(fixture: &Fixture) -> (AffinityService, Harness) {
    let mut config = minimal_config("dc1", Some("Paris"));
    config.probe.timeout_ms = 2_000;
    let service = AffinityService::new(config, fixture.collaborators())
        .await
        .expect("service builds");
    let mut harness = Harness::over(Arc::clone(service.context()));
    assert_eq!(harness.settle_state().await, AffinityState::SiteAffinitized);
    (service, harness)
}

#[tokio::test]
async fn disable_sticks_against_running_state_tick() {
    let fixture = Fixture::new(&[("dc1", "Paris"), ("dc2", "Paris")]);
    let (service, harness) = armed(&fixture).await;

    fixture.store.delay_ha_mode_reads(100);
    let mut state_machine = harness.state_machine;
    let tick = tokio::spawn(async move { state_machine.tick().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    service.disable_affinity().await.unwrap();
    let outcome = tick.await.unwrap().unwrap();
    assert_ne!(outcome.to, AffinityState::NoDcList);

    fixture.store.delay_ha_mode_reads(0);
    assert_eq!(fixture.store.get_ha_mode().await.unwrap(), Some(HaMode::Legacy));
    assert_eq!(service.current_state().await.unwrap(), AffinityState::Legacy);
}

#[tokio::test]
async fn tick_seeing_disable_is_skipped() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let (service, mut harness) = armed(&fixture).await;

    service.disable_affinity().await.unwrap();
    let outcome = harness.state_machine.tick().await.unwrap();
    assert!(outcome.skipped);
    assert_eq!(service.current_state().await.unwrap(), AffinityState::Legacy);
}

#[tokio::test]
async fn disable_during_discovery_keeps_cache_empty() {
    let fixture = Fixture::new(&[("dc1", "Paris"), ("dc2", "Paris"), ("dc3", "Berlin")]);
    let (service, harness) = armed(&fixture).await;
    assert!(!service.enumerate_cached_dcs().await.unwrap().is_empty());

    let gate = fixture.discovery.hold();
    harness.ctx.request_refresh();
    let mut cache = harness.cache;
    let tick = tokio::spawn(async move {
        let report = cache.tick().await.unwrap();
        let skipped = report.skipped;
        report.settle().await;
        skipped
    });

    fixture.discovery.entered().await;
    service.disable_affinity().await.unwrap();
    gate.notify_one();

    assert!(tick.await.unwrap(), "tick must drop the discovery result");
    assert!(service.enumerate_cached_dcs().await.unwrap().is_empty());
    assert_eq!(service.current_state().await.unwrap(), AffinityState::Legacy);
}
