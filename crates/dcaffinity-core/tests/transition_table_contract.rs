//! Contract Test: Transition Table
//!
//! This test verifies that the affinity state only moves along the table.
//!
//! Constraints verified:
//! - Every (from, to) pair is accepted or rejected exactly as tabled
//! - A rejected transition writes nothing
//! - A same-state transition succeeds and writes nothing
//! - Committed transitions are published to state watchers
//!
//! If this test fails, someone has:
//! - Added a shortcut edge to the table
//! - Written the state outside the transition lock
//! - Stopped publishing state changes

mod common;

use common::*;
use dcaffinity_core::error::Error;
use dcaffinity_core::traits::{AffinityState, CacheStore};
use dcaffinity_core::worker::is_valid_transition;
use dcaffinity_core::worker::state_machine::transition;
use dcaffinity_core::AffinityService;
use std::time::Duration;
use tokio_stream::StreamExt;
use AffinityState::*;

fn tabled(from: AffinityState, to: AffinityState) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (_, Legacy) => true,
        (Legacy, NoDcList) => true,
        (NoDcList | OffSite | NoDcsAlive, SiteAffinitized) => true,
        (OffSite | NoDcsAlive | SiteAffinitized, OffSite | NoDcsAlive) => true,
        _ => false,
    }
}

#[test]
fn every_pair_matches_the_table() {
    for from in AffinityState::ALL {
        for to in AffinityState::ALL {
            assert_eq!(
                is_valid_transition(from, to),
                tabled(from, to),
                "{} -> {}",
                from,
                to
            );
        }
    }
}

#[tokio::test]
async fn rejected_transition_writes_nothing() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let ctx = fixture.context(minimal_config("dc1", Some("Paris"))).await;

    fixture.store.set_state(OffSite).await.unwrap();
    let writes = fixture.store.state_writes();

    let result = transition(&ctx, NoDcList).await;
    assert!(matches!(
        result,
        Err(Error::InvalidTransition { from: OffSite, to: NoDcList })
    ));
    assert_eq!(ctx.current_state().await.unwrap(), OffSite);
    assert_eq!(fixture.store.state_writes(), writes, "rejected transition must not write");
}

#[tokio::test]
async fn same_state_transition_is_a_no_op() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let ctx = fixture.context(minimal_config("dc1", Some("Paris"))).await;

    fixture.store.set_state(SiteAffinitized).await.unwrap();
    let writes = fixture.store.state_writes();

    assert!(!transition(&ctx, SiteAffinitized).await.unwrap());
    assert_eq!(fixture.store.state_writes(), writes);
}

#[tokio::test]
async fn legacy_is_reachable_from_every_state() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let ctx = fixture.context(minimal_config("dc1", Some("Paris"))).await;

    for from in AffinityState::ALL {
        fixture.store.set_state(from).await.unwrap();
        tokio_test::assert_ok!(transition(&ctx, Legacy).await);
        assert_eq!(ctx.current_state().await.unwrap(), Legacy);
    }
}

#[tokio::test]
async fn unsupported_domain_stays_legacy() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    fixture.directory.set_supports_affinity(false);
    let mut harness = Harness::new(&fixture, minimal_config("dc1", Some("Paris"))).await;

    assert_eq!(harness.settle_state().await, Legacy);
    assert_eq!(fixture.store.state_writes(), 0);
    assert_eq!(fixture.heartbeat.total_calls(), 0, "inactive agent must not probe");
}

#[tokio::test]
async fn watchers_see_committed_transitions() {
    let fixture = Fixture::new(&[("dc1", "Paris")]);
    let service = AffinityService::new(minimal_config("dc1", Some("Paris")), fixture.collaborators())
        .await
        .expect("service builds");

    let mut states = service.watch_state();
    assert_eq!(states.next().await, Some(Legacy));

    service.start().await.unwrap();

    let mut seen = Vec::new();
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(state) = states.next().await {
            seen.push(state);
            if state == SiteAffinitized {
                break;
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "state machine should reach SiteAffinitized, saw {:?}", seen);
    assert_eq!(seen.last(), Some(&SiteAffinitized));
    assert_eq!(service.current_state().await.unwrap(), SiteAffinitized);

    service.shutdown().await.unwrap();
}
