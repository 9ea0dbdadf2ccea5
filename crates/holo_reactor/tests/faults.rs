//! Disruptions the reactor must ride out: cut backfills, missing peers and
//! blueprints that must never be applied.

mod common;

use std::time::Duration;

use common::{apply, start_cluster, Inserter};
use holo_reactor::blueprint::letter_domain;
use holo_reactor::{ActivityKind, Blueprint, ReactorError, Role};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_backfill_resumes() {
    let cluster = start_cluster(2);
    let router = cluster.router(0).expect("router").clone();
    let mut inserter = Inserter::new();

    apply(&cluster, "p,n").await;
    inserter.insert(&router, 200).await;

    // Peer 0 serves the first backfill and drops it after two chunks.
    cluster.inject_backfill_fault(0, 2).expect("fault");
    apply(&cluster, "p,s").await;
    inserter.insert(&router, 20).await;

    let stats = cluster.stats();
    assert!(stats[&1].backfill_failures >= 1, "the cut session was not observed: {:?}", stats[&1]);
    assert!(stats[&1].backfills_completed >= 1);
    inserter.validate_replica(cluster.node(1).expect("node").store.as_ref());
    inserter.validate(&router).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_peer_stalls_and_is_reported() {
    let cluster = start_cluster(3);
    let router = cluster.router(0).expect("router").clone();
    let mut inserter = Inserter::new();

    apply(&cluster, "p,s,n").await;
    inserter.insert(&router, 40).await;

    cluster.disconnect(2);
    let blueprint = cluster.compile_blueprint("n,p,s").expect("compile");
    cluster.set_all_blueprints(&blueprint);
    let err = cluster
        .wait_until_blueprint_satisfied(&blueprint, Duration::from_millis(800))
        .await
        .expect_err("peer 2 is unreachable");
    let ReactorError::WaitTimeout { mismatches, .. } = err else {
        panic!("unexpected error: {err}");
    };
    let stalled = mismatches
        .iter()
        .find(|m| m.peer == 1)
        .expect("peer 1 cannot become primary");
    assert_eq!(stalled.expected, Role::Primary);
    let reason = stalled.blocked.as_deref().unwrap_or_default();
    assert!(reason.contains("peer 2"), "stall reason should name the missing peer: {reason:?}");
    assert!(cluster.primary_conflicts().is_empty());

    cluster.reconnect(2);
    cluster
        .wait_until_blueprint_satisfied(&blueprint, common::SATISFY_TIMEOUT)
        .await
        .expect("converges once the peer is back");
    let router = cluster.router(1).expect("router").clone();
    inserter.insert(&router, 20).await;
    inserter.validate(&router).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_blueprints_are_ignored() {
    let cluster = start_cluster(2);
    let accepted = apply(&cluster, "p,s").await;

    assert!(cluster.compile_blueprint("p,x").is_err());
    assert!(cluster.compile_blueprint("p,s,n").is_err());

    let domain = letter_domain();
    let mut two_primaries = Blueprint::new(domain.clone());
    two_primaries.add_role(0, domain.clone(), Role::Primary);
    two_primaries.add_role(1, domain, Role::Primary);
    cluster.set_all_blueprints(&two_primaries);
    tokio::time::sleep(Duration::from_millis(150)).await;

    for node in cluster.nodes() {
        let current = node.reactor().accepted_blueprint().expect("accepted");
        assert_eq!(*current, accepted, "peer {} applied a malformed blueprint", node.peer);
    }
    let primary = cluster.node(0).expect("node").reactor().card();
    assert!(primary
        .activities
        .values()
        .all(|entry| entry.card.kind() == ActivityKind::Primary));
    cluster
        .wait_until_blueprint_satisfied(&accepted, common::SATISFY_TIMEOUT)
        .await
        .expect("previous blueprint still satisfied");
    cluster.shutdown().await;
}
