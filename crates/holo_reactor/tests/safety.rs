//! Safety properties that must hold while the cluster converges.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{apply, start_cluster, Inserter};
use holo_reactor::ActivityKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_two_primaries_during_handoffs() {
    let cluster = start_cluster(3);
    let router = cluster.router(2).expect("router").clone();
    let done = AtomicBool::new(false);
    let mut inserter = Inserter::new();

    let transitions = async {
        for roles in ["p,s,n", "s,p,n", "n,s,p", "pn,np,ss", "p,s,n"] {
            apply(&cluster, roles).await;
            inserter.insert(&router, 30).await;
        }
        done.store(true, Ordering::SeqCst);
    };
    let monitor = async {
        let mut samples = 0u64;
        while !done.load(Ordering::SeqCst) {
            let conflicts = cluster.primary_conflicts();
            assert!(conflicts.is_empty(), "overlapping primaries observed: {conflicts:?}");
            samples += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        samples
    };
    let ((), samples) = tokio::join!(transitions, monitor);
    assert!(samples > 0);

    inserter.validate(&router).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reapplying_a_blueprint_is_a_no_op() {
    let cluster = start_cluster(2);
    let blueprint = apply(&cluster, "p,s").await;
    let before = cluster.stats();
    let cards: Vec<_> = cluster
        .nodes()
        .iter()
        .map(|node| node.reactor().card())
        .collect();

    cluster.set_all_blueprints(&blueprint);
    cluster
        .wait_until_blueprint_satisfied(&blueprint, common::SATISFY_TIMEOUT)
        .await
        .expect("still satisfied");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(cluster.stats(), before, "reapplication restarted work");
    for (node, card) in cluster.nodes().iter().zip(&cards) {
        assert_eq!(&node.reactor().card(), card);
    }
    let primary = cluster.node(0).expect("node").reactor().card();
    assert!(primary
        .activities
        .values()
        .all(|entry| entry.card.kind() == ActivityKind::Primary));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_writes_need_a_local_primary() {
    let cluster = start_cluster(2);
    apply(&cluster, "p,s").await;

    let primary = cluster.node(0).expect("node").reactor();
    let version = primary
        .write(b"kiwi".to_vec(), b"green".to_vec())
        .await
        .expect("primary accepts writes");
    assert!(version.timestamp >= 1);
    let entry = primary.read(b"kiwi".to_vec()).await.expect("read").expect("present");
    assert_eq!(entry.value, b"green".to_vec());

    let secondary = cluster.node(1).expect("node").reactor();
    let err = secondary
        .write(b"kiwi".to_vec(), b"red".to_vec())
        .await
        .expect_err("secondary refuses writes");
    assert!(matches!(err, holo_reactor::ReactorError::NotPrimary { peer: 1, .. }), "{err}");
    cluster.shutdown().await;
}
