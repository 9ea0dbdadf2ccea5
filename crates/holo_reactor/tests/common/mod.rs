//! Shared helpers for multi-peer integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use holo_reactor::{Blueprint, LocalCluster, NamespaceRouter, ReactorConfig, ReactorError, ReplicaStore};

/// Bound on each blueprint's satisfaction wait.
pub const SATISFY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Faster retries and stall reports than the defaults so scenarios settle
/// well inside [`SATISFY_TIMEOUT`].
pub fn test_config() -> ReactorConfig {
    ReactorConfig {
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        echo_ack_timeout: Duration::from_millis(300),
        write_ack_timeout: Duration::from_millis(300),
        stall_report_after: Duration::from_millis(100),
        backfill_chunk_keys: 16,
        ..ReactorConfig::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn start_cluster(peers: usize) -> LocalCluster {
    start_cluster_with(peers, test_config())
}

pub fn start_cluster_with(peers: usize, config: ReactorConfig) -> LocalCluster {
    init_tracing();
    LocalCluster::start(peers, config).expect("start local cluster")
}

/// Hands `roles` to every peer and waits for the cluster to satisfy it.
pub async fn apply(cluster: &LocalCluster, roles: &str) -> Blueprint {
    let blueprint = cluster.compile_blueprint(roles).expect("compile blueprint");
    cluster.set_all_blueprints(&blueprint);
    match cluster
        .wait_until_blueprint_satisfied(&blueprint, SATISFY_TIMEOUT)
        .await
    {
        Ok(()) => blueprint,
        Err(ReactorError::WaitTimeout { mismatches, .. }) => {
            let report: Vec<String> = mismatches.iter().map(ToString::to_string).collect();
            panic!("blueprint {roles:?} not satisfied:\n{}", report.join("\n"));
        }
        Err(err) => panic!("blueprint {roles:?} wait failed: {err}"),
    }
}

/// Key `i` of the letter keyspace. Consecutive keys start with consecutive
/// letters, so any batch larger than 26 touches every shard.
pub fn test_key(i: usize) -> Vec<u8> {
    let mut key = vec![b'a' + (i % 26) as u8];
    key.extend_from_slice(format!("-{i:05}").as_bytes());
    key
}

/// Writes keys through a router and remembers what each should hold.
#[derive(Default)]
pub struct Inserter {
    next: usize,
    expected: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Inserter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.expected.len()
    }

    pub fn expected(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.expected
    }

    /// Writes `count` fresh keys.
    pub async fn insert(&mut self, router: &NamespaceRouter, count: usize) {
        for _ in 0..count {
            let key = test_key(self.next);
            let value = format!("value-{}", self.next).into_bytes();
            self.next += 1;
            router
                .write(key.clone(), value.clone())
                .await
                .unwrap_or_else(|err| panic!("write {}: {err}", String::from_utf8_lossy(&key)));
            self.expected.insert(key, value);
        }
    }

    /// Reads every written key back through `router`.
    pub async fn validate(&self, router: &NamespaceRouter) {
        for (key, value) in &self.expected {
            let entry = router
                .read(key.clone())
                .await
                .unwrap_or_else(|err| panic!("read {}: {err}", String::from_utf8_lossy(key)));
            let entry = entry.unwrap_or_else(|| panic!("key {} was lost", String::from_utf8_lossy(key)));
            assert_eq!(
                &entry.value,
                value,
                "key {} holds the wrong value",
                String::from_utf8_lossy(key)
            );
        }
    }

    /// Checks that `store` holds every written key directly.
    pub fn validate_replica(&self, store: &dyn ReplicaStore) {
        for (key, value) in &self.expected {
            let entry = store
                .read(key)
                .unwrap_or_else(|| panic!("replica is missing {}", String::from_utf8_lossy(key)));
            assert_eq!(&entry.value, value, "replica holds a stale {}", String::from_utf8_lossy(key));
        }
    }
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
