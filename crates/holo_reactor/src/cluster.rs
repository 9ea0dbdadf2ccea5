//! In-process multi-peer topology.
//!
//! Wires one [`Network`], one directory and, per peer, a memory store, a
//! branch history, a blueprint channel, a reactor and a router. A gossip
//! task plays the part of the external branch-history exchange: whenever a
//! history grows, its records are merged into every history it can reach.
//! An observer mirror outside every peer backs the satisfaction wait and
//! the single-primary monitor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::select_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backfill::BackfillFaults;
use crate::blueprint::Blueprint;
use crate::branch::BranchHistory;
use crate::config::ReactorConfig;
use crate::directory::{self, primary_conflicts, PrimaryConflict, ReactorCard, ReactorDirectory};
use crate::echo::EchoMirror;
use crate::error::ReactorResult;
use crate::network::{Network, PeerId};
use crate::reactor::{Reactor, ReactorSettings};
use crate::router::NamespaceRouter;
use crate::stats::StatsSnapshot;
use crate::store::MemoryStore;

/// Peer id of the harness observer; never part of a blueprint.
pub const OBSERVER: PeerId = PeerId::MAX;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(25);

pub struct LocalNode {
    pub peer: PeerId,
    pub store: Arc<MemoryStore>,
    pub history: BranchHistory,
    pub faults: BackfillFaults,
    pub router: NamespaceRouter,
    blueprint: watch::Sender<Option<Blueprint>>,
    reactor: Reactor,
}

impl LocalNode {
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

pub struct LocalCluster {
    network: Network,
    directory: ReactorDirectory,
    nodes: Vec<LocalNode>,
    observer: EchoMirror<ReactorCard>,
    cancel: CancellationToken,
    gossip: Option<JoinHandle<()>>,
}

impl LocalCluster {
    /// Starts `peers` reactors with ids `0..peers`, all without a blueprint.
    pub fn start(peers: usize, config: ReactorConfig) -> anyhow::Result<Self> {
        if peers == 0 {
            anyhow::bail!("a cluster needs at least one peer");
        }
        let network = Network::new();
        let directory = ReactorDirectory::new(network.clone());
        let observer = EchoMirror::spawn(OBSERVER, directory.clone(), config.backoff_base);
        let mut nodes = Vec::with_capacity(peers);
        for peer in 0..peers as PeerId {
            let store = Arc::new(MemoryStore::new());
            let history = BranchHistory::new(peer);
            let faults = BackfillFaults::default();
            let (blueprint, blueprint_rx) = watch::channel(None);
            let reactor = Reactor::spawn(
                ReactorSettings {
                    peer,
                    store: store.clone(),
                    history: history.clone(),
                    directory: directory.clone(),
                    config: config.clone(),
                    faults: faults.clone(),
                },
                blueprint_rx,
            );
            let router = NamespaceRouter::new(
                peer,
                reactor.view(),
                directory.clone(),
                config.router_timeout,
                config.backoff_base,
            );
            nodes.push(LocalNode {
                peer,
                store,
                history,
                faults,
                router,
                blueprint,
                reactor,
            });
        }

        let cancel = CancellationToken::new();
        let histories: Vec<(PeerId, BranchHistory)> = nodes
            .iter()
            .map(|node| (node.peer, node.history.clone()))
            .collect();
        let gossip = tokio::spawn(gossip_loop(histories, network.clone(), cancel.clone()));
        tracing::info!(peers, "local cluster started");
        Ok(Self {
            network,
            directory,
            nodes,
            observer,
            cancel,
            gossip: Some(gossip),
        })
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.nodes.iter().map(|node| node.peer).collect()
    }

    pub fn node(&self, peer: PeerId) -> anyhow::Result<&LocalNode> {
        self.nodes
            .iter()
            .find(|node| node.peer == peer)
            .with_context(|| format!("no peer {peer} in the cluster"))
    }

    pub fn nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    pub fn router(&self, peer: PeerId) -> anyhow::Result<&NamespaceRouter> {
        Ok(&self.node(peer)?.router)
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Parses a role string such as `"p,s,n"` against this cluster's peers.
    pub fn compile_blueprint(&self, roles: &str) -> anyhow::Result<Blueprint> {
        Blueprint::from_role_string(roles, &self.peers())
            .with_context(|| format!("compiling blueprint {roles:?}"))
    }

    pub fn set_all_blueprints(&self, blueprint: &Blueprint) {
        for node in &self.nodes {
            node.blueprint.send_replace(Some(blueprint.clone()));
        }
    }

    /// Delivers `blueprint` to one peer only, as a slow rollout would.
    pub fn set_blueprint(&self, peer: PeerId, blueprint: &Blueprint) -> anyhow::Result<()> {
        self.node(peer)?
            .blueprint
            .send_replace(Some(blueprint.clone()));
        Ok(())
    }

    pub async fn wait_until_blueprint_satisfied(&self, blueprint: &Blueprint, timeout: Duration) -> ReactorResult<()> {
        let mut view = self.observer.view();
        directory::wait_until_blueprint_satisfied(&mut view, blueprint, timeout).await
    }

    /// Overlapping primaries across every published card, partitioned peers
    /// included.
    pub fn primary_conflicts(&self) -> Vec<PrimaryConflict> {
        primary_conflicts(&self.directory.snapshot())
    }

    pub fn disconnect(&self, peer: PeerId) {
        tracing::info!(peer, "disconnecting peer");
        self.directory.disconnect(peer);
    }

    pub fn reconnect(&self, peer: PeerId) {
        tracing::info!(peer, "reconnecting peer");
        self.directory.reconnect(peer);
    }

    /// Cuts the next backfill `peer` serves after `chunks` chunks.
    pub fn inject_backfill_fault(&self, peer: PeerId, chunks: usize) -> anyhow::Result<()> {
        self.node(peer)?.faults.cut_next_session_after(chunks);
        Ok(())
    }

    pub fn stats(&self) -> BTreeMap<PeerId, StatsSnapshot> {
        self.nodes
            .iter()
            .map(|node| (node.peer, node.reactor.stats()))
            .collect()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(gossip) = self.gossip.take() {
            let _ = gossip.await;
        }
        for node in std::mem::take(&mut self.nodes) {
            node.reactor.shutdown().await;
        }
        tracing::info!("local cluster stopped");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn exchange(histories: &[(PeerId, BranchHistory)], network: &Network) {
    for (from, source) in histories {
        let records = source.records();
        for (to, target) in histories {
            if from != to && network.can_reach(*from, *to) {
                target.merge(records.iter().cloned());
            }
        }
    }
}

async fn gossip_loop(histories: Vec<(PeerId, BranchHistory)>, network: Network, cancel: CancellationToken) {
    let mut changes: Vec<watch::Receiver<usize>> = histories
        .iter()
        .map(|(_, history)| history.subscribe())
        .collect();
    let mut tick = tokio::time::interval(GOSSIP_INTERVAL);
    loop {
        exchange(&histories, &network);
        for rx in &mut changes {
            rx.borrow_and_update();
        }
        let grown = select_all(changes.iter_mut().map(|rx| Box::pin(rx.changed())));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = grown => {}
            _ = tick.tick() => {}
        }
    }
}
