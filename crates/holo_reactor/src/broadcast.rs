//! Primary write path.
//!
//! A [`Broadcaster`] runs while its region is `Primary`. The master loop
//! takes writes one at a time: it stamps the next timestamp on the primary's
//! branch, applies the write locally, forwards it to every listener whose
//! region contains the key, and replies only once every up-to-date listener
//! acknowledged it. Commit order is therefore timestamp order.
//!
//! Secondaries register as listeners before they backfill. Writes reach a
//! fresh listener without an ack request and are buffered on its side until
//! its backfill finishes; after it reports up to date every write waits for
//! its ack. A listener that misses the ack deadline is dropped, which closes
//! its stream and sends it back to resync.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::branch::{BranchId, Version};
use crate::error::{ReactorError, ReactorResult};
use crate::network::{Mailbox, Network, PeerId};
use crate::region::{Key, Region};
use crate::stats::ReactorStats;
use crate::store::{ReplicaStore, StoredEntry};

/// Requests served by the master loop.
#[derive(Debug)]
pub enum MasterRequest {
    Write {
        key: Key,
        value: Vec<u8>,
        reply: oneshot::Sender<ReactorResult<Version>>,
    },
    Read {
        key: Key,
        reply: oneshot::Sender<ReactorResult<Option<StoredEntry>>>,
    },
}

/// Requests served by the listener service.
#[derive(Debug)]
pub enum ListenerRequest {
    Register {
        peer: PeerId,
        region: Region,
        writes: mpsc::UnboundedSender<ReplicatedWrite>,
        reply: oneshot::Sender<ListenerIntro>,
    },
    /// The listener finished backfilling. The reply carries the last
    /// timestamp forwarded without an ack request.
    UpToDate {
        listener_id: u64,
        reply: oneshot::Sender<u64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerIntro {
    pub listener_id: u64,
    pub branch: BranchId,
    /// Every write after this version is forwarded to the listener.
    pub registered_at: Version,
}

#[derive(Debug)]
pub struct ReplicatedWrite {
    pub entry: StoredEntry,
    /// Present once the listener is up to date; answered after the write is
    /// applied.
    pub ack: Option<oneshot::Sender<()>>,
}

struct Listener {
    peer: PeerId,
    region: Region,
    writes: mpsc::UnboundedSender<ReplicatedWrite>,
    up_to_date: bool,
}

struct BroadcastState {
    timestamp: u64,
    next_listener: u64,
    listeners: BTreeMap<u64, Listener>,
}

struct BroadcastCore {
    peer: PeerId,
    region: Region,
    branch: BranchId,
    store: Arc<dyn ReplicaStore>,
    network: Network,
    write_ack_timeout: Duration,
    stats: Arc<ReactorStats>,
    state: Mutex<BroadcastState>,
}

impl BroadcastCore {
    fn not_primary(&self, key: &[u8]) -> ReactorError {
        ReactorError::NotPrimary {
            peer: self.peer,
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    fn remove_listeners(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            for id in ids {
                if let Some(listener) = state.listeners.remove(id) {
                    tracing::warn!(peer = self.peer, listener = listener.peer, region = %self.region, "dropped listener");
                }
            }
        }
    }

    async fn commit(&self, key: Key, value: Vec<u8>) -> ReactorResult<Version> {
        if !self.region.contains_key(&key) {
            return Err(self.not_primary(&key));
        }
        let mut pending = Vec::new();
        let mut lost = Vec::new();
        let version = {
            let Ok(mut state) = self.state.lock() else {
                return Err(self.not_primary(&key));
            };
            state.timestamp += 1;
            let version = Version::new(self.branch, state.timestamp);
            let entry = StoredEntry { key, value, version };
            self.store.write(&self.region, entry.clone());
            for (id, listener) in &state.listeners {
                if !listener.region.contains_key(&entry.key) {
                    continue;
                }
                if !self.network.can_reach(self.peer, listener.peer) {
                    lost.push(*id);
                    continue;
                }
                let (ack, acked) = if listener.up_to_date {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };
                let write = ReplicatedWrite {
                    entry: entry.clone(),
                    ack,
                };
                if listener.writes.send(write).is_err() {
                    lost.push(*id);
                    continue;
                }
                if let Some(acked) = acked {
                    pending.push((*id, acked));
                }
            }
            for id in &lost {
                state.listeners.remove(id);
            }
            version
        };
        if !lost.is_empty() {
            tracing::warn!(peer = self.peer, lost = ?lost, region = %self.region, "listeners unreachable; dropped");
        }

        let timeout = self.write_ack_timeout;
        let outcomes = join_all(pending.into_iter().map(|(id, acked)| async move {
            (id, tokio::time::timeout(timeout, acked).await)
        }))
        .await;
        let failed: Vec<u64> = outcomes
            .into_iter()
            .filter(|(_, outcome)| !matches!(outcome, Ok(Ok(()))))
            .map(|(id, _)| id)
            .collect();
        self.remove_listeners(&failed);
        self.stats.record_write_committed();
        Ok(version)
    }

    fn read(&self, key: &[u8]) -> ReactorResult<Option<StoredEntry>> {
        if !self.region.contains_key(key) {
            return Err(self.not_primary(key));
        }
        Ok(self.store.read(key))
    }

    fn handle_listener(&self, request: ListenerRequest) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match request {
            ListenerRequest::Register {
                peer,
                region,
                writes,
                reply,
            } => {
                let listener_id = state.next_listener;
                state.next_listener += 1;
                let intro = ListenerIntro {
                    listener_id,
                    branch: self.branch,
                    registered_at: Version::new(self.branch, state.timestamp),
                };
                state.listeners.insert(
                    listener_id,
                    Listener {
                        peer,
                        region: region.clone(),
                        writes,
                        up_to_date: false,
                    },
                );
                tracing::debug!(peer = self.peer, listener = peer, listener_id, region = %region, "registered listener");
                let _ = reply.send(intro);
            }
            ListenerRequest::UpToDate { listener_id, reply } => {
                let timestamp = state.timestamp;
                // An unknown id drops the reply, which sends the listener back to resync.
                if let Some(listener) = state.listeners.get_mut(&listener_id) {
                    listener.up_to_date = true;
                    let _ = reply.send(timestamp);
                }
            }
        }
    }
}

/// Write path of one primary activity.
pub struct Broadcaster {
    master: Mailbox<MasterRequest>,
    listeners: Mailbox<ListenerRequest>,
    core: Arc<BroadcastCore>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BroadcasterSettings {
    pub peer: PeerId,
    pub region: Region,
    pub branch: BranchId,
    pub initial_timestamp: u64,
    pub store: Arc<dyn ReplicaStore>,
    pub network: Network,
    pub write_ack_timeout: Duration,
    pub stats: Arc<ReactorStats>,
}

impl Broadcaster {
    pub fn start(settings: BroadcasterSettings) -> Self {
        let (master, mut master_rx) = settings.network.mailbox::<MasterRequest>(settings.peer);
        let (listeners, mut listener_rx) = settings.network.mailbox::<ListenerRequest>(settings.peer);
        let core = Arc::new(BroadcastCore {
            peer: settings.peer,
            region: settings.region,
            branch: settings.branch,
            store: settings.store,
            network: settings.network,
            write_ack_timeout: settings.write_ack_timeout,
            stats: settings.stats,
            state: Mutex::new(BroadcastState {
                timestamp: settings.initial_timestamp,
                next_listener: 1,
                listeners: BTreeMap::new(),
            }),
        });
        let cancel = CancellationToken::new();

        let master_core = core.clone();
        let master_cancel = cancel.clone();
        let master_task = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    biased;
                    _ = master_cancel.cancelled() => break,
                    request = master_rx.recv() => request,
                };
                let Some(request) = request else {
                    break;
                };
                match request {
                    MasterRequest::Write { key, value, reply } => {
                        let outcome = master_core.commit(key, value).await;
                        let _ = reply.send(outcome);
                    }
                    MasterRequest::Read { key, reply } => {
                        let _ = reply.send(master_core.read(&key));
                    }
                }
            }
            master_rx.close();
            while let Ok(request) = master_rx.try_recv() {
                match request {
                    MasterRequest::Write { key, reply, .. } => {
                        let _ = reply.send(Err(master_core.not_primary(&key)));
                    }
                    MasterRequest::Read { key, reply } => {
                        let _ = reply.send(Err(master_core.not_primary(&key)));
                    }
                }
            }
        });

        let listener_core = core.clone();
        let listener_cancel = cancel.clone();
        let listener_task = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    request = listener_rx.recv() => request,
                };
                let Some(request) = request else {
                    break;
                };
                listener_core.handle_listener(request);
            }
        });

        Self {
            master,
            listeners,
            core,
            cancel,
            tasks: vec![master_task, listener_task],
        }
    }

    pub fn master(&self) -> Mailbox<MasterRequest> {
        self.master.clone()
    }

    pub fn listener_mailbox(&self) -> Mailbox<ListenerRequest> {
        self.listeners.clone()
    }

    /// Stops accepting writes, lets the in-flight write finish, and closes
    /// every listener stream.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            let _ = task.await;
        }
        if let Ok(mut state) = self.core.state.lock() {
            state.listeners.clear();
        }
        tracing::debug!(peer = self.core.peer, region = %self.core.region, "broadcaster stopped");
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
