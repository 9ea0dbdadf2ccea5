//! Directory echo.
//!
//! A writer publishes its value wrapped with a monotonically increasing
//! version and the address of its acknowledgement mailbox. Every peer runs a
//! mirror that, on seeing a new version, sends an [`EchoAck`] back and waits
//! for the writer to confirm it. Only after that round trip does the value
//! enter the mirror's acknowledged view. The mirror then reports the value as
//! integrated, and only that report counts as the peer's ack.
//!
//! This gives two guarantees:
//! - a reader acting on the acknowledged view only acts on values the writer
//!   has seen it observe;
//! - a writer waiting in [`EchoWriter::wait_for_acks`] knows that every
//!   listed peer's view already contains that version (or a later one).
//!
//! Unreachable peers are not an error here: failed acks are re-sent on a
//! timer and waiters simply keep waiting until their own timeout.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{millis, ReactorError, ReactorResult};
use crate::network::{watch_until, ClusterDirectory, DirectoryEntries, Mailbox, PeerId};

/// A published value together with its echo bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct EchoWrapper<T> {
    pub internal: T,
    pub version: u64,
    pub ack_mailbox: Mailbox<EchoAck>,
}

/// Acknowledgement that `from` has observed `version`.
///
/// The writer answers through `confirm` with a sender the mirror fires once
/// the value is in its acknowledged view.
#[derive(Debug)]
pub struct EchoAck {
    pub from: PeerId,
    pub version: u64,
    pub confirm: oneshot::Sender<oneshot::Sender<()>>,
}

/// Publishes one peer's value and tracks who acknowledged which version.
pub struct EchoWriter<T> {
    peer: PeerId,
    directory: ClusterDirectory<EchoWrapper<T>>,
    state: Mutex<WriterState<T>>,
    acks: Arc<watch::Sender<BTreeMap<PeerId, u64>>>,
    ack_mailbox: Mailbox<EchoAck>,
    cancel: CancellationToken,
}

struct WriterState<T> {
    value: T,
    version: u64,
}

impl<T: Clone + Send + Sync + 'static> EchoWriter<T> {
    /// Publishes `initial` as version 1 and starts collecting acks.
    pub fn spawn(peer: PeerId, directory: ClusterDirectory<EchoWrapper<T>>, initial: T) -> Arc<Self> {
        let (ack_mailbox, mut ack_rx) = directory.network().mailbox::<EchoAck>(peer);
        let (acks, _rx) = watch::channel(BTreeMap::new());
        let acks = Arc::new(acks);
        let cancel = CancellationToken::new();

        let task_acks = acks.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let ack = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    ack = ack_rx.recv() => ack,
                };
                let Some(ack) = ack else {
                    break;
                };
                let (integrated, done) = oneshot::channel();
                if ack.confirm.send(integrated).is_err() {
                    continue;
                }
                let acks = task_acks.clone();
                let (from, version) = (ack.from, ack.version);
                tokio::spawn(async move {
                    if done.await.is_err() {
                        return;
                    }
                    acks.send_modify(|acked| {
                        let seen = acked.entry(from).or_insert(0);
                        if version > *seen {
                            *seen = version;
                        }
                    });
                });
            }
        });

        let writer = Arc::new(Self {
            peer,
            directory,
            state: Mutex::new(WriterState {
                value: initial,
                version: 0,
            }),
            acks,
            ack_mailbox,
            cancel,
        });
        writer.update(|_| {});
        writer
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Applies `f` to the value and publishes the result under a new version.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> u64 {
        self.modify(|value| {
            f(value);
            true
        })
    }

    /// Like [`Self::update`], but only publishes when `f` reports a change.
    /// Returns the version that reflects the value either way.
    pub fn modify(&self, f: impl FnOnce(&mut T) -> bool) -> u64 {
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!(peer = self.peer, "echo writer state poisoned; update dropped");
            return 0;
        };
        if !f(&mut state.value) {
            return state.version;
        }
        state.version += 1;
        self.directory.publish(
            self.peer,
            EchoWrapper {
                internal: state.value.clone(),
                version: state.version,
                ack_mailbox: self.ack_mailbox.clone(),
            },
        );
        state.version
    }

    /// Removes the published value, e.g. when the peer shuts down.
    pub fn retract(&self) {
        self.directory.retract(self.peer);
    }

    pub fn current(&self) -> Option<(T, u64)> {
        let state = self.state.lock().ok()?;
        Some((state.value.clone(), state.version))
    }

    /// Highest version `peer` has acknowledged.
    pub fn acked_version(&self, peer: PeerId) -> u64 {
        self.acks.borrow().get(&peer).copied().unwrap_or(0)
    }

    /// Waits until every peer in `peers` (other than this one) acknowledged
    /// `version` or later.
    pub async fn wait_for_acks(
        &self,
        version: u64,
        peers: &[PeerId],
        timeout: Duration,
    ) -> ReactorResult<()> {
        let others: Vec<PeerId> = peers.iter().copied().filter(|p| *p != self.peer).collect();
        let missing_from = |acked: &BTreeMap<PeerId, u64>| -> Vec<PeerId> {
            others
                .iter()
                .copied()
                .filter(|p| acked.get(p).copied().unwrap_or(0) < version)
                .collect()
        };
        let mut rx = self.acks.subscribe();
        let wait = watch_until(&mut rx, |acked| missing_from(acked).is_empty().then_some(()));
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                let missing = missing_from(&*self.acks.borrow());
                Err(ReactorError::DirectoryEchoTimeout {
                    version,
                    missing,
                    timeout_ms: millis(timeout),
                })
            }
        }
    }
}

impl<T> Drop for EchoWriter<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One peer's acknowledged view of every other peer's published value.
pub struct EchoMirror<T> {
    view: watch::Receiver<DirectoryEntries<EchoWrapper<T>>>,
    cancel: CancellationToken,
}

impl<T: Clone + Send + Sync + 'static> EchoMirror<T> {
    pub fn spawn(peer: PeerId, directory: ClusterDirectory<EchoWrapper<T>>, retry: Duration) -> Self {
        let (view_tx, view) = watch::channel(Arc::new(BTreeMap::new()));
        let cancel = CancellationToken::new();
        tokio::spawn(run_mirror(peer, directory, view_tx, retry, cancel.clone()));
        Self { view, cancel }
    }

    /// Receiver over the acknowledged view; notified on every change.
    pub fn view(&self) -> watch::Receiver<DirectoryEntries<EchoWrapper<T>>> {
        self.view.clone()
    }

    pub fn snapshot(&self) -> DirectoryEntries<EchoWrapper<T>> {
        self.view.borrow().clone()
    }
}

impl<T> Drop for EchoMirror<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_mirror<T: Clone + Send + Sync + 'static>(
    peer: PeerId,
    directory: ClusterDirectory<EchoWrapper<T>>,
    view_tx: watch::Sender<DirectoryEntries<EchoWrapper<T>>>,
    retry: Duration,
    cancel: CancellationToken,
) {
    let mut raw = directory.subscribe();
    let (confirmed_tx, mut confirmed_rx) = mpsc::unbounded_channel::<(EchoWrapper<T>, oneshot::Sender<()>)>();
    let mut acknowledged: BTreeMap<PeerId, EchoWrapper<T>> = BTreeMap::new();
    let mut requested: BTreeMap<PeerId, u64> = BTreeMap::new();
    let mut retry_tick = tokio::time::interval(retry);
    // Fired only after the view holding their version has been published.
    let mut integrated: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        let visible = {
            let entries = raw.borrow_and_update().clone();
            directory.visible_to(peer, &entries)
        };
        let before = acknowledged.len();
        acknowledged.retain(|owner, _| visible.contains_key(owner));
        requested.retain(|owner, _| visible.contains_key(owner));
        let mut changed = acknowledged.len() != before;

        for (owner, wrapper) in &visible {
            if wrapper.version <= requested.get(owner).copied().unwrap_or(0) {
                continue;
            }
            let (confirm, confirmed) = oneshot::channel();
            let ack = EchoAck {
                from: peer,
                version: wrapper.version,
                confirm,
            };
            match wrapper.ack_mailbox.send(peer, ack) {
                Ok(()) => {
                    requested.insert(*owner, wrapper.version);
                    let confirmed_tx = confirmed_tx.clone();
                    let wrapper = wrapper.clone();
                    tokio::spawn(async move {
                        if let Ok(done) = confirmed.await {
                            let _ = confirmed_tx.send((wrapper, done));
                        }
                    });
                }
                Err(err) => {
                    tracing::debug!(peer, owner = *owner, error = %err, "echo ack not delivered; will retry");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed_raw = raw.changed() => {
                if changed_raw.is_err() {
                    break;
                }
            }
            Some((wrapper, done)) = confirmed_rx.recv() => {
                let owner = wrapper.ack_mailbox.owner();
                let still_visible = directory.network().can_reach(peer, owner)
                    && raw.borrow().contains_key(&owner);
                let newer = acknowledged
                    .get(&owner)
                    .map_or(true, |current| current.version < wrapper.version);
                if still_visible && newer {
                    acknowledged.insert(owner, wrapper);
                    changed = true;
                }
                if still_visible {
                    integrated.push(done);
                }
            }
            _ = retry_tick.tick() => {}
        }

        if changed {
            view_tx.send_replace(Arc::new(acknowledged.clone()));
        }
        for done in integrated.drain(..) {
            let _ = done.send(());
        }
    }
}
