//! In-process stand-ins for the cluster transport and directory.
//!
//! Peers talk through [`Mailbox`]es: addressable channel endpoints that can
//! be stored inside directory values and compared for equality. A
//! [`Network`] tracks which peers are partitioned away, and sends across a
//! partition fail with `PeerUnreachable` instead of being delivered.
//!
//! [`ClusterDirectory`] holds the latest value published by every peer and
//! wakes subscribers through a `watch` channel whenever a value or the
//! connectivity changes. Readers filter it by reachability, so a
//! partitioned peer disappears from everyone else's view and sees only
//! itself.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, watch};

use crate::error::{ReactorError, ReactorResult};

pub type PeerId = u64;

/// Connectivity shared by every in-process peer.
#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    disconnected: RwLock<BTreeSet<PeerId>>,
    next_mailbox: AtomicU64,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.inner
            .disconnected
            .read()
            .map(|set| !set.contains(&peer))
            .unwrap_or(true)
    }

    /// A peer can always reach itself; otherwise both ends must be connected.
    pub fn can_reach(&self, from: PeerId, to: PeerId) -> bool {
        from == to || (self.is_connected(from) && self.is_connected(to))
    }

    pub fn disconnect(&self, peer: PeerId) {
        if let Ok(mut set) = self.inner.disconnected.write() {
            set.insert(peer);
        }
    }

    pub fn reconnect(&self, peer: PeerId) {
        if let Ok(mut set) = self.inner.disconnected.write() {
            set.remove(&peer);
        }
    }

    /// Creates a mailbox owned by `owner` and the receiver that drains it.
    pub fn mailbox<T>(&self, owner: PeerId) -> (Mailbox<T>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_mailbox.fetch_add(1, Ordering::Relaxed);
        let mailbox = Mailbox {
            owner,
            id,
            tx,
            network: self.clone(),
        };
        (mailbox, rx)
    }
}

/// Address of a channel owned by a peer.
pub struct Mailbox<T> {
    owner: PeerId,
    id: u64,
    tx: mpsc::UnboundedSender<T>,
    network: Network,
}

impl<T> Mailbox<T> {
    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Delivers `msg` on behalf of `from`.
    pub fn send(&self, from: PeerId, msg: T) -> ReactorResult<()> {
        if !self.network.can_reach(from, self.owner) {
            return Err(ReactorError::PeerUnreachable { peer: self.owner });
        }
        self.tx
            .send(msg)
            .map_err(|_| ReactorError::PeerUnreachable { peer: self.owner })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            id: self.id,
            tx: self.tx.clone(),
            network: self.network.clone(),
        }
    }
}

impl<T> PartialEq for Mailbox<T> {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.id == other.id
    }
}

impl<T> Eq for Mailbox<T> {}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mailbox({}#{})", self.owner, self.id)
    }
}

pub type DirectoryEntries<T> = Arc<BTreeMap<PeerId, T>>;

/// Latest value published by each peer.
pub struct ClusterDirectory<T> {
    network: Network,
    entries: Arc<watch::Sender<DirectoryEntries<T>>>,
}

impl<T> Clone for ClusterDirectory<T> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ClusterDirectory<T> {
    pub fn new(network: Network) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            network,
            entries: Arc::new(tx),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn publish(&self, peer: PeerId, value: T) {
        self.entries.send_modify(|entries| {
            Arc::make_mut(entries).insert(peer, value);
        });
    }

    pub fn retract(&self, peer: PeerId) {
        self.entries.send_modify(|entries| {
            Arc::make_mut(entries).remove(&peer);
        });
    }

    /// Raw published values, including those of partitioned peers.
    pub fn subscribe(&self) -> watch::Receiver<DirectoryEntries<T>> {
        self.entries.subscribe()
    }

    pub fn snapshot(&self) -> DirectoryEntries<T> {
        self.entries.borrow().clone()
    }

    /// The values `viewer` can currently observe.
    pub fn visible_to(&self, viewer: PeerId, entries: &BTreeMap<PeerId, T>) -> BTreeMap<PeerId, T> {
        entries
            .iter()
            .filter(|(peer, _)| self.network.can_reach(viewer, **peer))
            .map(|(peer, value)| (*peer, value.clone()))
            .collect()
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.network.disconnect(peer);
        self.entries.send_modify(|_| {});
    }

    pub fn reconnect(&self, peer: PeerId) {
        self.network.reconnect(peer);
        self.entries.send_modify(|_| {});
    }
}

/// Waits until `check` yields a value for the current contents of `rx`.
///
/// Fails with `Interrupted` when the sending side goes away.
pub async fn watch_until<T, R>(
    rx: &mut watch::Receiver<T>,
    mut check: impl FnMut(&T) -> Option<R>,
) -> ReactorResult<R> {
    loop {
        let outcome = check(&rx.borrow_and_update());
        if let Some(out) = outcome {
            return Ok(out);
        }
        rx.changed().await.map_err(|_| ReactorError::Interrupted)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mailbox_refuses_delivery_across_partition() {
        let network = Network::new();
        let (mailbox, mut rx) = network.mailbox::<u32>(2);

        mailbox.send(1, 7).expect("connected peers deliver");
        assert_eq!(rx.recv().await, Some(7));

        network.disconnect(2);
        match mailbox.send(1, 8) {
            Err(ReactorError::PeerUnreachable { peer }) => assert_eq!(peer, 2),
            other => panic!("unexpected send result: {other:?}"),
        }
        mailbox.send(2, 9).expect("a peer can always reach itself");
        assert_eq!(rx.recv().await, Some(9));

        network.reconnect(2);
        mailbox.send(1, 10).expect("reconnected peers deliver");
        assert_eq!(rx.recv().await, Some(10));
    }

    #[test]
    fn mailboxes_compare_by_address() {
        let network = Network::new();
        let (a, _rx_a) = network.mailbox::<()>(1);
        let (b, _rx_b) = network.mailbox::<()>(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn directory_notifies_and_filters_partitioned_peers() {
        let directory = ClusterDirectory::<&'static str>::new(Network::new());
        let mut rx = directory.subscribe();
        directory.publish(1, "one");
        directory.publish(2, "two");

        watch_until(&mut rx, |entries| (entries.len() == 2).then_some(()))
            .await
            .expect("directory sender alive");

        directory.disconnect(2);
        let entries = directory.snapshot();
        assert_eq!(directory.visible_to(1, &entries).len(), 1);
        let isolated = directory.visible_to(2, &entries);
        assert_eq!(isolated.keys().copied().collect::<Vec<_>>(), vec![2]);

        directory.retract(1);
        assert!(!directory.snapshot().contains_key(&1));
    }
}
