//! Backfill engine.
//!
//! A data-bearing activity runs a [`Backfiller`] that answers
//! [`BackfillRequest`]s: it snapshots its store, announces the snapshot's
//! version, and streams everything the requester is missing. A
//! [`BackfillSession`] on the requesting side applies that stream.
//!
//! The requester describes what it already holds as a map of version ranges.
//! Pieces whose held versions are not ancestors of the snapshot are reset
//! and resent in full; elsewhere only entries newer than the held version
//! travel. While chunks are being applied the target's metadata is
//! incoherent (`earliest` is what it had, `latest` is the snapshot), so an
//! interrupted session is resumed by the next one instead of being trusted.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::branch::{BranchHistory, Version, VersionRange};
use crate::error::{ReactorError, ReactorResult};
use crate::network::{Mailbox, Network, PeerId};
use crate::region::{Region, RegionMap};
use crate::stats::ReactorStats;
use crate::store::{ReplicaStore, StoreChunk, StoredEntry};

/// Ask a backfiller for the contents of `region`.
#[derive(Debug)]
pub struct BackfillRequest {
    pub requester: PeerId,
    pub region: Region,
    /// Versions the requester holds, as recorded in its metadata.
    pub since: RegionMap<VersionRange>,
    pub chunks: mpsc::Sender<BackfillMessage>,
}

#[derive(Debug)]
pub enum BackfillMessage {
    /// Version of the snapshot being streamed.
    Begin { version: RegionMap<Version> },
    Chunk(Vec<StoreChunk>),
    End,
    /// The source will not serve this request.
    Refused(String),
}

/// Test hook that cuts the next backfill session after a number of chunks.
#[derive(Clone, Default)]
pub struct BackfillFaults {
    cut_after: Arc<Mutex<Option<usize>>>,
}

impl BackfillFaults {
    pub fn cut_next_session_after(&self, chunks: usize) {
        if let Ok(mut slot) = self.cut_after.lock() {
            *slot = Some(chunks);
        }
    }

    fn take(&self) -> Option<usize> {
        self.cut_after.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// What a backfiller needs to serve requests for one peer.
#[derive(Clone)]
pub struct BackfillSource {
    pub peer: PeerId,
    pub store: Arc<dyn ReplicaStore>,
    pub history: BranchHistory,
    pub network: Network,
    pub chunk_keys: usize,
    pub faults: BackfillFaults,
}

impl BackfillSource {
    fn is_ancestor(&self, ancestor: Version, descendant: Version, region: &Region) -> bool {
        self.history
            .version_is_ancestor(ancestor, descendant, region)
            .unwrap_or(false)
    }

    async fn send(
        &self,
        request: &BackfillRequest,
        msg: BackfillMessage,
        cancel: &CancellationToken,
    ) -> ReactorResult<()> {
        if !self.network.can_reach(self.peer, request.requester) {
            return Err(ReactorError::PeerUnreachable {
                peer: request.requester,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ReactorError::Interrupted),
            sent = request.chunks.send(msg) => sent.map_err(|_| ReactorError::PeerUnreachable {
                peer: request.requester,
            }),
        }
    }

    /// Streams one snapshot of `request.region` to the requester.
    pub async fn serve(&self, request: BackfillRequest, cancel: &CancellationToken) -> ReactorResult<()> {
        let snapshot = self.store.snapshot(&request.region);
        if snapshot.metainfo.values().any(|range| !range.is_coherent()) {
            let reason = format!("{} holds partially backfilled data", request.region);
            return self.send(&request, BackfillMessage::Refused(reason), cancel).await;
        }
        let version = snapshot.metainfo.map(|range| range.latest);

        let mut reset = Region::empty();
        for (piece, held) in request.since.mask(&request.region).iter() {
            for (sub, current) in version.mask(&piece).iter() {
                let resumable = self.is_ancestor(held.earliest, *current, &sub)
                    && self.is_ancestor(held.latest, *current, &sub);
                if !resumable {
                    reset = reset.union(&sub);
                }
            }
        }

        let mut pending = Vec::new();
        if !reset.is_empty() {
            pending.push(StoreChunk::Reset(reset.clone()));
        }
        for entry in snapshot.entries {
            let baseline = match request.since.get(&entry.key) {
                Some(held) if !reset.contains_key(&entry.key) => held.earliest,
                _ => Version::zero(),
            };
            if !self.is_ancestor(entry.version, baseline, &Region::point(&entry.key)) {
                pending.push(StoreChunk::Set(entry));
            }
        }

        tracing::debug!(
            peer = self.peer,
            requester = request.requester,
            region = %request.region,
            reset = %reset,
            chunks = pending.len(),
            "serving backfill"
        );
        self.send(&request, BackfillMessage::Begin { version }, cancel)
            .await?;
        let cut_after = self.faults.take();
        for (sent, batch) in pending.chunks(self.chunk_keys.max(1)).enumerate() {
            if cut_after == Some(sent) {
                tracing::warn!(peer = self.peer, requester = request.requester, sent, "backfill cut by fault injection");
                return Err(ReactorError::BackfillAborted {
                    peer: self.peer,
                    region: request.region.to_string(),
                });
            }
            self.send(&request, BackfillMessage::Chunk(batch.to_vec()), cancel)
                .await?;
        }
        self.send(&request, BackfillMessage::End, cancel).await
    }
}

/// Serves backfill requests for one activity until dropped.
pub struct Backfiller {
    mailbox: Mailbox<BackfillRequest>,
    cancel: CancellationToken,
}

impl Backfiller {
    pub fn spawn(source: BackfillSource, region: Region) -> Self {
        let (mailbox, mut requests) = source.network.mailbox::<BackfillRequest>(source.peer);
        let cancel = CancellationToken::new();
        let service_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = service_cancel.cancelled() => break,
                    request = requests.recv() => request,
                };
                let Some(request) = request else {
                    break;
                };
                if !region.covers(&request.region) {
                    let reason = format!("{region} does not cover {}", request.region);
                    let _ = request.chunks.try_send(BackfillMessage::Refused(reason));
                    continue;
                }
                let source = source.clone();
                let cancel = service_cancel.child_token();
                tokio::spawn(async move {
                    let requester = request.requester;
                    if let Err(err) = source.serve(request, &cancel).await {
                        if !err.is_interrupted() {
                            tracing::debug!(peer = source.peer, requester, error = %err, "backfill session ended early");
                        }
                    }
                });
            }
        });
        Self { mailbox, cancel }
    }

    pub fn mailbox(&self) -> Mailbox<BackfillRequest> {
        self.mailbox.clone()
    }
}

impl Drop for Backfiller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Requesting side of a backfill into `region` of the local store.
pub struct BackfillSession {
    pub peer: PeerId,
    pub store: Arc<dyn ReplicaStore>,
    pub region: Region,
    pub channel_depth: usize,
    pub stats: Arc<ReactorStats>,
    /// When set, the snapshot must include every write up to this version;
    /// later writes arrive through the listener buffer.
    pub registered_at: Option<Version>,
    pub history: BranchHistory,
}

impl BackfillSession {
    /// Brings the region up to the source's snapshot and returns its version.
    pub async fn run(
        &self,
        source: &Mailbox<BackfillRequest>,
        cancel: &CancellationToken,
    ) -> ReactorResult<RegionMap<Version>> {
        self.stats.record_backfill_started();
        let outcome = self.stream(source, cancel).await;
        match &outcome {
            Ok(_) => self.stats.record_backfill_completed(),
            Err(_) => self.stats.record_backfill_failure(),
        }
        outcome
    }

    async fn stream(
        &self,
        source: &Mailbox<BackfillRequest>,
        cancel: &CancellationToken,
    ) -> ReactorResult<RegionMap<Version>> {
        let source_peer = source.owner();
        let unavailable = |reason: String| ReactorError::BackfillSourceUnavailable {
            peer: source_peer,
            reason,
        };
        let since = self.store.metainfo(&self.region);
        let (chunks, mut stream) = mpsc::channel(self.channel_depth.max(1));
        source
            .send(
                self.peer,
                BackfillRequest {
                    requester: self.peer,
                    region: self.region.clone(),
                    since: since.clone(),
                    chunks,
                },
            )
            .map_err(|err| unavailable(err.to_string()))?;

        let mut target: Option<RegionMap<Version>> = None;
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ReactorError::BackfillAborted {
                        peer: source_peer,
                        region: self.region.to_string(),
                    });
                }
                msg = stream.recv() => msg,
            };
            match msg {
                None => return Err(unavailable("stream closed before the end".into())),
                Some(BackfillMessage::Refused(reason)) => return Err(unavailable(reason)),
                Some(BackfillMessage::Begin { version }) => {
                    if target.is_some() {
                        return Err(unavailable("duplicate begin".into()));
                    }
                    if version.domain() != self.region {
                        return Err(unavailable(format!(
                            "snapshot covers {} instead of {}",
                            version.domain(),
                            self.region
                        )));
                    }
                    if let Some(registered_at) = self.registered_at {
                        let covered = version.values().all(|v| {
                            self.history
                                .version_is_ancestor(registered_at, *v, &self.region)
                                .unwrap_or(false)
                        });
                        if !covered {
                            return Err(unavailable(format!(
                                "snapshot predates listener registration at {registered_at}"
                            )));
                        }
                    }
                    for (piece, latest) in version.iter() {
                        for (sub, held) in since.mask(&piece).iter() {
                            self.store.set_metainfo(
                                &sub,
                                VersionRange {
                                    earliest: held.earliest,
                                    latest: *latest,
                                },
                            );
                        }
                    }
                    target = Some(version);
                }
                Some(BackfillMessage::Chunk(batch)) => {
                    if target.is_none() {
                        return Err(unavailable("chunk before begin".into()));
                    }
                    for chunk in &batch {
                        if let StoreChunk::Reset(region) = chunk {
                            for (sub, held) in self.store.metainfo(region).iter() {
                                self.store.set_metainfo(
                                    &sub,
                                    VersionRange {
                                        earliest: Version::zero(),
                                        latest: held.latest,
                                    },
                                );
                            }
                        }
                    }
                    self.store.apply_chunks(&batch);
                    self.stats.record_chunks_applied(1);
                }
                Some(BackfillMessage::End) => {
                    let Some(version) = target else {
                        return Err(unavailable("end before begin".into()));
                    };
                    for (piece, latest) in version.iter() {
                        self.store
                            .set_metainfo(&piece, VersionRange::coherent(*latest));
                    }
                    tracing::debug!(peer = self.peer, source = source_peer, region = %self.region, "backfill complete");
                    return Ok(version);
                }
            }
        }
    }
}

/// True when `snapshot` already reflects `entry`, so a buffered copy of the
/// write must not be applied again.
pub fn already_applied(snapshot: &RegionMap<Version>, entry: &StoredEntry) -> bool {
    snapshot.get(&entry.key).is_some_and(|held| {
        held.branch == entry.version.branch && entry.version.timestamp <= held.timestamp
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;
    use crate::blueprint::letter_domain;
    use crate::store::MemoryStore;

    struct Pair {
        history: BranchHistory,
        network: Network,
        source_store: Arc<MemoryStore>,
        target_store: Arc<MemoryStore>,
        faults: BackfillFaults,
        backfiller: Backfiller,
        stats: Arc<ReactorStats>,
    }

    impl Pair {
        fn new(chunk_keys: usize) -> Self {
            let history = BranchHistory::new(1);
            let network = Network::new();
            let source_store = Arc::new(MemoryStore::new());
            let target_store = Arc::new(MemoryStore::new());
            let faults = BackfillFaults::default();
            let backfiller = Backfiller::spawn(
                BackfillSource {
                    peer: 1,
                    store: source_store.clone(),
                    history: history.clone(),
                    network: network.clone(),
                    chunk_keys,
                    faults: faults.clone(),
                },
                letter_domain(),
            );
            Self {
                history,
                network,
                source_store,
                target_store,
                faults,
                backfiller,
                stats: Arc::new(ReactorStats::new()),
            }
        }

        fn branch(&self, parent: Version) -> BranchId {
            let domain = letter_domain();
            self.history
                .create_branch(&domain, RegionMap::new(&domain, parent))
                .expect("branch")
        }

        fn write(store: &MemoryStore, key: &str, version: Version) {
            store.write(
                &letter_domain(),
                StoredEntry {
                    key: key.as_bytes().to_vec(),
                    value: format!("{key}@{}", version.timestamp).into_bytes(),
                    version,
                },
            );
        }

        fn session(&self) -> BackfillSession {
            BackfillSession {
                peer: 2,
                store: self.target_store.clone(),
                region: letter_domain(),
                channel_depth: 2,
                stats: self.stats.clone(),
                registered_at: None,
                history: self.history.clone(),
            }
        }

        async fn run(&self) -> ReactorResult<RegionMap<Version>> {
            self.session()
                .run(&self.backfiller.mailbox(), &CancellationToken::new())
                .await
        }
    }

    fn keys(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("k{i:03}")).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn full_then_incremental_backfill() {
        let pair = Pair::new(4);
        let branch = pair.branch(Version::zero());
        for (ts, key) in keys(10).iter().enumerate() {
            Pair::write(&pair.source_store, key, Version::new(branch, ts as u64 + 1));
        }

        let version = pair.run().await.expect("full backfill");
        assert_eq!(version.uniform(), Some(&Version::new(branch, 10)));
        assert_eq!(pair.target_store.len(), 10);
        assert_eq!(
            pair.target_store.metainfo(&letter_domain()).uniform(),
            Some(&VersionRange::coherent(Version::new(branch, 10)))
        );
        let applied = pair.stats.snapshot().chunks_applied;
        assert_eq!(applied, 3);

        Pair::write(&pair.source_store, "k003", Version::new(branch, 11));
        Pair::write(&pair.source_store, "k100", Version::new(branch, 12));
        pair.run().await.expect("incremental backfill");
        assert_eq!(pair.stats.snapshot().chunks_applied, applied + 1);
        assert_eq!(pair.target_store.len(), 11);
        assert_eq!(
            pair.target_store.read(b"k003").map(|e| e.version),
            Some(Version::new(branch, 11))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn divergent_target_is_reset() {
        let pair = Pair::new(8);
        let theirs = pair.branch(Version::zero());
        let ours = pair.branch(Version::zero());
        Pair::write(&pair.source_store, "shared", Version::new(theirs, 1));
        Pair::write(&pair.target_store, "stray", Version::new(ours, 1));

        pair.run().await.expect("reset backfill");
        assert!(pair.target_store.read(b"stray").is_none());
        assert_eq!(
            pair.target_store.read(b"shared").map(|e| e.version),
            Some(Version::new(theirs, 1))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn interrupted_session_leaves_incoherent_data_then_resumes() {
        let pair = Pair::new(2);
        let branch = pair.branch(Version::zero());
        for (ts, key) in keys(10).iter().enumerate() {
            Pair::write(&pair.source_store, key, Version::new(branch, ts as u64 + 1));
        }
        pair.faults.cut_next_session_after(2);

        match pair.run().await {
            Err(ReactorError::BackfillSourceUnavailable { peer, .. }) => assert_eq!(peer, 1),
            other => panic!("unexpected backfill result: {other:?}"),
        }
        assert_eq!(pair.target_store.len(), 4);
        let meta = pair.target_store.metainfo(&letter_domain());
        let range = meta.uniform().copied().expect("single piece");
        assert!(!range.is_coherent());
        assert_eq!(range.earliest, Version::zero());
        assert_eq!(range.latest, Version::new(branch, 10));

        pair.run().await.expect("resumed backfill");
        assert_eq!(pair.target_store.len(), 10);
        assert_eq!(pair.stats.snapshot().backfill_failures, 1);
        assert_eq!(pair.stats.snapshot().backfills_completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn incoherent_source_and_partition_refuse() {
        let pair = Pair::new(4);
        let branch = pair.branch(Version::zero());
        pair.source_store.set_metainfo(
            &letter_domain(),
            VersionRange {
                earliest: Version::zero(),
                latest: Version::new(branch, 3),
            },
        );
        assert!(matches!(
            pair.run().await,
            Err(ReactorError::BackfillSourceUnavailable { .. })
        ));

        pair.source_store
            .set_metainfo(&letter_domain(), VersionRange::coherent(Version::new(branch, 3)));
        pair.network.disconnect(1);
        assert!(matches!(
            pair.run().await,
            Err(ReactorError::BackfillSourceUnavailable { .. })
        ));
        pair.network.reconnect(1);
        pair.run().await.expect("reachable again");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_older_than_registration_is_rejected() {
        let pair = Pair::new(4);
        let branch = pair.branch(Version::zero());
        Pair::write(&pair.source_store, "a", Version::new(branch, 2));
        let mut session = pair.session();
        session.registered_at = Some(Version::new(branch, 5));
        let outcome = session
            .run(&pair.backfiller.mailbox(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, Err(ReactorError::BackfillSourceUnavailable { .. })));
        assert!(pair.target_store.is_empty());
    }

    #[test]
    fn buffered_writes_newer_than_snapshot_apply() {
        let branch = BranchId { peer: 1, counter: 1 };
        let snapshot = RegionMap::new(&letter_domain(), Version::new(branch, 5));
        let entry = |ts| StoredEntry {
            key: b"m".to_vec(),
            value: Vec::new(),
            version: Version::new(branch, ts),
        };
        assert!(already_applied(&snapshot, &entry(5)));
        assert!(!already_applied(&snapshot, &entry(6)));
    }
}
