//! Branch history registry.
//!
//! A branch is a stretch of write history for a region under one primary.
//! Every time a replica becomes primary it opens a new branch whose origin
//! records, for each part of the region, the version the data was at when the
//! branch started. A split gives the child a single parent over a narrower
//! region; a merge gives it several parents. Records are append-only and
//! are exchanged between peers by an external gossip mechanism through
//! [`BranchHistory::records`] and [`BranchHistory::merge`].
//!
//! Versions are `(branch, timestamp)` pairs. Timestamps grow along a branch
//! and a branch starts at the largest timestamp among its parents, so
//! ancestry is decided by walking origins until the ancestor's branch is
//! reached and comparing timestamps there.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{ReactorError, ReactorResult};
use crate::network::PeerId;
use crate::region::{Region, RegionMap};

/// Cluster-unique branch identifier, allocated by the peer that opened it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId {
    pub peer: PeerId,
    pub counter: u64,
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}.{}", self.peer, self.counter)
    }
}

/// Point in a region's write history.
///
/// `branch == None` is the empty initial state every store starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: Option<BranchId>,
    pub timestamp: u64,
}

impl Version {
    pub const fn zero() -> Self {
        Self {
            branch: None,
            timestamp: 0,
        }
    }

    pub const fn new(branch: BranchId, timestamp: u64) -> Self {
        Self {
            branch: Some(branch),
            timestamp,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.branch.is_none()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(branch) => write!(f, "{branch}@{}", self.timestamp),
            None => write!(f, "zero"),
        }
    }
}

/// Versions bracketing the data held for a region.
///
/// A coherent range (`earliest == latest`) means the data is exactly at that
/// version. An incoherent range marks data that was partially brought from
/// `earliest` towards `latest` by an interrupted backfill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    pub earliest: Version,
    pub latest: Version,
}

impl VersionRange {
    pub const fn coherent(version: Version) -> Self {
        Self {
            earliest: version,
            latest: version,
        }
    }

    pub const fn zero() -> Self {
        Self::coherent(Version::zero())
    }

    pub fn is_coherent(&self) -> bool {
        self.earliest == self.latest
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchRecord {
    pub region: Region,
    pub initial_timestamp: u64,
    /// Parent version for every part of `region`.
    pub origin: RegionMap<Version>,
}

/// Append-only store of branch records known to one peer.
#[derive(Clone)]
pub struct BranchHistory {
    peer: PeerId,
    inner: Arc<BranchHistoryInner>,
}

struct BranchHistoryInner {
    records: RwLock<BTreeMap<BranchId, BranchRecord>>,
    next_counter: AtomicU64,
    changes: watch::Sender<usize>,
}

impl BranchHistory {
    pub fn new(peer: PeerId) -> Self {
        let (changes, _rx) = watch::channel(0);
        Self {
            peer,
            inner: Arc::new(BranchHistoryInner {
                records: RwLock::new(BTreeMap::new()),
                next_counter: AtomicU64::new(1),
                changes,
            }),
        }
    }

    /// Opens a new branch over `region` starting from `parents`.
    pub fn create_branch(&self, region: &Region, parents: RegionMap<Version>) -> ReactorResult<BranchId> {
        if region.is_empty() {
            return Err(ReactorError::InvalidBranch("branch region is empty".into()));
        }
        if parents.domain() != *region {
            return Err(ReactorError::InvalidBranch(format!(
                "origin covers {} but branch region is {region}",
                parents.domain()
            )));
        }
        for parent in parents.values() {
            if let Some(branch) = parent.branch {
                if !self.contains(branch) {
                    return Err(ReactorError::UnknownBranch(branch));
                }
            }
        }
        let initial_timestamp = parents.values().map(|v| v.timestamp).max().unwrap_or(0);
        let id = BranchId {
            peer: self.peer,
            counter: self.inner.next_counter.fetch_add(1, Ordering::Relaxed),
        };
        let record = BranchRecord {
            region: region.clone(),
            initial_timestamp,
            origin: parents,
        };
        let Ok(mut records) = self.inner.records.write() else {
            return Err(ReactorError::InvalidBranch("branch history lock poisoned".into()));
        };
        records.insert(id, record);
        let len = records.len();
        drop(records);
        self.inner.changes.send_replace(len);
        tracing::debug!(peer = self.peer, branch = %id, region = %region, "created branch");
        Ok(id)
    }

    pub fn get(&self, id: BranchId) -> Option<BranchRecord> {
        self.inner.records.read().ok()?.get(&id).cloned()
    }

    pub fn contains(&self, id: BranchId) -> bool {
        self.inner
            .records
            .read()
            .map(|records| records.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notified with the record count whenever a record is added.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.inner.changes.subscribe()
    }

    /// Every known record, for gossip to other peers.
    pub fn records(&self) -> Vec<(BranchId, BranchRecord)> {
        self.inner
            .records
            .read()
            .map(|records| records.iter().map(|(id, r)| (*id, r.clone())).collect())
            .unwrap_or_default()
    }

    /// Adds records learned from another peer. Returns how many were new.
    pub fn merge(&self, incoming: impl IntoIterator<Item = (BranchId, BranchRecord)>) -> usize {
        let Ok(mut records) = self.inner.records.write() else {
            return 0;
        };
        let mut added = 0;
        for (id, record) in incoming {
            if let std::collections::btree_map::Entry::Vacant(slot) = records.entry(id) {
                slot.insert(record);
                added += 1;
            }
        }
        let len = records.len();
        drop(records);
        if added > 0 {
            self.inner.changes.send_replace(len);
        }
        added
    }

    /// Direct parents of a branch, as recorded in its origin.
    fn parents(&self, id: BranchId) -> Vec<BranchId> {
        let Some(record) = self.get(id) else {
            return Vec::new();
        };
        let unique: BTreeSet<BranchId> = record.origin.values().filter_map(|v| v.branch).collect();
        unique.into_iter().collect()
    }

    /// Breadth-first distances from `id` to every known ancestor (itself at 0).
    fn ancestry(&self, id: BranchId) -> BTreeMap<BranchId, usize> {
        let mut distances = BTreeMap::new();
        let mut queue = VecDeque::from([(id, 0usize)]);
        while let Some((branch, distance)) = queue.pop_front() {
            if distances.contains_key(&branch) {
                continue;
            }
            distances.insert(branch, distance);
            for parent in self.parents(branch) {
                queue.push_back((parent, distance + 1));
            }
        }
        distances
    }

    /// True when `descendant` equals `ancestor` or descends from it.
    pub fn is_descendant(&self, descendant: BranchId, ancestor: BranchId) -> bool {
        self.ancestry(descendant).contains_key(&ancestor)
    }

    /// The shared ancestor closest to both branches, if any.
    pub fn most_recent_common_ancestor(&self, a: BranchId, b: BranchId) -> Option<BranchId> {
        let from_a = self.ancestry(a);
        let from_b = self.ancestry(b);
        from_a
            .iter()
            .filter_map(|(id, da)| from_b.get(id).map(|db| (da + db, (*da).max(*db), *id)))
            .min()
            .map(|(_, _, id)| id)
    }

    /// True when data at `ancestor` over `region` can be brought to
    /// `descendant` by applying only newer writes.
    pub fn version_is_ancestor(
        &self,
        ancestor: Version,
        descendant: Version,
        region: &Region,
    ) -> ReactorResult<bool> {
        if ancestor.is_zero() {
            return Ok(true);
        }
        let Some(branch) = descendant.branch else {
            return Ok(false);
        };
        if ancestor.branch == Some(branch) {
            return Ok(ancestor.timestamp <= descendant.timestamp);
        }
        let record = self.get(branch).ok_or(ReactorError::UnknownBranch(branch))?;
        let origin = record.origin.mask(region);
        if origin.is_empty() {
            return Ok(false);
        }
        for (piece, parent) in origin.iter() {
            if !self.version_is_ancestor(ancestor, *parent, &piece)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Piecewise [`Self::version_is_ancestor`] over two region maps.
    pub fn region_map_is_ancestor(
        &self,
        ancestor: &RegionMap<Version>,
        descendant: &RegionMap<Version>,
    ) -> ReactorResult<bool> {
        for (a_piece, a_version) in ancestor.iter() {
            for (d_piece, d_version) in descendant.mask(&a_piece).iter() {
                if !self.version_is_ancestor(*a_version, *d_version, &d_piece)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Returns the first branch referenced by `versions`, directly or through
    /// its ancestry, that this history does not know yet.
    pub fn certify<'a>(&self, versions: impl IntoIterator<Item = &'a Version>) -> Result<(), BranchId> {
        let mut pending: Vec<BranchId> = versions.into_iter().filter_map(|v| v.branch).collect();
        let mut seen = BTreeSet::new();
        while let Some(branch) = pending.pop() {
            if !seen.insert(branch) {
                continue;
            }
            let Some(record) = self.get(branch) else {
                return Err(branch);
            };
            pending.extend(record.origin.values().filter_map(|v| v.branch));
        }
        Ok(())
    }
}
