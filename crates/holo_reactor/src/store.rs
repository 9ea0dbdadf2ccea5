use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::branch::{Version, VersionRange};
use crate::region::{Key, RangeEnd, Region, RegionMap};

/// A key, its value, and the version of the write that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: Key,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Atomic copy of a region's metadata and contents.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    pub metainfo: RegionMap<VersionRange>,
    pub entries: Vec<StoredEntry>,
}

/// Unit of backfill data applied to a target store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreChunk {
    /// Drop every key of the region before newer entries arrive.
    Reset(Region),
    Set(StoredEntry),
}

/// Replica storage consumed by the reactor.
///
/// Metadata is a region map of version ranges covering the whole store. The
/// reactor reads and writes data only through this trait.
pub trait ReplicaStore: Send + Sync + 'static {
    fn read(&self, key: &[u8]) -> Option<StoredEntry>;
    fn read_range(&self, region: &Region) -> Vec<StoredEntry>;

    /// Stores `entry` and stamps `region` as being at `entry.version`.
    fn write(&self, region: &Region, entry: StoredEntry);

    fn metainfo(&self, region: &Region) -> RegionMap<VersionRange>;
    fn set_metainfo(&self, region: &Region, value: VersionRange);
    fn snapshot(&self, region: &Region) -> StoreSnapshot;

    fn apply_chunk(&self, chunk: &StoreChunk);
    fn apply_chunks(&self, chunks: &[StoreChunk]) {
        for chunk in chunks {
            self.apply_chunk(chunk);
        }
    }

    /// Drops every key of `region` and resets its metadata to zero.
    fn erase(&self, region: &Region);
}

/// In-memory [`ReplicaStore`].
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

struct MemoryInner {
    rows: BTreeMap<Key, (Vec<u8>, Version)>,
    metainfo: RegionMap<VersionRange>,
}

impl MemoryStore {
    /// An empty store whose whole keyspace is at version zero.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                rows: BTreeMap::new(),
                metainfo: RegionMap::new(&Region::universe(), VersionRange::zero()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInner {
    fn range(&self, region: &Region) -> Vec<StoredEntry> {
        let mut out = Vec::new();
        for range in region.ranges() {
            let upper = match &range.end {
                RangeEnd::Key(end) => Bound::Excluded(end.clone()),
                RangeEnd::Unbounded => Bound::Unbounded,
            };
            let rows = self
                .rows
                .range::<Key, _>((Bound::Included(range.start.clone()), upper));
            out.extend(rows.map(|(key, (value, version))| StoredEntry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            }));
        }
        out
    }

    fn remove_range(&mut self, region: &Region) {
        let doomed: Vec<Key> = self.range(region).into_iter().map(|e| e.key).collect();
        for key in doomed {
            self.rows.remove(&key);
        }
    }
}

impl ReplicaStore for MemoryStore {
    fn read(&self, key: &[u8]) -> Option<StoredEntry> {
        let guard = self.inner.read().ok()?;
        let (value, version) = guard.rows.get(key)?;
        Some(StoredEntry {
            key: key.to_vec(),
            value: value.clone(),
            version: *version,
        })
    }

    fn read_range(&self, region: &Region) -> Vec<StoredEntry> {
        self.inner
            .read()
            .map(|g| g.range(region))
            .unwrap_or_default()
    }

    fn write(&self, region: &Region, entry: StoredEntry) {
        if let Ok(mut guard) = self.inner.write() {
            guard
                .metainfo
                .set(region, VersionRange::coherent(entry.version));
            guard.rows.insert(entry.key, (entry.value, entry.version));
        }
    }

    fn metainfo(&self, region: &Region) -> RegionMap<VersionRange> {
        self.inner
            .read()
            .map(|g| g.metainfo.mask(region))
            .unwrap_or_default()
    }

    fn set_metainfo(&self, region: &Region, value: VersionRange) {
        if let Ok(mut guard) = self.inner.write() {
            guard.metainfo.set(region, value);
        }
    }

    fn snapshot(&self, region: &Region) -> StoreSnapshot {
        match self.inner.read() {
            Ok(guard) => StoreSnapshot {
                metainfo: guard.metainfo.mask(region),
                entries: guard.range(region),
            },
            Err(_) => StoreSnapshot {
                metainfo: RegionMap::empty(),
                entries: Vec::new(),
            },
        }
    }

    fn apply_chunk(&self, chunk: &StoreChunk) {
        if let Ok(mut guard) = self.inner.write() {
            match chunk {
                StoreChunk::Reset(region) => guard.remove_range(region),
                StoreChunk::Set(entry) => {
                    guard
                        .rows
                        .insert(entry.key.clone(), (entry.value.clone(), entry.version));
                }
            }
        }
    }

    fn erase(&self, region: &Region) {
        if let Ok(mut guard) = self.inner.write() {
            guard.remove_range(region);
            guard.metainfo.set(region, VersionRange::zero());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchId;

    fn entry(key: &str, value: &str, version: Version) -> StoredEntry {
        StoredEntry {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            version,
        }
    }

    fn branch() -> BranchId {
        BranchId { peer: 1, counter: 1 }
    }

    #[test]
    fn write_stamps_region_metadata() {
        let store = MemoryStore::new();
        let left = Region::new(b"a".to_vec(), b"n".to_vec());
        let right = Region::new(b"n".to_vec(), b"{".to_vec());
        let version = Version::new(branch(), 1);
        store.write(&left, entry("cat", "meow", version));

        assert_eq!(store.read(b"cat").map(|e| e.value), Some(b"meow".to_vec()));
        let meta = store.metainfo(&left.union(&right));
        assert_eq!(meta.get(b"c"), Some(&VersionRange::coherent(version)));
        assert_eq!(meta.get(b"x"), Some(&VersionRange::zero()));
    }

    #[test]
    fn read_range_and_erase_respect_bounds() {
        let store = MemoryStore::new();
        let whole = Region::universe();
        let version = Version::new(branch(), 1);
        for key in ["apple", "mango", "nectarine", "zebra"] {
            store.write(&whole, entry(key, key, version));
        }
        let left = Region::new(b"a".to_vec(), b"n".to_vec());
        let keys: Vec<_> = store.read_range(&left).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"mango".to_vec()]);

        store.erase(&left);
        assert_eq!(store.len(), 2);
        assert_eq!(store.metainfo(&left).uniform(), Some(&VersionRange::zero()));
        assert!(store.read(b"nectarine").is_some());
    }

    #[test]
    fn chunks_reset_and_set_without_touching_metadata() {
        let store = MemoryStore::new();
        let whole = Region::universe();
        let old = Version::new(branch(), 1);
        store.write(&whole, entry("a", "old", old));
        store.write(&whole, entry("b", "old", old));

        let newer = Version::new(branch(), 2);
        store.apply_chunks(&[
            StoreChunk::Reset(whole.clone()),
            StoreChunk::Set(entry("b", "new", newer)),
        ]);
        assert!(store.read(b"a").is_none());
        assert_eq!(store.read(b"b").map(|e| e.version), Some(newer));
        assert_eq!(
            store.metainfo(&whole).uniform(),
            Some(&VersionRange::coherent(old))
        );
    }
}
