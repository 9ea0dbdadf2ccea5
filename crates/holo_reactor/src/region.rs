//! Keyspace region algebra.
//!
//! Keys are opaque byte strings ordered lexicographically. A [`KeyRange`] is
//! start-inclusive and end-exclusive, with an optional unbounded end. A
//! [`Region`] is a normalized union of disjoint, non-adjacent ranges, so two
//! regions covering the same keys always compare equal.
//!
//! [`RegionMap`] tiles a region with values. Replica metadata (which version
//! each part of a store is at) and branch origins (which parent version each
//! part of a branch started from) are both region maps, which is what lets
//! split and merge be expressed without special cases.

use std::cmp::{max, min};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type Key = Vec<u8>;

/// Exclusive end of a key range. `Unbounded` sorts after every key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RangeEnd {
    Key(Key),
    Unbounded,
}

impl RangeEnd {
    /// Returns true when `key` lies strictly before this end.
    fn admits(&self, key: &[u8]) -> bool {
        match self {
            RangeEnd::Key(end) => key < end.as_slice(),
            RangeEnd::Unbounded => true,
        }
    }
}

/// Half-open key interval `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: RangeEnd,
}

impl KeyRange {
    pub fn new(start: impl Into<Key>, end: RangeEnd) -> Self {
        Self {
            start: start.into(),
            end,
        }
    }

    pub fn bounded(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self::new(start, RangeEnd::Key(end.into()))
    }

    pub fn from_start(start: impl Into<Key>) -> Self {
        Self::new(start, RangeEnd::Unbounded)
    }

    pub fn is_empty(&self) -> bool {
        !self.end.admits(&self.start)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_slice() && self.end.admits(key)
    }

    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let range = KeyRange {
            start: max(&self.start, &other.start).clone(),
            end: min(&self.end, &other.end).clone(),
        };
        (!range.is_empty()).then_some(range)
    }

    /// Removes `other` from this range, leaving zero, one or two pieces.
    pub fn subtract(&self, other: &KeyRange) -> Vec<KeyRange> {
        if self.intersect(other).is_none() {
            return vec![self.clone()];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.start < other.start {
            pieces.push(KeyRange::bounded(self.start.clone(), other.start.clone()));
        }
        if let RangeEnd::Key(other_end) = &other.end {
            if self.end.admits(other_end) {
                pieces.push(KeyRange::new(other_end.clone(), self.end.clone()));
            }
        }
        pieces
    }

    /// True when `next` (which must not start before `self`) overlaps or abuts
    /// this range.
    fn touches(&self, next: &KeyRange) -> bool {
        match &self.end {
            RangeEnd::Key(end) => next.start <= *end,
            RangeEnd::Unbounded => true,
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", self.start.escape_ascii())?;
        match &self.end {
            RangeEnd::Key(end) => write!(f, "{})", end.escape_ascii()),
            RangeEnd::Unbounded => write!(f, "+inf)"),
        }
    }
}

/// A finite union of key ranges, kept sorted, disjoint and non-adjacent.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Region {
    ranges: Vec<KeyRange>,
}

impl Region {
    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Every key, including the empty key.
    pub fn universe() -> Self {
        Self::from_range(KeyRange::from_start(Vec::new()))
    }

    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self::from_range(KeyRange::bounded(start, end))
    }

    /// The region holding exactly `key`.
    pub fn point(key: &[u8]) -> Self {
        let mut end = key.to_vec();
        end.push(0);
        Self::new(key.to_vec(), end)
    }

    pub fn from_range(range: KeyRange) -> Self {
        Self::from_ranges(vec![range])
    }

    pub fn from_ranges(ranges: Vec<KeyRange>) -> Self {
        Self {
            ranges: normalize(ranges),
        }
    }

    pub fn ranges(&self) -> &[KeyRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.ranges.iter().any(|r| r.contains(key))
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                if let Some(range) = a.intersect(b) {
                    out.push(range);
                }
            }
        }
        Region::from_ranges(out)
    }

    pub fn union(&self, other: &Region) -> Region {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Region::from_ranges(ranges)
    }

    pub fn subtract(&self, other: &Region) -> Region {
        let mut remaining = self.ranges.clone();
        for cut in &other.ranges {
            remaining = remaining.iter().flat_map(|r| r.subtract(cut)).collect();
        }
        Region::from_ranges(remaining)
    }

    /// True when every key of `other` is also in `self`.
    pub fn covers(&self, other: &Region) -> bool {
        other.subtract(self).is_empty()
    }

    pub fn is_disjoint(&self, other: &Region) -> bool {
        self.intersect(other).is_empty()
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.is_disjoint(other)
    }

    /// Splits into the keys strictly before `key` and the keys from `key` on.
    pub fn split_at(&self, key: &[u8]) -> (Region, Region) {
        let left = Region::new(Vec::new(), key.to_vec());
        let right = Region::from_range(KeyRange::from_start(key.to_vec()));
        (self.intersect(&left), self.intersect(&right))
    }
}

impl From<KeyRange> for Region {
    fn from(range: KeyRange) -> Self {
        Region::from_range(range)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "{{}}");
        }
        for (idx, range) in self.ranges.iter().enumerate() {
            if idx > 0 {
                write!(f, " + ")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

fn normalize(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort();
    let mut out: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = out.last_mut() {
            if last.touches(&range) {
                if range.end > last.end {
                    last.end = range.end;
                }
                continue;
            }
        }
        out.push(range);
    }
    out
}

/// Values attached to disjoint pieces of a region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionMap<V> {
    entries: Vec<(KeyRange, V)>,
}

impl<V> Default for RegionMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: Clone> RegionMap<V> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(region: &Region, value: V) -> Self {
        Self {
            entries: region
                .ranges()
                .iter()
                .map(|r| (r.clone(), value.clone()))
                .collect(),
        }
    }

    pub fn entries(&self) -> &[(KeyRange, V)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn domain(&self) -> Region {
        Region::from_ranges(self.entries.iter().map(|(r, _)| r.clone()).collect())
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains(key))
            .map(|(_, value)| value)
    }

    /// Restricts the map to the keys of `region`.
    pub fn mask(&self, region: &Region) -> RegionMap<V> {
        let mut entries = Vec::new();
        for (range, value) in &self.entries {
            for cut in region.ranges() {
                if let Some(piece) = range.intersect(cut) {
                    entries.push((piece, value.clone()));
                }
            }
        }
        RegionMap { entries }
    }

    /// Iterates the pieces as single-range regions.
    pub fn iter(&self) -> impl Iterator<Item = (Region, &V)> + '_ {
        self.entries
            .iter()
            .map(|(range, value)| (Region::from_range(range.clone()), value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries.iter().map(|(_, value)| value)
    }
}

impl<V: Clone + PartialEq> RegionMap<V> {
    /// Assigns `value` to every key of `region`, replacing what was there.
    pub fn set(&mut self, region: &Region, value: V) {
        let mut kept = Vec::with_capacity(self.entries.len() + region.ranges().len());
        for (range, existing) in self.entries.drain(..) {
            let mut pieces = vec![range];
            for cut in region.ranges() {
                pieces = pieces.iter().flat_map(|p| p.subtract(cut)).collect();
            }
            kept.extend(pieces.into_iter().map(|p| (p, existing.clone())));
        }
        kept.extend(region.ranges().iter().map(|r| (r.clone(), value.clone())));
        kept.sort_by(|a, b| a.0.cmp(&b.0));
        self.entries = kept;
        self.coalesce();
    }

    pub fn map<U: Clone + PartialEq>(&self, f: impl Fn(&V) -> U) -> RegionMap<U> {
        let mut out = RegionMap {
            entries: self
                .entries
                .iter()
                .map(|(range, value)| (range.clone(), f(value)))
                .collect(),
        };
        out.coalesce();
        out
    }

    /// The single value covering the whole map, if there is one.
    pub fn uniform(&self) -> Option<&V> {
        let (_, first) = self.entries.first()?;
        self.entries
            .iter()
            .all(|(_, value)| value == first)
            .then_some(first)
    }

    fn coalesce(&mut self) {
        let mut out: Vec<(KeyRange, V)> = Vec::with_capacity(self.entries.len());
        for (range, value) in self.entries.drain(..) {
            if let Some((last, last_value)) = out.last_mut() {
                if *last_value == value && last.end == RangeEnd::Key(range.start.clone()) {
                    last.end = range.end;
                    continue;
                }
            }
            out.push((range, value));
        }
        self.entries = out;
    }
}
