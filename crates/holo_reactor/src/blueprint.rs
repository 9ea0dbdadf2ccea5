//! Blueprints: the cluster-wide target assignment of roles to regions.
//!
//! A blueprint maps each peer to a tiling of the blueprint domain, with one
//! role per region. Blueprints are immutable values; a newer blueprint
//! replaces the previous one wholesale.
//!
//! Validation rules:
//! - every region is non-empty and inside the domain,
//! - a peer's regions are pairwise disjoint and their union is the domain
//!   (regions where the peer holds nothing are listed explicitly),
//! - every key of the domain has exactly one primary across all peers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ReactorError, ReactorResult};
use crate::network::PeerId;
use crate::region::{KeyRange, Region};

/// Role assigned to a peer for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Secondary,
    Nothing,
}

impl Role {
    fn from_char(c: char) -> Option<Role> {
        match c {
            'p' => Some(Role::Primary),
            's' => Some(Role::Secondary),
            'n' => Some(Role::Nothing),
            _ => None,
        }
    }
}

/// First byte of the letter keyspace used by role strings.
pub const LETTER_FIRST: u8 = b'a';
/// Number of letters in the letter keyspace.
pub const LETTER_COUNT: usize = 26;

/// The keys whose first byte is `a`..=`z`.
pub fn letter_domain() -> Region {
    Region::new(vec![LETTER_FIRST], vec![LETTER_FIRST + LETTER_COUNT as u8])
}

/// Shard `index` of `shards` equal slices of the letter keyspace.
pub fn letter_shard(index: usize, shards: usize) -> Region {
    let start = LETTER_FIRST + (index * LETTER_COUNT / shards) as u8;
    let end = LETTER_FIRST + ((index + 1) * LETTER_COUNT / shards) as u8;
    Region::from_range(KeyRange::bounded(vec![start], vec![end]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    pub domain: Region,
    pub peers_roles: BTreeMap<PeerId, BTreeMap<Region, Role>>,
}

/// One (peer, region, role) assignment overlapping a queried region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub peer: PeerId,
    pub region: Region,
    pub role: Role,
    /// Intersection of `region` with the queried region.
    pub overlap: Region,
}

impl Blueprint {
    pub fn new(domain: Region) -> Self {
        Self {
            domain,
            peers_roles: BTreeMap::new(),
        }
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers_roles.entry(peer).or_default();
    }

    pub fn add_role(&mut self, peer: PeerId, region: Region, role: Role) {
        self.peers_roles.entry(peer).or_default().insert(region, role);
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers_roles.keys().copied()
    }

    pub fn roles_for(&self, peer: PeerId) -> Option<&BTreeMap<Region, Role>> {
        self.peers_roles.get(&peer)
    }

    /// Assignments of every peer whose region overlaps `region`.
    pub fn assignments_overlapping(&self, region: &Region) -> Vec<Assignment> {
        let mut out = Vec::new();
        for (peer, roles) in &self.peers_roles {
            for (assigned, role) in roles {
                let overlap = assigned.intersect(region);
                if !overlap.is_empty() {
                    out.push(Assignment {
                        peer: *peer,
                        region: assigned.clone(),
                        role: *role,
                        overlap,
                    });
                }
            }
        }
        out
    }

    /// Checks the tiling rules; a blueprint failing them is never applied.
    pub fn validate(&self) -> ReactorResult<()> {
        if self.domain.is_empty() {
            return Err(malformed("blueprint domain is empty"));
        }
        let mut primaries = Region::empty();
        for (peer, roles) in &self.peers_roles {
            let mut covered = Region::empty();
            for (region, role) in roles {
                if region.is_empty() {
                    return Err(malformed(format!("peer {peer} has an empty region")));
                }
                if !self.domain.covers(region) {
                    return Err(malformed(format!(
                        "peer {peer} region {region} lies outside domain {}",
                        self.domain
                    )));
                }
                if covered.overlaps(region) {
                    return Err(malformed(format!(
                        "peer {peer} region {region} overlaps {}",
                        covered.intersect(region)
                    )));
                }
                covered = covered.union(region);
                if *role == Role::Primary {
                    if primaries.overlaps(region) {
                        return Err(malformed(format!(
                            "more than one primary for {}",
                            primaries.intersect(region)
                        )));
                    }
                    primaries = primaries.union(region);
                }
            }
            if covered != self.domain {
                return Err(malformed(format!(
                    "peer {peer} leaves {} unassigned",
                    self.domain.subtract(&covered)
                )));
            }
        }
        if primaries != self.domain {
            return Err(malformed(format!(
                "no primary for {}",
                self.domain.subtract(&primaries)
            )));
        }
        Ok(())
    }

    /// Builds a blueprint over the letter keyspace from a role string such as
    /// `"p,s,n"` or `"pn,np"`.
    ///
    /// Token `i` describes `peers[i]`. A token of length `n` cuts the letter
    /// keyspace into `n` shards, and its characters give the peer's role for
    /// each shard in order: `p` primary, `s` secondary, `n` nothing.
    pub fn from_role_string(roles: &str, peers: &[PeerId]) -> ReactorResult<Blueprint> {
        let tokens: Vec<&str> = roles.split(',').map(str::trim).collect();
        if tokens.len() != peers.len() {
            return Err(malformed(format!(
                "role string {roles:?} names {} peers, cluster has {}",
                tokens.len(),
                peers.len()
            )));
        }
        let mut blueprint = Blueprint::new(letter_domain());
        for (token, peer) in tokens.iter().zip(peers) {
            blueprint.add_peer(*peer);
            let shards = token.chars().count();
            if shards == 0 || shards > LETTER_COUNT {
                return Err(malformed(format!(
                    "role token {token:?} must have 1 to {LETTER_COUNT} shards"
                )));
            }
            for (index, c) in token.chars().enumerate() {
                let role = Role::from_char(c).ok_or_else(|| {
                    malformed(format!("unknown role {c:?} in role string {roles:?}"))
                })?;
                blueprint.add_role(*peer, letter_shard(index, shards), role);
            }
        }
        blueprint.validate()?;
        Ok(blueprint)
    }
}

fn malformed(reason: impl Into<String>) -> ReactorError {
    ReactorError::MalformedBlueprint(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u8, end: u8) -> Region {
        Region::new(vec![start], vec![end])
    }

    #[test]
    fn role_string_assigns_letter_shards() {
        let blueprint = Blueprint::from_role_string("pn,np", &[0, 1]).expect("valid blueprint");
        let first = blueprint.roles_for(0).expect("peer 0 present");
        assert_eq!(first.get(&region(b'a', b'n')), Some(&Role::Primary));
        assert_eq!(first.get(&region(b'n', b'{')), Some(&Role::Nothing));
        let second = blueprint.roles_for(1).expect("peer 1 present");
        assert_eq!(second.get(&region(b'n', b'{')), Some(&Role::Primary));
    }

    #[test]
    fn single_role_token_covers_whole_domain() {
        let blueprint = Blueprint::from_role_string("p,s,n", &[0, 1, 2]).expect("valid blueprint");
        for peer in 0..3 {
            let roles = blueprint.roles_for(peer).expect("peer present");
            assert_eq!(roles.len(), 1);
            assert!(roles.contains_key(&letter_domain()));
        }
    }

    #[test]
    fn letter_shards_tile_the_domain() {
        for shards in 1..=LETTER_COUNT {
            let mut covered = Region::empty();
            for index in 0..shards {
                let shard = letter_shard(index, shards);
                assert!(!shard.is_empty(), "shard {index}/{shards} is empty");
                assert!(covered.is_disjoint(&shard));
                covered = covered.union(&shard);
            }
            assert_eq!(covered, letter_domain());
        }
    }

    #[test]
    fn rejects_unknown_role_and_peer_count_mismatch() {
        match Blueprint::from_role_string("p,x", &[0, 1]) {
            Err(ReactorError::MalformedBlueprint(reason)) => assert!(reason.contains("'x'")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            Blueprint::from_role_string("p,n", &[0, 1, 2]),
            Err(ReactorError::MalformedBlueprint(_))
        ));
    }

    #[test]
    fn rejects_two_primaries_and_missing_primary() {
        assert!(matches!(
            Blueprint::from_role_string("p,p", &[0, 1]),
            Err(ReactorError::MalformedBlueprint(_))
        ));
        assert!(matches!(
            Blueprint::from_role_string("s,n", &[0, 1]),
            Err(ReactorError::MalformedBlueprint(_))
        ));
    }

    #[test]
    fn rejects_gaps_and_overlaps_within_a_peer() {
        let mut gap = Blueprint::new(letter_domain());
        gap.add_role(0, region(b'a', b'm'), Role::Primary);
        gap.add_role(0, region(b'n', b'{'), Role::Primary);
        match gap.validate() {
            Err(ReactorError::MalformedBlueprint(reason)) => assert!(reason.contains("unassigned")),
            other => panic!("unexpected result: {other:?}"),
        }

        let mut overlap = Blueprint::new(letter_domain());
        overlap.add_role(0, region(b'a', b'o'), Role::Primary);
        overlap.add_role(0, region(b'n', b'{'), Role::Primary);
        match overlap.validate() {
            Err(ReactorError::MalformedBlueprint(reason)) => assert!(reason.contains("overlaps")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_region_outside_domain() {
        let mut outside = Blueprint::new(letter_domain());
        outside.add_role(0, Region::new(b"A".to_vec(), b"{".to_vec()), Role::Primary);
        assert!(matches!(
            outside.validate(),
            Err(ReactorError::MalformedBlueprint(_))
        ));
    }

    #[test]
    fn assignments_overlapping_reports_intersection() {
        let blueprint = Blueprint::from_role_string("pp,ns", &[0, 1]).expect("valid blueprint");
        let found = blueprint.assignments_overlapping(&region(b'm', b'p'));
        let secondaries: Vec<_> = found
            .iter()
            .filter(|a| a.role == Role::Secondary)
            .collect();
        assert_eq!(secondaries.len(), 1);
        assert_eq!(secondaries[0].peer, 1);
        assert_eq!(secondaries[0].overlap, region(b'n', b'p'));
    }
}
