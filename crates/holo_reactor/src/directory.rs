//! Published reactor state.
//!
//! Each peer publishes a [`ReactorCard`]: its activities keyed by a local
//! activity id, each with the region it covers and what the replica is
//! doing there. Data-bearing activities carry a backfiller address; a
//! primary also carries the addresses routers and secondaries talk to.
//!
//! This module also hosts the read-side helpers: the blueprint satisfaction
//! check behind `wait_until_blueprint_satisfied`, the "primary locations"
//! view routers use, and the overlapping-primary check used as a safety
//! monitor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backfill::BackfillRequest;
use crate::blueprint::{Blueprint, Role};
use crate::branch::{BranchId, Version};
use crate::broadcast::{ListenerRequest, MasterRequest};
use crate::echo::EchoWrapper;
use crate::error::{millis, ReactorError, ReactorResult};
use crate::network::{ClusterDirectory, Mailbox, PeerId};
use crate::region::{Region, RegionMap};

pub type ActivityId = u64;

/// What a replica is doing for one region.
#[derive(Clone, Debug, PartialEq)]
pub enum ActivityCard {
    /// Holds no data for the region.
    Nothing,
    /// Revoked, but keeps its data until the new owners are up to date.
    NothingWhenSafe {
        version: RegionMap<Version>,
        backfiller: Mailbox<BackfillRequest>,
    },
    /// Catching up; `source` is the primary it registered with, if any.
    SecondaryBackfilling { source: Option<PeerId> },
    /// Holds complete data at `version` but no primary is available.
    SecondaryWithoutPrimary {
        version: RegionMap<Version>,
        backfiller: Mailbox<BackfillRequest>,
    },
    SecondaryUpToDate {
        branch: BranchId,
        primary: PeerId,
        backfiller: Mailbox<BackfillRequest>,
    },
    /// Primary-elect; `branch` is set once the new branch exists.
    PrimaryNotInCharge { branch: Option<BranchId> },
    Primary {
        branch: BranchId,
        master: Mailbox<MasterRequest>,
        broadcaster: Mailbox<ListenerRequest>,
        backfiller: Mailbox<BackfillRequest>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    Nothing,
    NothingWhenSafe,
    SecondaryBackfilling,
    SecondaryWithoutPrimary,
    SecondaryUpToDate,
    PrimaryNotInCharge,
    Primary,
}

impl ActivityKind {
    /// The activity that satisfies a blueprint role.
    pub fn satisfying(role: Role) -> ActivityKind {
        match role {
            Role::Primary => ActivityKind::Primary,
            Role::Secondary => ActivityKind::SecondaryUpToDate,
            Role::Nothing => ActivityKind::Nothing,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ActivityCard {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityCard::Nothing => ActivityKind::Nothing,
            ActivityCard::NothingWhenSafe { .. } => ActivityKind::NothingWhenSafe,
            ActivityCard::SecondaryBackfilling { .. } => ActivityKind::SecondaryBackfilling,
            ActivityCard::SecondaryWithoutPrimary { .. } => ActivityKind::SecondaryWithoutPrimary,
            ActivityCard::SecondaryUpToDate { .. } => ActivityKind::SecondaryUpToDate,
            ActivityCard::PrimaryNotInCharge { .. } => ActivityKind::PrimaryNotInCharge,
            ActivityCard::Primary { .. } => ActivityKind::Primary,
        }
    }

    pub fn backfiller(&self) -> Option<&Mailbox<BackfillRequest>> {
        match self {
            ActivityCard::NothingWhenSafe { backfiller, .. }
            | ActivityCard::SecondaryWithoutPrimary { backfiller, .. }
            | ActivityCard::SecondaryUpToDate { backfiller, .. }
            | ActivityCard::Primary { backfiller, .. } => Some(backfiller),
            _ => None,
        }
    }

    /// Version advertised by replicas that hold data without a primary.
    pub fn advertised_version(&self) -> Option<&RegionMap<Version>> {
        match self {
            ActivityCard::NothingWhenSafe { version, .. }
            | ActivityCard::SecondaryWithoutPrimary { version, .. } => Some(version),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActivityEntry {
    pub region: Region,
    pub card: ActivityCard,
    /// Why the activity is not progressing, once it has stalled for a while.
    pub blocked: Option<String>,
}

/// A peer's "current activities" value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReactorCard {
    pub activities: BTreeMap<ActivityId, ActivityEntry>,
}

impl ReactorCard {
    pub fn overlapping<'a>(&'a self, region: &'a Region) -> impl Iterator<Item = &'a ActivityEntry> + 'a {
        self.activities
            .values()
            .filter(move |entry| entry.region.overlaps(region))
    }

    pub fn summary(&self) -> Vec<ActivitySummary> {
        self.activities
            .values()
            .map(|entry| ActivitySummary {
                region: entry.region.to_string(),
                kind: entry.card.kind(),
                blocked: entry.blocked.clone(),
            })
            .collect()
    }
}

pub type DirectoryView = BTreeMap<PeerId, EchoWrapper<ReactorCard>>;
pub type ReactorDirectory = ClusterDirectory<EchoWrapper<ReactorCard>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub region: String,
    pub kind: ActivityKind,
    pub blocked: Option<String>,
}

/// A blueprint assignment the directory does not reflect yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub peer: PeerId,
    pub region: String,
    pub expected: Role,
    /// Activity advertised for exactly that region, if any.
    pub observed: Option<ActivityKind>,
    pub blocked: Option<String>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {} {}: expected {:?}, ", self.peer, self.region, self.expected)?;
        match self.observed {
            Some(kind) => write!(f, "observed {kind}")?,
            None => write!(f, "observed nothing")?,
        }
        if let Some(reason) = &self.blocked {
            write!(f, " (blocked: {reason})")?;
        }
        Ok(())
    }
}

/// Every blueprint assignment not matched by an activity over exactly the
/// same region with the satisfying kind.
pub fn blueprint_mismatches(blueprint: &Blueprint, view: &DirectoryView) -> Vec<Mismatch> {
    let mut out = Vec::new();
    for (peer, roles) in &blueprint.peers_roles {
        let card = view.get(peer).map(|wrapper| &wrapper.internal);
        for (region, role) in roles {
            let entry = card.and_then(|card| {
                card.activities
                    .values()
                    .find(|entry| entry.region == *region)
            });
            let observed = entry.map(|e| e.card.kind());
            if observed == Some(ActivityKind::satisfying(*role)) {
                continue;
            }
            out.push(Mismatch {
                peer: *peer,
                region: region.to_string(),
                expected: *role,
                observed,
                blocked: entry.and_then(|e| e.blocked.clone()),
            });
        }
    }
    out
}

pub fn is_blueprint_satisfied(blueprint: &Blueprint, view: &DirectoryView) -> bool {
    blueprint_mismatches(blueprint, view).is_empty()
}

/// Blocks until `view` satisfies `blueprint` or `timeout` elapses.
///
/// On timeout the error carries the mismatches of the last observed view.
pub async fn wait_until_blueprint_satisfied(
    view: &mut watch::Receiver<Arc<DirectoryView>>,
    blueprint: &Blueprint,
    timeout: Duration,
) -> ReactorResult<()> {
    let wait = async {
        loop {
            let satisfied = is_blueprint_satisfied(blueprint, &view.borrow_and_update());
            if satisfied {
                return Ok(());
            }
            view.changed()
                .await
                .map_err(|_| ReactorError::Interrupted)?;
        }
    };
    let result = tokio::time::timeout(timeout, wait).await;
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(ReactorError::WaitTimeout {
            timeout_ms: millis(timeout),
            mismatches: blueprint_mismatches(blueprint, &view.borrow()),
        }),
    }
}

/// Where writes for a region go.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryLocation {
    pub peer: PeerId,
    pub region: Region,
    pub branch: BranchId,
    pub master: Mailbox<MasterRequest>,
}

/// The cluster's "master/primary locations" value.
pub fn primary_locations(view: &DirectoryView) -> Vec<PrimaryLocation> {
    let mut out = Vec::new();
    for (peer, wrapper) in view {
        for entry in wrapper.internal.activities.values() {
            if let ActivityCard::Primary { branch, master, .. } = &entry.card {
                out.push(PrimaryLocation {
                    peer: *peer,
                    region: entry.region.clone(),
                    branch: *branch,
                    master: master.clone(),
                });
            }
        }
    }
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimaryConflict {
    pub first: PeerId,
    pub second: PeerId,
    pub overlap: Region,
}

/// Pairs of primary activities whose regions overlap.
pub fn primary_conflicts(view: &DirectoryView) -> Vec<PrimaryConflict> {
    let primaries = primary_locations(view);
    let mut out = Vec::new();
    for (idx, first) in primaries.iter().enumerate() {
        for second in &primaries[idx + 1..] {
            let overlap = first.region.intersect(&second.region);
            if !overlap.is_empty() {
                out.push(PrimaryConflict {
                    first: first.peer,
                    second: second.peer,
                    overlap,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::letter_domain;
    use crate::echo::EchoAck;
    use crate::network::Network;

    struct ViewBuilder {
        network: Network,
        view: DirectoryView,
        next_id: ActivityId,
    }

    impl ViewBuilder {
        fn new() -> Self {
            Self {
                network: Network::new(),
                view: DirectoryView::new(),
                next_id: 1,
            }
        }

        fn activity(&mut self, peer: PeerId, region: Region, card: ActivityCard) -> &mut Self {
            let (ack_mailbox, _rx) = self.network.mailbox::<EchoAck>(peer);
            let wrapper = self.view.entry(peer).or_insert_with(|| EchoWrapper {
                internal: ReactorCard::default(),
                version: 1,
                ack_mailbox,
            });
            wrapper.internal.activities.insert(
                self.next_id,
                ActivityEntry {
                    region,
                    card,
                    blocked: None,
                },
            );
            self.next_id += 1;
            self
        }

        fn primary(&mut self, peer: PeerId, region: Region) -> &mut Self {
            let (master, _m) = self.network.mailbox(peer);
            let (broadcaster, _b) = self.network.mailbox(peer);
            let (backfiller, _f) = self.network.mailbox(peer);
            let card = ActivityCard::Primary {
                branch: BranchId { peer, counter: 1 },
                master,
                broadcaster,
                backfiller,
            };
            self.activity(peer, region, card)
        }
    }

    #[test]
    fn satisfied_when_every_region_matches_exactly() {
        let blueprint = Blueprint::from_role_string("p,n", &[0, 1]).expect("blueprint");
        let mut builder = ViewBuilder::new();
        builder
            .primary(0, letter_domain())
            .activity(1, letter_domain(), ActivityCard::Nothing);
        assert!(is_blueprint_satisfied(&blueprint, &builder.view));
    }

    #[test]
    fn reports_missing_peers_and_wrong_kinds() {
        let blueprint = Blueprint::from_role_string("p,s,n", &[0, 1, 2]).expect("blueprint");
        let mut builder = ViewBuilder::new();
        builder.primary(0, letter_domain()).activity(
            1,
            letter_domain(),
            ActivityCard::SecondaryBackfilling { source: Some(0) },
        );
        let mismatches = blueprint_mismatches(&blueprint, &builder.view);
        assert_eq!(mismatches.len(), 2);
        assert_eq!(mismatches[0].peer, 1);
        assert_eq!(
            mismatches[0].observed,
            Some(ActivityKind::SecondaryBackfilling)
        );
        assert_eq!(mismatches[1].peer, 2);
        assert_eq!(mismatches[1].observed, None);
    }

    #[test]
    fn differently_shaped_region_does_not_satisfy() {
        let blueprint = Blueprint::from_role_string("pp,nn", &[0, 1]).expect("blueprint");
        let mut builder = ViewBuilder::new();
        builder
            .primary(0, letter_domain())
            .activity(1, letter_domain(), ActivityCard::Nothing);
        let mismatches = blueprint_mismatches(&blueprint, &builder.view);
        assert_eq!(mismatches.len(), 4);
    }

    #[test]
    fn detects_overlapping_primaries() {
        let (left, right) = letter_domain().split_at(b"n");
        let mut builder = ViewBuilder::new();
        builder.primary(0, left.clone()).primary(1, right);
        assert!(primary_conflicts(&builder.view).is_empty());
        assert_eq!(primary_locations(&builder.view).len(), 2);

        builder.primary(2, Region::new(b"m".to_vec(), b"p".to_vec()));
        let conflicts = primary_conflicts(&builder.view);
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().all(|c| c.second == 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_times_out_with_last_mismatches() {
        let blueprint = Blueprint::from_role_string("p,n", &[0, 1]).expect("blueprint");
        let mut builder = ViewBuilder::new();
        builder.primary(0, letter_domain());
        let (_tx, mut rx) = watch::channel(Arc::new(builder.view.clone()));

        match wait_until_blueprint_satisfied(&mut rx, &blueprint, Duration::from_millis(50)).await {
            Err(ReactorError::WaitTimeout { mismatches, .. }) => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].peer, 1);
                assert_eq!(mismatches[0].expected, Role::Nothing);
            }
            other => panic!("unexpected wait result: {other:?}"),
        }
    }
}
