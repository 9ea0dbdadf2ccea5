//! Primary driver.
//!
//! A primary-elect first waits for a quiet cluster: every blueprint peer
//! present, nobody else serving or electing for the region, and every other
//! peer's state for the region advertised. It then brings its data up to the
//! newest complete version any peer advertises, opens a branch, and makes
//! every blueprint peer acknowledge its claim before taking writes.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use super::{interruptible, wait_cluster, ClusterState, ReactorContext};
use crate::advertiser::ActivityHandle;
use crate::backfill::{BackfillRequest, Backfiller};
use crate::branch::{BranchHistory, Version, VersionRange};
use crate::broadcast::{Broadcaster, BroadcasterSettings};
use crate::directory::{ActivityCard, ActivityKind, DirectoryView};
use crate::error::{ReactorError, ReactorResult};
use crate::network::{Mailbox, PeerId};
use crate::region::{Region, RegionMap};

/// Another peer's data that could seed the new branch.
struct Candidate {
    peer: PeerId,
    version: RegionMap<Version>,
    backfiller: Mailbox<BackfillRequest>,
}

/// Part of the region to fetch from a candidate before branching.
struct Pull {
    peer: PeerId,
    region: Region,
    backfiller: Mailbox<BackfillRequest>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Holder {
    Local,
    Remote(usize),
}

/// First peer other than `me` that serves or is electing for `region`.
fn contender(me: PeerId, region: &Region, view: &DirectoryView) -> Option<String> {
    for (peer, wrapper) in view {
        if *peer == me {
            continue;
        }
        for entry in wrapper.internal.overlapping(region) {
            let kind = entry.card.kind();
            if matches!(kind, ActivityKind::Primary | ActivityKind::PrimaryNotInCharge) {
                return Some(format!("peer {peer} advertises {kind} over {}", entry.region));
            }
        }
    }
    None
}

/// Checks that the cluster is quiet for `region` and plans the catch-up.
fn survey(ctx: &ReactorContext, region: &Region, state: &ClusterState) -> Result<Vec<Pull>, String> {
    let me = ctx.peer;
    if let Some(reason) = contender(me, region, &state.view) {
        return Err(reason);
    }
    let mut candidates = Vec::new();
    for peer in state.blueprint.peers() {
        if peer == me {
            continue;
        }
        let Some(wrapper) = state.view.get(&peer) else {
            return Err(format!("waiting for peer {peer} to appear in the directory"));
        };
        let mut covered = Region::empty();
        for entry in wrapper.internal.overlapping(region) {
            if entry.card.kind() == ActivityKind::SecondaryUpToDate {
                return Err(format!(
                    "peer {peer} is still an up-to-date secondary for {}",
                    entry.region
                ));
            }
            covered = covered.union(&entry.region);
            if let (Some(version), Some(backfiller)) =
                (entry.card.advertised_version(), entry.card.backfiller())
            {
                candidates.push(Candidate {
                    peer,
                    version: version.mask(region),
                    backfiller: backfiller.clone(),
                });
            }
        }
        if !covered.covers(region) {
            return Err(format!(
                "waiting for peer {peer} to advertise state for {}",
                region.subtract(&covered)
            ));
        }
    }
    plan_catch_up(&ctx.history, region, &ctx.store.metainfo(region), &candidates)
}

fn is_ancestor(history: &BranchHistory, ancestor: Version, descendant: Version, region: &Region) -> Result<bool, String> {
    history
        .version_is_ancestor(ancestor, descendant, region)
        .map_err(|err| err.to_string())
}

/// Picks, for every piece of `region`, the most recent complete version held
/// by this peer or a candidate, and returns the pieces to fetch.
fn plan_catch_up(
    history: &BranchHistory,
    region: &Region,
    own: &RegionMap<VersionRange>,
    candidates: &[Candidate],
) -> Result<Vec<Pull>, String> {
    let mut best: Vec<(Region, Option<(Holder, Version)>)> = own
        .mask(region)
        .iter()
        .map(|(piece, range)| (piece, range.is_coherent().then_some((Holder::Local, range.latest))))
        .collect();

    for (idx, candidate) in candidates.iter().enumerate() {
        let mut next = Vec::with_capacity(best.len());
        for (piece, current) in best {
            let offered = candidate.version.mask(&piece);
            let rest = piece.subtract(&offered.domain());
            if !rest.is_empty() {
                next.push((rest, current));
            }
            for (sub, version) in offered.iter() {
                let chosen = match current {
                    None => Some((Holder::Remote(idx), *version)),
                    Some((_, held)) if held == *version => current,
                    Some((_, held)) => {
                        if is_ancestor(history, held, *version, &sub)? {
                            Some((Holder::Remote(idx), *version))
                        } else if is_ancestor(history, *version, held, &sub)? {
                            current
                        } else {
                            return Err(ReactorError::unsatisfiable(
                                &sub,
                                format!("divergent histories {held} and {version} (peer {})", candidate.peer),
                            )
                            .to_string());
                        }
                    }
                };
                next.push((sub, chosen));
            }
        }
        best = next;
    }

    let mut pulls: BTreeMap<usize, Region> = BTreeMap::new();
    for (piece, chosen) in best {
        match chosen {
            None => {
                return Err(ReactorError::unsatisfiable(&piece, "no complete copy is advertised").to_string());
            }
            Some((Holder::Local, _)) => {}
            Some((Holder::Remote(idx), _)) => {
                let pending = pulls.entry(idx).or_insert_with(Region::empty);
                *pending = pending.union(&piece);
            }
        }
    }
    Ok(pulls
        .into_iter()
        .filter_map(|(idx, region)| {
            candidates.get(idx).map(|candidate| Pull {
                peer: candidate.peer,
                region,
                backfiller: candidate.backfiller.clone(),
            })
        })
        .collect())
}

pub(super) async fn drive(ctx: &ReactorContext, activity: &ActivityHandle, cancel: &CancellationToken) -> ReactorResult<()> {
    let region = activity.region().clone();
    activity.publish(ActivityCard::PrimaryNotInCharge { branch: None });

    let pulls = wait_cluster(ctx, activity, cancel, |state| survey(ctx, &region, state)).await?;
    for pull in &pulls {
        tracing::info!(peer = ctx.peer, source = pull.peer, region = %pull.region, "primary-elect catching up");
        ctx.backfill_session(pull.region.clone(), None)
            .run(&pull.backfiller, cancel)
            .await?;
    }

    let held = ctx.store.metainfo(&region);
    if held.values().any(|range| !range.is_coherent()) {
        return Err(ReactorError::unsatisfiable(&region, "data is incoherent after catch-up"));
    }
    let branch = ctx.history.create_branch(&region, held.map(|range| range.latest))?;
    ctx.stats.record_branch_created();
    let initial_timestamp = ctx
        .history
        .get(branch)
        .map(|record| record.initial_timestamp)
        .unwrap_or(0);
    ctx.store
        .set_metainfo(&region, VersionRange::coherent(Version::new(branch, initial_timestamp)));

    let claim = activity.publish(ActivityCard::PrimaryNotInCharge { branch: Some(branch) });
    loop {
        let peers: Vec<PeerId> = ctx
            .current_blueprint()
            .map(|blueprint| blueprint.peers().collect())
            .unwrap_or_default();
        match interruptible(
            cancel,
            activity.wait_for_acks(claim, &peers, ctx.config.echo_ack_timeout),
        )
        .await?
        {
            Ok(()) => break,
            Err(err) => {
                ctx.stats.record_echo_timeout();
                tracing::warn!(peer = ctx.peer, region = %region, branch = %branch, error = %err, "primary claim not acknowledged");
                activity.set_blocked(Some(err.to_string()));
            }
        }
    }

    let view = ctx.view.borrow().clone();
    if let Some(reason) = contender(ctx.peer, &region, &view) {
        return Err(ReactorError::unsatisfiable(&region, reason));
    }

    let broadcaster = Broadcaster::start(BroadcasterSettings {
        peer: ctx.peer,
        region: region.clone(),
        branch,
        initial_timestamp,
        store: ctx.store.clone(),
        network: ctx.network.clone(),
        write_ack_timeout: ctx.config.write_ack_timeout,
        stats: ctx.stats.clone(),
    });
    let backfiller = Backfiller::spawn(ctx.backfill_source(), region.clone());
    activity.publish(ActivityCard::Primary {
        branch,
        master: broadcaster.master(),
        broadcaster: broadcaster.listener_mailbox(),
        backfiller: backfiller.mailbox(),
    });
    tracing::info!(peer = ctx.peer, region = %region, branch = %branch, "became primary");

    cancel.cancelled().await;
    broadcaster.shutdown().await;
    drop(backfiller);
    tracing::info!(peer = ctx.peer, region = %region, branch = %branch, "primary stepped down");
    Err(ReactorError::Interrupted)
}
