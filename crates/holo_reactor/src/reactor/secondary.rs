//! Secondary driver.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{interruptible, wait_cluster, ReactorContext};
use crate::advertiser::ActivityHandle;
use crate::backfill::{already_applied, BackfillRequest, Backfiller};
use crate::branch::{BranchId, BranchRecord, Version, VersionRange};
use crate::broadcast::{ListenerRequest, ReplicatedWrite};
use crate::directory::{ActivityCard, DirectoryView};
use crate::error::{ReactorError, ReactorResult};
use crate::network::{watch_until, Mailbox, PeerId};
use crate::region::{Region, RegionMap};

/// The primary this secondary follows.
struct Upstream {
    peer: PeerId,
    branch: BranchId,
    listeners: Mailbox<ListenerRequest>,
    backfiller: Mailbox<BackfillRequest>,
}

fn find_primary(me: PeerId, region: &Region, view: &DirectoryView) -> Result<Upstream, String> {
    for (peer, wrapper) in view {
        if *peer == me {
            continue;
        }
        for entry in wrapper.internal.activities.values() {
            if let ActivityCard::Primary {
                branch,
                broadcaster,
                backfiller,
                ..
            } = &entry.card
            {
                if entry.region.covers(region) {
                    return Ok(Upstream {
                        peer: *peer,
                        branch: *branch,
                        listeners: broadcaster.clone(),
                        backfiller: backfiller.clone(),
                    });
                }
            }
        }
    }
    Err(format!("waiting for a primary covering {region}"))
}

fn still_serving(view: &DirectoryView, upstream: &Upstream, region: &Region) -> bool {
    view.get(&upstream.peer).is_some_and(|wrapper| {
        wrapper.internal.activities.values().any(|entry| {
            matches!(&entry.card, ActivityCard::Primary { branch, .. } if *branch == upstream.branch)
                && entry.region.covers(region)
        })
    })
}

/// Up-to-date secondaries of `branch` that can serve `region`, then the
/// primary itself.
fn backfill_sources(me: PeerId, region: &Region, view: &DirectoryView, upstream: &Upstream) -> Vec<(PeerId, Mailbox<BackfillRequest>)> {
    let mut sources = Vec::new();
    for (peer, wrapper) in view {
        if *peer == me || *peer == upstream.peer {
            continue;
        }
        for entry in wrapper.internal.activities.values() {
            if let ActivityCard::SecondaryUpToDate {
                branch, backfiller, ..
            } = &entry.card
            {
                if *branch == upstream.branch && entry.region.covers(region) {
                    sources.push((*peer, backfiller.clone()));
                }
            }
        }
    }
    sources.push((upstream.peer, upstream.backfiller.clone()));
    sources
}

fn apply(ctx: &ReactorContext, region: &Region, snapshot: &RegionMap<Version>, write: ReplicatedWrite) {
    if !already_applied(snapshot, &write.entry) {
        ctx.store.write(region, write.entry);
    }
    if let Some(ack) = write.ack {
        let _ = ack.send(());
    }
}

/// Checks whether local data is exactly where the upstream branch starts
/// and nothing was written on it before `registered_at`. If so the region is
/// restamped at `registered_at` and that snapshot is returned.
fn resume_in_place(
    ctx: &ReactorContext,
    region: &Region,
    branch: &BranchRecord,
    registered_at: Version,
) -> Option<RegionMap<Version>> {
    if registered_at.timestamp != branch.initial_timestamp {
        return None;
    }
    let origin = branch.origin.mask(region);
    if origin.domain() != *region {
        return None;
    }
    let held = ctx.store.metainfo(region);
    let same = held.iter().all(|(piece, range)| {
        range.is_coherent() && origin.mask(&piece).values().all(|parent| *parent == range.latest)
    });
    if !same {
        return None;
    }
    ctx.store.set_metainfo(region, VersionRange::coherent(registered_at));
    Some(RegionMap::new(region, registered_at))
}

/// Runs one secondary lifetime: find the primary, catch up, follow it.
///
/// A `demoted` task (this peer was primary for the region) skips the
/// backfill when its data is exactly what the new primary started from.
pub(super) async fn drive(
    ctx: &ReactorContext,
    activity: &ActivityHandle,
    cancel: &CancellationToken,
    demoted: bool,
) -> ReactorResult<()> {
    let region = activity.region().clone();
    let backfiller = Backfiller::spawn(ctx.backfill_source(), region.clone());
    let held = ctx.store.metainfo(&region);
    if held.values().all(|range| range.is_coherent()) {
        activity.publish(ActivityCard::SecondaryWithoutPrimary {
            version: held.map(|range| range.latest),
            backfiller: backfiller.mailbox(),
        });
    } else {
        activity.publish(ActivityCard::SecondaryBackfilling { source: None });
    }

    let upstream = wait_cluster(ctx, activity, cancel, |state| find_primary(ctx.peer, &region, &state.view)).await?;

    let (writes_tx, mut writes) = mpsc::unbounded_channel::<ReplicatedWrite>();
    let (reply, intro) = oneshot::channel();
    upstream.listeners.send(
        ctx.peer,
        ListenerRequest::Register {
            peer: ctx.peer,
            region: region.clone(),
            writes: writes_tx,
            reply,
        },
    )?;
    let intro = interruptible(cancel, intro)
        .await?
        .map_err(|_| ReactorError::BackfillSourceUnavailable {
            peer: upstream.peer,
            reason: "listener registration dropped".into(),
        })?;
    tracing::debug!(
        peer = ctx.peer,
        primary = upstream.peer,
        region = %region,
        registered_at = %intro.registered_at,
        "registered with primary"
    );

    let mut snapshot = None;
    if demoted {
        let branch = wait_cluster(ctx, activity, cancel, |_| {
            ctx.history
                .get(upstream.branch)
                .ok_or_else(|| format!("waiting to learn branch {}", upstream.branch))
        })
        .await?;
        snapshot = resume_in_place(ctx, &region, &branch, intro.registered_at);
        if snapshot.is_some() {
            ctx.stats.record_demotion_in_place();
            tracing::info!(peer = ctx.peer, primary = upstream.peer, region = %region, "demoted in place");
        }
    }
    if snapshot.is_none() {
        activity.publish(ActivityCard::SecondaryBackfilling {
            source: Some(upstream.peer),
        });
    }

    let sources = if snapshot.is_none() {
        backfill_sources(ctx.peer, &region, &ctx.view.borrow(), &upstream)
    } else {
        Vec::new()
    };
    let session = ctx.backfill_session(region.clone(), Some(intro.registered_at));
    let mut last_error = None;
    for (source, mailbox) in &sources {
        match session.run(mailbox, cancel).await {
            Ok(version) => {
                snapshot = Some(version);
                break;
            }
            Err(err) if err.is_interrupted() || cancel.is_cancelled() => return Err(ReactorError::Interrupted),
            Err(err) => {
                tracing::warn!(peer = ctx.peer, source = *source, region = %region, error = %err, "backfill attempt failed");
                last_error = Some(err);
            }
        }
    }
    let Some(snapshot) = snapshot else {
        return Err(last_error.unwrap_or(ReactorError::BackfillSourceUnavailable {
            peer: upstream.peer,
            reason: "no backfill source".into(),
        }));
    };

    let (reply, forwarded) = oneshot::channel();
    upstream.listeners.send(
        ctx.peer,
        ListenerRequest::UpToDate {
            listener_id: intro.listener_id,
            reply,
        },
    )?;
    let forwarded = interruptible(cancel, forwarded)
        .await?
        .map_err(|_| ReactorError::BackfillSourceUnavailable {
            peer: upstream.peer,
            reason: "listener dropped before catching up".into(),
        })?;
    // Every write up to `forwarded` is already queued.
    loop {
        match writes.try_recv() {
            Ok(write) => apply(ctx, &region, &snapshot, write),
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
        }
    }

    activity.publish(ActivityCard::SecondaryUpToDate {
        branch: upstream.branch,
        primary: upstream.peer,
        backfiller: backfiller.mailbox(),
    });
    tracing::info!(
        peer = ctx.peer,
        primary = upstream.peer,
        region = %region,
        branch = %upstream.branch,
        forwarded,
        "secondary up to date"
    );

    let mut view = ctx.view.clone();
    let gone = watch_until(&mut view, |view| (!still_serving(view, &upstream, &region)).then_some(()));
    tokio::pin!(gone);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReactorError::Interrupted),
            _ = &mut gone => {
                tracing::info!(peer = ctx.peer, primary = upstream.peer, region = %region, "primary no longer visible");
                return Ok(());
            }
            write = writes.recv() => match write {
                Some(write) => apply(ctx, &region, &snapshot, write),
                None => {
                    tracing::info!(peer = ctx.peer, primary = upstream.peer, region = %region, "write stream closed");
                    return Ok(());
                }
            },
        }
    }
}
