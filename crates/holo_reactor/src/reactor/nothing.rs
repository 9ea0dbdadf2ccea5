//! Nothing driver: give the region up without losing data.

use tokio_util::sync::CancellationToken;

use super::{interruptible, wait_cluster, ClusterState, ReactorContext};
use crate::advertiser::ActivityHandle;
use crate::backfill::Backfiller;
use crate::blueprint::Role;
use crate::branch::VersionRange;
use crate::directory::{ActivityCard, ActivityKind};
use crate::error::{ReactorError, ReactorResult};
use crate::network::PeerId;
use crate::region::Region;

/// Succeeds once every primary and secondary the blueprint assigns over
/// `region` is serving it.
fn new_owners_ready(me: PeerId, region: &Region, state: &ClusterState) -> Result<(), String> {
    for assignment in state.blueprint.assignments_overlapping(region) {
        if assignment.peer == me || assignment.role == Role::Nothing {
            continue;
        }
        let wanted = ActivityKind::satisfying(assignment.role);
        let ready = state.view.get(&assignment.peer).is_some_and(|wrapper| {
            wrapper
                .internal
                .activities
                .values()
                .any(|entry| entry.card.kind() == wanted && entry.region.covers(&assignment.overlap))
        });
        if !ready {
            return Err(format!(
                "waiting for peer {} to become {wanted} for {}",
                assignment.peer, assignment.overlap
            ));
        }
    }
    Ok(())
}

async fn park(cancel: &CancellationToken) -> ReactorResult<()> {
    cancel.cancelled().await;
    Err(ReactorError::Interrupted)
}

pub(super) async fn drive(ctx: &ReactorContext, activity: &ActivityHandle, cancel: &CancellationToken) -> ReactorResult<()> {
    let region = activity.region().clone();

    let held = ctx.store.metainfo(&region);
    for (piece, range) in held.iter() {
        if !range.is_coherent() {
            tracing::info!(peer = ctx.peer, region = %piece, "discarding partially backfilled data");
            ctx.store.erase(&piece);
        }
    }
    let held = ctx.store.metainfo(&region);
    if held.values().all(|range| *range == VersionRange::zero()) {
        activity.publish(ActivityCard::Nothing);
        return park(cancel).await;
    }

    let backfiller = Backfiller::spawn(ctx.backfill_source(), region.clone());
    activity.publish(ActivityCard::NothingWhenSafe {
        version: held.map(|range| range.latest),
        backfiller: backfiller.mailbox(),
    });

    wait_cluster(ctx, activity, cancel, |state| new_owners_ready(ctx.peer, &region, state)).await?;
    interruptible(cancel, tokio::time::sleep(ctx.config.erase_grace)).await?;

    drop(backfiller);
    ctx.store.erase(&region);
    ctx.stats.record_erasure();
    activity.publish(ActivityCard::Nothing);
    tracing::info!(peer = ctx.peer, region = %region, "region erased");
    park(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::blueprint::Blueprint;
    use crate::branch::BranchId;
    use crate::directory::{ActivityEntry, DirectoryView, ReactorCard};
    use crate::echo::{EchoAck, EchoWrapper};
    use crate::network::Network;

    fn view_with(network: &Network, cards: &[(PeerId, Region, ActivityCard)]) -> Arc<DirectoryView> {
        let mut view = DirectoryView::new();
        for (idx, (peer, region, card)) in cards.iter().enumerate() {
            let (ack_mailbox, _rx) = network.mailbox::<EchoAck>(*peer);
            let wrapper = view.entry(*peer).or_insert_with(|| EchoWrapper {
                internal: ReactorCard {
                    activities: BTreeMap::new(),
                },
                version: 1,
                ack_mailbox,
            });
            wrapper.internal.activities.insert(
                idx as u64,
                ActivityEntry {
                    region: region.clone(),
                    card: card.clone(),
                    blocked: None,
                },
            );
        }
        Arc::new(view)
    }

    #[test]
    fn waits_for_primary_and_secondaries() {
        let network = Network::new();
        let blueprint = Arc::new(Blueprint::from_role_string("n,p,s", &[0, 1, 2]).expect("blueprint"));
        let domain = crate::blueprint::letter_domain();
        let (master, _m) = network.mailbox(1);
        let (listeners, _l) = network.mailbox(1);
        let (backfiller, _b) = network.mailbox(1);
        let branch = BranchId { peer: 1, counter: 1 };
        let primary = ActivityCard::Primary {
            branch,
            master,
            broadcaster: listeners,
            backfiller: backfiller.clone(),
        };

        let state = ClusterState {
            view: view_with(&network, &[(1, domain.clone(), primary.clone())]),
            blueprint: blueprint.clone(),
        };
        let reason = new_owners_ready(0, &domain, &state).expect_err("secondary missing");
        assert!(reason.contains("peer 2"));

        let secondary = ActivityCard::SecondaryUpToDate {
            branch,
            primary: 1,
            backfiller,
        };
        let state = ClusterState {
            view: view_with(&network, &[(1, domain.clone(), primary), (2, domain.clone(), secondary)]),
            blueprint,
        };
        assert_eq!(new_owners_ready(0, &domain, &state), Ok(()));
    }
}
