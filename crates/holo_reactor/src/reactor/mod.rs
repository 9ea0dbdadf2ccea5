//! Reactor core.
//!
//! One reactor runs per peer. It watches the peer's blueprint input and keeps
//! an arena of region tasks, one per (region, role) the blueprint assigns to
//! this peer. A new blueprint cancels and awaits the tasks it no longer
//! names, then spawns the ones it adds; assignments that did not change keep
//! running untouched.
//!
//! Each region task certifies its stored versions against the branch
//! history, then runs the driver for its role in a retry loop with
//! exponential backoff. Drivers wait on the echo-acknowledged directory view,
//! the accepted blueprint and the branch history, and publish what they are
//! doing through their activity handle. Waits that last longer than
//! `stall_report_after` publish their reason in the activity's `blocked`
//! field.

mod nothing;
mod primary;
mod secondary;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::advertiser::{ActivityHandle, StatusAdvertiser};
use crate::backfill::{BackfillFaults, BackfillSession, BackfillSource};
use crate::blueprint::{Blueprint, Role};
use crate::branch::{BranchHistory, Version};
use crate::broadcast::MasterRequest;
use crate::config::ReactorConfig;
use crate::directory::{ActivityCard, DirectoryView, ReactorCard, ReactorDirectory};
use crate::echo::EchoMirror;
use crate::error::{ReactorError, ReactorResult};
use crate::network::{Mailbox, Network, PeerId};
use crate::region::{Key, Region};
use crate::stats::{ReactorStats, StatsSnapshot};
use crate::store::{ReplicaStore, StoredEntry};

/// Everything a reactor needs from its host.
pub struct ReactorSettings {
    pub peer: PeerId,
    pub store: Arc<dyn ReplicaStore>,
    pub history: BranchHistory,
    pub directory: ReactorDirectory,
    pub config: ReactorConfig,
    pub faults: BackfillFaults,
}

pub(crate) struct ReactorContext {
    pub(crate) peer: PeerId,
    pub(crate) store: Arc<dyn ReplicaStore>,
    pub(crate) history: BranchHistory,
    pub(crate) network: Network,
    pub(crate) config: ReactorConfig,
    pub(crate) stats: Arc<ReactorStats>,
    pub(crate) faults: BackfillFaults,
    pub(crate) advertiser: Arc<StatusAdvertiser>,
    pub(crate) view: watch::Receiver<Arc<DirectoryView>>,
    pub(crate) blueprint: watch::Receiver<Option<Arc<Blueprint>>>,
}

impl ReactorContext {
    pub(crate) fn backfill_source(&self) -> BackfillSource {
        BackfillSource {
            peer: self.peer,
            store: self.store.clone(),
            history: self.history.clone(),
            network: self.network.clone(),
            chunk_keys: self.config.backfill_chunk_keys,
            faults: self.faults.clone(),
        }
    }

    pub(crate) fn backfill_session(&self, region: Region, registered_at: Option<Version>) -> BackfillSession {
        BackfillSession {
            peer: self.peer,
            store: self.store.clone(),
            region,
            channel_depth: self.config.backfill_channel_depth,
            stats: self.stats.clone(),
            registered_at,
            history: self.history.clone(),
        }
    }

    pub(crate) fn current_blueprint(&self) -> Option<Arc<Blueprint>> {
        self.blueprint.borrow().clone()
    }
}

/// What a driver sees while waiting on the cluster.
pub(crate) struct ClusterState {
    pub(crate) view: Arc<DirectoryView>,
    pub(crate) blueprint: Arc<Blueprint>,
}

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn interruptible<F: Future>(cancel: &CancellationToken, fut: F) -> ReactorResult<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ReactorError::Interrupted),
        out = fut => Ok(out),
    }
}

/// Re-evaluates `check` whenever the acknowledged view, the accepted
/// blueprint or the branch history changes, until it succeeds.
///
/// While `check` fails for longer than `stall_report_after`, its latest
/// reason is published as the activity's `blocked` field.
pub(crate) async fn wait_cluster<R>(
    ctx: &ReactorContext,
    activity: &ActivityHandle,
    cancel: &CancellationToken,
    mut check: impl FnMut(&ClusterState) -> Result<R, String>,
) -> ReactorResult<R> {
    let mut view = ctx.view.clone();
    let mut blueprint = ctx.blueprint.clone();
    let mut branches = ctx.history.subscribe();
    let stall = tokio::time::sleep(ctx.config.stall_report_after);
    tokio::pin!(stall);
    let mut stalled = false;
    let mut reason = String::new();

    loop {
        let current = blueprint.borrow_and_update().clone();
        let snapshot = view.borrow_and_update().clone();
        branches.borrow_and_update();
        let outcome = match current {
            Some(blueprint) => check(&ClusterState {
                view: snapshot,
                blueprint,
            }),
            None => Err("no blueprint accepted yet".to_string()),
        };
        match outcome {
            Ok(out) => {
                if stalled {
                    activity.set_blocked(None);
                }
                return Ok(out);
            }
            Err(why) => {
                if stalled && why != reason {
                    activity.set_blocked(Some(why.clone()));
                }
                reason = why;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReactorError::Interrupted),
            changed = view.changed() => changed.map_err(|_| ReactorError::Interrupted)?,
            changed = blueprint.changed() => changed.map_err(|_| ReactorError::Interrupted)?,
            changed = branches.changed() => changed.map_err(|_| ReactorError::Interrupted)?,
            _ = &mut stall, if !stalled => {
                stalled = true;
                activity.set_blocked(Some(reason.clone()));
            }
        }
    }
}

/// Blocks until every branch referenced by the region's stored versions is
/// known locally, so ancestry questions about them can be answered.
async fn certify_local(ctx: &ReactorContext, activity: &ActivityHandle, cancel: &CancellationToken) -> ReactorResult<()> {
    let region = activity.region().clone();
    wait_cluster(ctx, activity, cancel, |_| {
        let held = ctx.store.metainfo(&region);
        let versions: Vec<Version> = held
            .values()
            .flat_map(|range| [range.earliest, range.latest])
            .collect();
        ctx.history
            .certify(versions.iter())
            .map_err(|branch| format!("waiting to learn branch {branch}"))
    })
    .await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetileKind {
    /// No previous task overlapped the region.
    Fresh,
    /// Same region, different role.
    Replace,
    /// Carved out of one larger previous region.
    Split,
    /// Assembled from several previous regions it covers.
    Merge,
    /// Any other overlap with previous regions.
    Reshape,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetileStep {
    pub region: Region,
    pub role: Role,
    pub kind: RetileKind,
    pub previous: Vec<Region>,
    /// Role of the same-region task a `Replace` step takes over from.
    pub replaces: Option<Role>,
}

impl RetileStep {
    /// A primary handing its own region over to a secondary task. The new
    /// task follows the next primary without backfilling when it can.
    pub fn is_demotion(&self) -> bool {
        self.kind == RetileKind::Replace && self.replaces == Some(Role::Primary) && self.role == Role::Secondary
    }
}

/// How a new assignment relates to the tasks it replaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetilePlan {
    pub retired: Vec<Region>,
    pub steps: Vec<RetileStep>,
}

impl RetilePlan {
    pub fn compute(running: &BTreeMap<Region, Role>, desired: &BTreeMap<Region, Role>) -> Self {
        let retired: Vec<Region> = running
            .iter()
            .filter(|(region, role)| desired.get(*region) != Some(*role))
            .map(|(region, _)| region.clone())
            .collect();
        let steps = desired
            .iter()
            .filter(|(region, role)| running.get(*region) != Some(*role))
            .map(|(region, role)| {
                let previous: Vec<Region> = retired
                    .iter()
                    .filter(|old| old.overlaps(region))
                    .cloned()
                    .collect();
                let kind = match previous.as_slice() {
                    [] => RetileKind::Fresh,
                    [only] if only == region => RetileKind::Replace,
                    [only] if only.covers(region) => RetileKind::Split,
                    many if many.len() > 1 && many.iter().all(|old| region.covers(old)) => RetileKind::Merge,
                    _ => RetileKind::Reshape,
                };
                let replaces = match kind {
                    RetileKind::Replace => running.get(region).copied(),
                    _ => None,
                };
                RetileStep {
                    region: region.clone(),
                    role: *role,
                    kind,
                    previous,
                    replaces,
                }
            })
            .collect();
        Self { retired, steps }
    }

    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.steps.is_empty()
    }
}

struct RunningRole {
    role: Role,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningRole {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// A peer's reactor. Dropping it without [`Reactor::shutdown`] cancels
/// every task but does not wait for them.
pub struct Reactor {
    ctx: Arc<ReactorContext>,
    _mirror: EchoMirror<ReactorCard>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Reactor {
    pub fn spawn(settings: ReactorSettings, blueprints: watch::Receiver<Option<Blueprint>>) -> Self {
        let ReactorSettings {
            peer,
            store,
            history,
            directory,
            config,
            faults,
        } = settings;
        let mirror = EchoMirror::spawn(peer, directory.clone(), config.backoff_base);
        let (accepted, accepted_rx) = watch::channel(None);
        let ctx = Arc::new(ReactorContext {
            peer,
            store,
            history,
            network: directory.network().clone(),
            config,
            stats: Arc::new(ReactorStats::new()),
            faults,
            advertiser: StatusAdvertiser::new(peer, directory),
            view: mirror.view(),
            blueprint: accepted_rx,
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control_loop(ctx.clone(), blueprints, accepted, cancel.clone()));
        tracing::info!(peer, "reactor started");
        Self {
            ctx,
            _mirror: mirror,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.ctx.peer
    }

    /// This peer's echo-acknowledged view of every published card.
    pub fn view(&self) -> watch::Receiver<Arc<DirectoryView>> {
        self.ctx.view.clone()
    }

    /// The last blueprint this reactor accepted.
    pub fn accepted_blueprint(&self) -> Option<Arc<Blueprint>> {
        self.ctx.current_blueprint()
    }

    pub fn card(&self) -> ReactorCard {
        self.ctx.advertiser.card()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    fn local_master(&self, key: &[u8]) -> ReactorResult<Mailbox<MasterRequest>> {
        self.card()
            .activities
            .values()
            .find_map(|entry| match &entry.card {
                ActivityCard::Primary { master, .. } if entry.region.contains_key(key) => Some(master.clone()),
                _ => None,
            })
            .ok_or_else(|| ReactorError::NotPrimary {
                peer: self.ctx.peer,
                key: String::from_utf8_lossy(key).into_owned(),
            })
    }

    /// Writes through this peer's primary activity for `key`.
    pub async fn write(&self, key: Key, value: Vec<u8>) -> ReactorResult<Version> {
        let master = self.local_master(&key)?;
        let (reply, rx) = oneshot::channel();
        master.send(self.ctx.peer, MasterRequest::Write { key, value, reply })?;
        rx.await.map_err(|_| ReactorError::Interrupted)?
    }

    pub async fn read(&self, key: Key) -> ReactorResult<Option<StoredEntry>> {
        let master = self.local_master(&key)?;
        let (reply, rx) = oneshot::channel();
        master.send(self.ctx.peer, MasterRequest::Read { key, reply })?;
        rx.await.map_err(|_| ReactorError::Interrupted)?
    }

    /// Stops every region task, waits for them, and retracts the card.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.ctx.advertiser.retract();
        tracing::info!(peer = self.ctx.peer, "reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn control_loop(
    ctx: Arc<ReactorContext>,
    mut blueprints: watch::Receiver<Option<Blueprint>>,
    accepted: watch::Sender<Option<Arc<Blueprint>>>,
    cancel: CancellationToken,
) {
    let mut arena: BTreeMap<Region, RunningRole> = BTreeMap::new();
    loop {
        let candidate = blueprints.borrow_and_update().clone();
        if let Some(blueprint) = candidate {
            match admit(ctx.peer, &blueprint) {
                Ok(desired) => {
                    let already = accepted
                        .borrow()
                        .as_deref()
                        .is_some_and(|current| *current == blueprint);
                    if !already {
                        reconcile(&ctx, &mut arena, desired, Arc::new(blueprint), &accepted, &cancel).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = ctx.peer, error = %err, "ignoring blueprint");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = blueprints.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    for (_, running) in std::mem::take(&mut arena) {
        running.stop().await;
    }
}

/// Validates `blueprint` and returns this peer's assignment.
fn admit(peer: PeerId, blueprint: &Blueprint) -> ReactorResult<BTreeMap<Region, Role>> {
    blueprint.validate()?;
    blueprint
        .roles_for(peer)
        .cloned()
        .ok_or_else(|| ReactorError::MalformedBlueprint(format!("peer {peer} is not part of the blueprint")))
}

async fn reconcile(
    ctx: &Arc<ReactorContext>,
    arena: &mut BTreeMap<Region, RunningRole>,
    desired: BTreeMap<Region, Role>,
    blueprint: Arc<Blueprint>,
    accepted: &watch::Sender<Option<Arc<Blueprint>>>,
    cancel: &CancellationToken,
) {
    let running: BTreeMap<Region, Role> = arena
        .iter()
        .map(|(region, task)| (region.clone(), task.role))
        .collect();
    let plan = RetilePlan::compute(&running, &desired);
    for step in &plan.steps {
        let previous: Vec<String> = step.previous.iter().map(ToString::to_string).collect();
        tracing::info!(
            peer = ctx.peer,
            region = %step.region,
            role = ?step.role,
            kind = ?step.kind,
            previous = ?previous,
            "retiling region"
        );
    }

    for region in &plan.retired {
        if let Some(task) = arena.remove(region) {
            task.stop().await;
        }
    }
    accepted.send_replace(Some(blueprint));

    for step in plan.steps {
        let task_cancel = cancel.child_token();
        let region = step.region.clone();
        let role = step.role;
        let handle = tokio::spawn(run_region(ctx.clone(), step, task_cancel.clone()));
        ctx.stats.record_transition();
        arena.insert(
            region,
            RunningRole {
                role,
                cancel: task_cancel,
                handle,
            },
        );
    }
}

async fn run_region(ctx: Arc<ReactorContext>, step: RetileStep, cancel: CancellationToken) {
    let demoted = step.is_demotion();
    let RetileStep { region, role, .. } = step;
    let activity = ctx.advertiser.activity(region.clone());
    let mut failures = 0u32;
    loop {
        let outcome = async {
            certify_local(&ctx, &activity, &cancel).await?;
            match role {
                Role::Primary => primary::drive(&ctx, &activity, &cancel).await,
                Role::Secondary => secondary::drive(&ctx, &activity, &cancel, demoted).await,
                Role::Nothing => nothing::drive(&ctx, &activity, &cancel).await,
            }
        }
        .await;
        if cancel.is_cancelled() {
            break;
        }
        match outcome {
            Ok(()) => failures = 0,
            Err(err) => {
                failures = failures.saturating_add(1);
                tracing::warn!(
                    peer = ctx.peer,
                    region = %region,
                    role = ?role,
                    failures,
                    error = %err,
                    "role driver failed; retrying"
                );
            }
        }
        if interruptible(&cancel, tokio::time::sleep(ctx.config.backoff(failures)))
            .await
            .is_err()
        {
            break;
        }
    }
    tracing::debug!(peer = ctx.peer, region = %region, role = ?role, "region task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::letter_domain;

    fn roles(entries: &[(Region, Role)]) -> BTreeMap<Region, Role> {
        entries.iter().cloned().collect()
    }

    #[test]
    fn retile_plan_classifies_changes() {
        let whole = letter_domain();
        let (left, right) = whole.split_at(b"n");

        let split = RetilePlan::compute(
            &roles(&[(whole.clone(), Role::Primary)]),
            &roles(&[(left.clone(), Role::Primary), (right.clone(), Role::Nothing)]),
        );
        assert_eq!(split.retired, vec![whole.clone()]);
        assert!(split.steps.iter().all(|s| s.kind == RetileKind::Split));

        let merge = RetilePlan::compute(
            &roles(&[(left.clone(), Role::Primary), (right.clone(), Role::Secondary)]),
            &roles(&[(whole.clone(), Role::Primary)]),
        );
        assert_eq!(merge.steps.len(), 1);
        assert_eq!(merge.steps[0].kind, RetileKind::Merge);

        let partial = RetilePlan::compute(
            &roles(&[(left.clone(), Role::Primary), (right.clone(), Role::Nothing)]),
            &roles(&[(left.clone(), Role::Primary), (right.clone(), Role::Secondary)]),
        );
        assert_eq!(partial.retired, vec![right.clone()]);
        assert_eq!(partial.steps.len(), 1);
        assert_eq!(partial.steps[0].kind, RetileKind::Replace);
        assert_eq!(partial.steps[0].replaces, Some(Role::Nothing));
        assert!(!partial.steps[0].is_demotion());

        let demotion = RetilePlan::compute(
            &roles(&[(whole.clone(), Role::Primary)]),
            &roles(&[(whole.clone(), Role::Secondary)]),
        );
        assert!(demotion.steps[0].is_demotion());
        assert!(split.steps.iter().all(|s| s.replaces.is_none() && !s.is_demotion()));

        let fresh = RetilePlan::compute(&BTreeMap::new(), &roles(&[(whole.clone(), Role::Nothing)]));
        assert_eq!(fresh.steps[0].kind, RetileKind::Fresh);

        let same = roles(&[(whole, Role::Nothing)]);
        assert!(RetilePlan::compute(&same, &same).is_empty());
    }

    #[test]
    fn admit_rejects_unknown_peer_and_bad_tiling() {
        let blueprint = Blueprint::from_role_string("p,n", &[0, 1]).expect("blueprint");
        assert_eq!(admit(0, &blueprint).map(|r| r.len()).ok(), Some(1));
        assert!(matches!(admit(5, &blueprint), Err(ReactorError::MalformedBlueprint(_))));

        let mut broken = blueprint.clone();
        broken.add_role(1, letter_domain(), Role::Primary);
        assert!(matches!(admit(0, &broken), Err(ReactorError::MalformedBlueprint(_))));
    }
}
