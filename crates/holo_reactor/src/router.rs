//! Namespace router.
//!
//! Resolves keys to the primary currently serving them, using one peer's
//! echo-acknowledged view of the directory. A target is `fresh` when the
//! primary is reachable and its latest published card is the one the view
//! acknowledged; stale targets are still tried, and requests retry across
//! role changes until the router timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::branch::{BranchId, Version};
use crate::broadcast::MasterRequest;
use crate::directory::{primary_locations, ActivityCard, DirectoryView, ReactorDirectory};
use crate::error::{ReactorError, ReactorResult};
use crate::network::{Mailbox, PeerId};
use crate::region::{Key, Region};
use crate::store::StoredEntry;

#[derive(Clone, Debug, PartialEq)]
pub struct RouteTarget {
    pub primary: PeerId,
    /// The primary's whole region.
    pub region: Region,
    pub branch: BranchId,
    pub master: Mailbox<MasterRequest>,
    /// Peers advertising up-to-date secondaries of this primary for the key
    /// or region that was routed.
    pub secondaries: Vec<PeerId>,
    pub fresh: bool,
}

#[derive(Clone)]
pub struct NamespaceRouter {
    peer: PeerId,
    view: watch::Receiver<Arc<DirectoryView>>,
    directory: ReactorDirectory,
    timeout: Duration,
    retry: Duration,
}

impl NamespaceRouter {
    pub fn new(
        peer: PeerId,
        view: watch::Receiver<Arc<DirectoryView>>,
        directory: ReactorDirectory,
        timeout: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            peer,
            view,
            directory,
            timeout,
            retry,
        }
    }

    fn targets(&self, view: &DirectoryView, wanted: &Region) -> Vec<RouteTarget> {
        let raw = self.directory.snapshot();
        primary_locations(view)
            .into_iter()
            .filter(|location| location.region.overlaps(wanted))
            .map(|location| {
                let covered = location.region.intersect(wanted);
                let secondaries = view
                    .iter()
                    .filter(|(_, wrapper)| {
                        wrapper.internal.activities.values().any(|entry| {
                            matches!(
                                &entry.card,
                                ActivityCard::SecondaryUpToDate { branch, primary, .. }
                                    if *branch == location.branch && *primary == location.peer
                            ) && entry.region.overlaps(&covered)
                        })
                    })
                    .map(|(peer, _)| *peer)
                    .collect();
                let acked = view.get(&location.peer).map(|w| w.version);
                let latest = raw.get(&location.peer).map(|w| w.version);
                let fresh = self.directory.network().can_reach(self.peer, location.peer) && acked == latest;
                RouteTarget {
                    primary: location.peer,
                    region: location.region,
                    branch: location.branch,
                    master: location.master,
                    secondaries,
                    fresh,
                }
            })
            .collect()
    }

    /// The primary serving `key`, if the view knows one.
    pub fn route(&self, key: &[u8]) -> Option<RouteTarget> {
        let view = self.view.borrow().clone();
        self.targets(&view, &Region::point(key))
            .into_iter()
            .max_by_key(|target| target.fresh)
    }

    /// Every primary serving part of `region`.
    pub fn route_region(&self, region: &Region) -> Vec<RouteTarget> {
        let view = self.view.borrow().clone();
        self.targets(&view, region)
    }

    async fn attempt<T>(
        &self,
        key: &[u8],
        request: impl Fn(oneshot::Sender<ReactorResult<T>>) -> MasterRequest,
    ) -> ReactorResult<T> {
        let Some(target) = self.route(key) else {
            return Err(ReactorError::NoPrimary {
                key: String::from_utf8_lossy(key).into_owned(),
            });
        };
        let (reply, rx) = oneshot::channel();
        target.master.send(self.peer, request(reply))?;
        rx.await.map_err(|_| ReactorError::PeerUnreachable {
            peer: target.primary,
        })?
    }

    async fn retrying<T>(
        &self,
        key: &[u8],
        request: impl Fn(oneshot::Sender<ReactorResult<T>>) -> MasterRequest,
    ) -> ReactorResult<T> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let no_primary = || ReactorError::NoPrimary {
            key: String::from_utf8_lossy(key).into_owned(),
        };
        let mut view = self.view.clone();
        loop {
            view.borrow_and_update();
            let err = match tokio::time::timeout_at(deadline, self.attempt(key, &request)).await {
                Ok(Ok(out)) => return Ok(out),
                Ok(Err(err)) => err,
                Err(_) => return Err(no_primary()),
            };
            tracing::debug!(peer = self.peer, key = %String::from_utf8_lossy(key), error = %err, "routed request failed; retrying");
            let wait = async {
                tokio::select! {
                    _ = view.changed() => {}
                    _ = tokio::time::sleep(self.retry) => {}
                }
            };
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(no_primary());
            }
        }
    }

    pub async fn write(&self, key: Key, value: Vec<u8>) -> ReactorResult<Version> {
        self.retrying(&key, |reply| MasterRequest::Write {
            key: key.clone(),
            value: value.clone(),
            reply,
        })
        .await
    }

    pub async fn read(&self, key: Key) -> ReactorResult<Option<StoredEntry>> {
        self.retrying(&key, |reply| MasterRequest::Read {
            key: key.clone(),
            reply,
        })
        .await
    }
}
