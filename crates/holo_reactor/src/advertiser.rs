//! Status advertiser.
//!
//! Owns the peer's [`ReactorCard`] and publishes it through the directory
//! echo writer. Region tasks never touch the card directly: each holds an
//! [`ActivityHandle`] for its own entry, so publishes for one region cannot
//! clobber another and every change is serialized by the writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::directory::{ActivityCard, ActivityEntry, ActivityId, ActivityKind, ReactorCard, ReactorDirectory};
use crate::echo::EchoWriter;
use crate::error::ReactorResult;
use crate::network::PeerId;
use crate::region::Region;

pub struct StatusAdvertiser {
    peer: PeerId,
    writer: Arc<EchoWriter<ReactorCard>>,
    next_id: AtomicU64,
}

impl StatusAdvertiser {
    pub fn new(peer: PeerId, directory: ReactorDirectory) -> Arc<Self> {
        Arc::new(Self {
            peer,
            writer: EchoWriter::spawn(peer, directory, ReactorCard::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Allocates an entry for `region`; nothing is published until the
    /// handle publishes a card.
    pub fn activity(self: &Arc<Self>, region: Region) -> ActivityHandle {
        ActivityHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            region,
            advertiser: self.clone(),
        }
    }

    pub fn card(&self) -> ReactorCard {
        self.writer
            .current()
            .map(|(card, _)| card)
            .unwrap_or_default()
    }

    pub fn retract(&self) {
        self.writer.retract();
    }
}

/// A region task's entry in the peer's card. Dropping it removes the entry.
pub struct ActivityHandle {
    id: ActivityId,
    region: Region,
    advertiser: Arc<StatusAdvertiser>,
}

impl ActivityHandle {
    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn peer(&self) -> PeerId {
        self.advertiser.peer
    }

    /// Publishes `card` for this region and clears any stall report.
    /// Returns the echo version reflecting it.
    pub fn publish(&self, card: ActivityCard) -> u64 {
        let entry = ActivityEntry {
            region: self.region.clone(),
            card,
            blocked: None,
        };
        let kind = entry.card.kind();
        let version = self.advertiser.writer.modify(|value| {
            if value.activities.get(&self.id) == Some(&entry) {
                return false;
            }
            value.activities.insert(self.id, entry);
            true
        });
        tracing::debug!(peer = self.peer(), region = %self.region, activity = %kind, version, "advertised activity");
        version
    }

    /// Records why the activity is stuck, or clears it with `None`.
    pub fn set_blocked(&self, reason: Option<String>) -> u64 {
        self.advertiser.writer.modify(|value| {
            let Some(entry) = value.activities.get_mut(&self.id) else {
                return false;
            };
            if entry.blocked == reason {
                return false;
            }
            if let Some(reason) = &reason {
                tracing::info!(peer = self.advertiser.peer, region = %self.region, reason = %reason, "activity stalled");
            }
            entry.blocked = reason;
            true
        })
    }

    pub fn current_kind(&self) -> Option<ActivityKind> {
        self.advertiser
            .card()
            .activities
            .get(&self.id)
            .map(|entry| entry.card.kind())
    }

    /// Waits until `peers` acknowledged echo `version`.
    pub async fn wait_for_acks(&self, version: u64, peers: &[PeerId], timeout: Duration) -> ReactorResult<()> {
        self.advertiser
            .writer
            .wait_for_acks(version, peers, timeout)
            .await
    }
}

impl Drop for ActivityHandle {
    fn drop(&mut self) {
        let id = self.id;
        self.advertiser
            .writer
            .modify(|value| value.activities.remove(&id).is_some());
    }
}
