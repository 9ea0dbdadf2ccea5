//! Replica reconciliation for a sharded, replicated key-value store.
//!
//! Every peer runs a [`Reactor`] that watches a declarative [`Blueprint`]
//! (peer -> region -> role) and drives its local replicas toward it: it
//! backfills data from other replicas, opens branches in the
//! [`BranchHistory`] when it becomes primary, and publishes what it is doing
//! through the echo-acknowledged directory so routers and other reactors act
//! only on state the publisher has committed to.
//!
//! The transport, gossip and storage engine are external collaborators; the
//! in-process stand-ins in [`network`], [`store`] and [`cluster`] implement
//! their interfaces for tests and the `holo-reactor` binary.

pub mod advertiser;
pub mod backfill;
pub mod blueprint;
pub mod branch;
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod echo;
pub mod error;
pub mod network;
pub mod reactor;
pub mod region;
pub mod router;
pub mod stats;
pub mod store;

pub use blueprint::{Blueprint, Role};
pub use branch::{BranchHistory, BranchId, Version, VersionRange};
pub use cluster::LocalCluster;
pub use config::ReactorConfig;
pub use directory::{ActivityCard, ActivityKind, ReactorCard};
pub use error::{ReactorError, ReactorResult};
pub use network::PeerId;
pub use reactor::{Reactor, ReactorSettings};
pub use region::{Key, Region, RegionMap};
pub use router::NamespaceRouter;
pub use stats::StatsSnapshot;
pub use store::{MemoryStore, ReplicaStore};
