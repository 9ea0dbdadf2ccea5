//! Reactor error taxonomy.
//!
//! None of these are fatal to the process. Region tasks absorb them with
//! retry and backoff; only the bounded wait surfaces `WaitTimeout` to its
//! caller.

use crate::branch::BranchId;
use crate::directory::Mismatch;
use crate::network::PeerId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactorError {
    #[error("malformed blueprint: {0}")]
    MalformedBlueprint(String),

    #[error("backfill source {peer} unavailable: {reason}")]
    BackfillSourceUnavailable { peer: PeerId, reason: String },

    #[error("backfill of {region} from {peer} aborted")]
    BackfillAborted { peer: PeerId, region: String },

    #[error(
        "directory echo version {version} not acknowledged by {missing:?} within {timeout_ms}ms"
    )]
    DirectoryEchoTimeout {
        version: u64,
        missing: Vec<PeerId>,
        timeout_ms: u64,
    },

    #[error("{region} is unsatisfiable: {reason}")]
    Unsatisfiable { region: String, reason: String },

    #[error("peer {peer} is unreachable")]
    PeerUnreachable { peer: PeerId },

    #[error("peer {peer} is not primary for key {key}")]
    NotPrimary { peer: PeerId, key: String },

    #[error("no primary accepted the request for key {key}")]
    NoPrimary { key: String },

    #[error("branch {0} is not known to the local branch history")]
    UnknownBranch(BranchId),

    #[error("invalid branch: {0}")]
    InvalidBranch(String),

    #[error(
        "blueprint not satisfied within {timeout_ms}ms ({} mismatches)",
        .mismatches.len()
    )]
    WaitTimeout {
        timeout_ms: u64,
        mismatches: Vec<Mismatch>,
    },

    /// The waiting task was cancelled by a superseding instruction.
    #[error("interrupted")]
    Interrupted,
}

impl ReactorError {
    pub fn unsatisfiable(region: impl ToString, reason: impl Into<String>) -> Self {
        ReactorError::Unsatisfiable {
            region: region.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ReactorError::Interrupted)
    }
}

pub type ReactorResult<T> = Result<T, ReactorError>;

/// Milliseconds for timeout reports, saturating instead of truncating.
pub(crate) fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
