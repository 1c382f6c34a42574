//! Fatal error kinds
//!
//! Chain adapter errors live in [`crate::chain::ChainError`]. The errors here
//! stop the process: they are returned from a task, found by `main` through
//! `downcast_ref` and turned into a non-zero exit.

use thiserror::Error;

use crate::types::ChainId;

/// The chain no longer agrees with what the relayer recorded.
///
/// Continuing would relay events from an abandoned fork or skip events, so
/// the monitor halts instead of guessing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("reorg on chain {chain_id} at height {height}: recorded {recorded}, chain reports {observed}")]
    Reorg {
        chain_id: ChainId,
        height: u64,
        recorded: String,
        observed: String,
    },

    #[error("malformed data on chain {chain_id} at height {height}: {reason}")]
    Malformed {
        chain_id: ChainId,
        height: u64,
        reason: String,
    },

    #[error("cannot build proof on chain {chain_id} at height {height}: {reason}")]
    Proof {
        chain_id: ChainId,
        height: u64,
        reason: String,
    },
}

impl ConsistencyError {
    pub fn chain_id(&self) -> ChainId {
        match self {
            ConsistencyError::Reorg { chain_id, .. }
            | ConsistencyError::Malformed { chain_id, .. }
            | ConsistencyError::Proof { chain_id, .. } => *chain_id,
        }
    }

    /// Find a consistency error anywhere in an eyre chain
    pub fn find(report: &eyre::Report) -> Option<&ConsistencyError> {
        report
            .chain()
            .find_map(|cause| cause.downcast_ref::<ConsistencyError>())
    }
}
