//! Chain adapter boundary
//!
//! The monitors, the scheduler and the reconciler only see these traits. The
//! concrete adapters are [`side::SideChainClient`] (EVM side chain over alloy) and
//! [`relay::RelayChainClient`] (relay chain JSON-RPC).

use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;

use crate::scheduler::retry::{classify_error, ErrorClass};
use crate::types::{ChainId, CrossChainEvent, DepositRecord, PendingCommit};

pub mod contracts;
pub mod merkle;
pub mod relay;
pub mod side;

pub use relay::RelayChainClient;
pub use side::SideChainClient;

/// Errors surfaced by chain adapters, already classified for the caller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Node unreachable, timeouts, nonce/gas contention: retry later
    #[error("transient chain error: {0}")]
    Transient(String),
    /// The destination chain already holds the event
    #[error("event already relayed: {0}")]
    AlreadyRelayed(String),
    /// The destination chain rejected the proof or payload
    #[error("rejected by destination chain: {0}")]
    Rejected(String),
    /// Chain returned data the relayer cannot interpret
    #[error("malformed chain data: {0}")]
    Malformed(String),
    /// Inclusion proof could not be built for an extracted event
    #[error("proof construction failed: {0}")]
    Proof(String),
}

impl ChainError {
    /// Classify a raw client error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::Duplicate => ChainError::AlreadyRelayed(message),
            ErrorClass::Permanent => ChainError::Rejected(message),
            ErrorClass::Transient | ErrorClass::Contention | ErrorClass::Unknown => {
                ChainError::Transient(message)
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

/// Identity of a fetched block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub height: u64,
    pub hash: String,
    /// Hash of the block at `height - 1`, when the chain exposes it
    pub parent_hash: Option<String>,
}

/// Everything a monitor persists for one height
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub events: Vec<CrossChainEvent>,
    pub deposits: Vec<DepositRecord>,
}

/// Read side of a monitored chain
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Chain-specific block payload carried from fetching to extraction
    type Block: Send + Sync;

    /// Id of the scanned chain
    fn chain_id(&self) -> ChainId;

    /// Human readable name used in logs and metric labels
    fn name(&self) -> &str;

    async fn head_height(&self) -> Result<u64, ChainError>;

    async fn block_hash(&self, height: u64) -> Result<String, ChainError>;

    async fn fetch_block(&self, height: u64) -> Result<(BlockRef, Self::Block), ChainError>;

    /// Extract the events destined for the peer chain and build their proofs
    async fn extract(&self, block: &BlockRef, data: &Self::Block) -> Result<Extraction, ChainError>;
}

/// Write side of a destination chain
#[async_trait]
pub trait ChainWriter: Send + Sync {
    fn chain_id(&self) -> ChainId;

    fn name(&self) -> &str;

    /// Whether the destination chain already executed the commit's event
    async fn is_relayed(&self, commit: &PendingCommit) -> Result<bool, ChainError>;

    /// Build, sign with `identity` and broadcast the destination transaction.
    /// Returns the destination transaction hash once it is accepted.
    async fn submit(&self, commit: &PendingCommit, identity: Address) -> Result<String, ChainError>;
}

/// Relay-chain epoch the side chain's data contract currently trusts
#[async_trait]
pub trait EpochSource: Send + Sync {
    /// Relay height the current epoch starts at
    async fn current_epoch_start(&self) -> Result<u64, ChainError>;
}

/// Independent path from an observed deposit back to its cross-chain event(s)
#[async_trait]
pub trait DepositSource: Send + Sync {
    async fn rederive(&self, deposit: &DepositRecord) -> Result<Vec<CrossChainEvent>, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_message_classification() {
        assert!(ChainError::from_message("request timed out").is_transient());
        assert!(ChainError::from_message("nonce too low").is_transient());
        assert!(matches!(
            ChainError::from_message("execution reverted: invalid proof"),
            ChainError::Rejected(_)
        ));
        assert!(matches!(
            ChainError::from_message("the transaction has been executed!"),
            ChainError::AlreadyRelayed(_)
        ));
    }
}
