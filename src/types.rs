//! Common types for cross-chain relaying
//!
//! Events extracted by the monitors, the pending commits the scheduler drains,
//! the deposit records the reconciler sweeps and the per-chain checkpoints.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chain identifier as registered on the relay chain
pub type ChainId = u64;

/// Normalize a transaction hash to lowercase `0x`-prefixed hex
pub fn normalize_tx_hash(tx_hash: &str) -> String {
    let trimmed = tx_hash.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

// ============================================================================
// Commit identity
// ============================================================================

/// Unique identity of a cross-chain event: `(source chain, tx hash, event index)`.
///
/// Every store write keyed by this value is idempotent, so an event extracted twice
/// (re-scan after a crash, reconciler re-injection) stays a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitKey {
    pub source_chain_id: ChainId,
    pub tx_hash: String,
    pub event_index: u32,
}

impl CommitKey {
    pub fn new(source_chain_id: ChainId, tx_hash: &str, event_index: u32) -> Self {
        Self {
            source_chain_id,
            tx_hash: normalize_tx_hash(tx_hash),
            event_index,
        }
    }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.source_chain_id, self.tx_hash, self.event_index
        )
    }
}

impl FromStr for CommitKey {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(chain), Some(tx_hash), Some(index)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(eyre!("malformed commit key: {}", s));
        };
        let source_chain_id = chain
            .parse()
            .map_err(|_| eyre!("malformed chain id in commit key: {}", s))?;
        let event_index = index
            .parse()
            .map_err(|_| eyre!("malformed event index in commit key: {}", s))?;
        Ok(Self::new(source_chain_id, tx_hash, event_index))
    }
}

// ============================================================================
// Events
// ============================================================================

/// Relay-chain header material the side chain needs to verify a relay-chain proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderAnchor {
    /// Header of the block whose state root commits to the proof
    #[serde(with = "hex::serde")]
    pub raw_header: Vec<u8>,
    /// Proof linking `raw_header` to a header already known by the side chain
    #[serde(with = "hex::serde")]
    pub header_proof: Vec<u8>,
    /// Current header that `header_proof` is anchored in
    #[serde(with = "hex::serde")]
    pub cur_raw_header: Vec<u8>,
    /// Consensus signatures over the signed header
    #[serde(with = "hex::serde")]
    pub signatures: Vec<u8>,
}

/// A cross-chain event extracted from a finalized block. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossChainEvent {
    pub source_chain_id: ChainId,
    pub source_height: u64,
    pub tx_hash: String,
    pub event_index: u32,
    /// Raw cross-chain message as emitted by the source bridge contract
    pub payload: Vec<u8>,
    /// Inclusion proof of `payload` at `source_height`
    pub merkle_proof: Vec<u8>,
    /// Present for relay-chain events only
    pub header: Option<HeaderAnchor>,
}

impl CrossChainEvent {
    pub fn key(&self) -> CommitKey {
        CommitKey::new(self.source_chain_id, &self.tx_hash, self.event_index)
    }
}

// ============================================================================
// Pending commits
// ============================================================================

/// Lifecycle of a pending commit.
///
/// Queued → Submitting → {Committed | Queued (retry) | Failed}. Committed and
/// Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    Queued,
    Submitting,
    Committed,
    Failed,
}

impl CommitStatus {
    pub const ALL: [CommitStatus; 4] = [
        CommitStatus::Queued,
        CommitStatus::Submitting,
        CommitStatus::Committed,
        CommitStatus::Failed,
    ];

    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Queued => "queued",
            CommitStatus::Submitting => "submitting",
            CommitStatus::Committed => "committed",
            CommitStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommitStatus::Committed | CommitStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: CommitStatus) -> bool {
        matches!(
            (self, next),
            (CommitStatus::Queued, CommitStatus::Submitting)
                | (CommitStatus::Submitting, CommitStatus::Committed)
                | (CommitStatus::Submitting, CommitStatus::Queued)
                | (CommitStatus::Submitting, CommitStatus::Failed)
        )
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CommitStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(CommitStatus::Queued),
            "submitting" => Ok(CommitStatus::Submitting),
            "committed" => Ok(CommitStatus::Committed),
            "failed" => Ok(CommitStatus::Failed),
            other => Err(eyre!("unknown commit status: {}", other)),
        }
    }
}

/// A relay task awaiting or undergoing submission to the destination chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommit {
    pub event: CrossChainEvent,
    pub destination_chain_id: ChainId,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the scheduler may pick the commit up again
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: CommitStatus,
    /// Hash of the destination transaction that committed the event, when known
    pub destination_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingCommit {
    /// A freshly extracted commit, ready for its first submission
    pub fn queued(event: CrossChainEvent, destination_chain_id: ChainId) -> Self {
        Self {
            event,
            destination_chain_id,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
            status: CommitStatus::Queued,
            destination_tx_hash: None,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CommitKey {
        self.event.key()
    }

    /// Queued and past its retry time
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CommitStatus::Queued && self.next_attempt_at.map_or(true, |t| t <= now)
    }
}

// ============================================================================
// Deposits and checkpoints
// ============================================================================

/// A deposit observed on the source chain, used to detect commits that never made it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub deposit_id: String,
    pub source_chain_id: ChainId,
    pub tx_hash: String,
    pub log_index: u32,
    pub observed_height: u64,
    pub observed_at: DateTime<Utc>,
    pub matched_commit: Option<CommitKey>,
    pub reinjected_at: Option<DateTime<Utc>>,
    /// Last time the reconciler examined the deposit
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Set once the reconciler gave up on the deposit
    pub parked_at: Option<DateTime<Utc>>,
    pub park_reason: Option<String>,
}

impl DepositRecord {
    pub fn observed(source_chain_id: ChainId, tx_hash: &str, log_index: u32, height: u64) -> Self {
        let tx_hash = normalize_tx_hash(tx_hash);
        Self {
            deposit_id: format!("{}:{}:{}", source_chain_id, tx_hash, log_index),
            source_chain_id,
            tx_hash,
            log_index,
            observed_height: height,
            observed_at: Utc::now(),
            matched_commit: None,
            reinjected_at: None,
            last_checked_at: None,
            parked_at: None,
            park_reason: None,
        }
    }
}

/// Last fully processed height of one monitored chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCheckpoint {
    pub chain_id: ChainId,
    pub last_scanned_height: u64,
    /// Hash of the block at `last_scanned_height`; `None` after a forced reset
    pub block_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}
