//! Row types of the checkpoint store and their conversion into domain types.
//
// SQLite has no unsigned integers: heights, chain ids and counters are stored as
// INTEGER (i64) and converted at this boundary. Timestamps are unix milliseconds.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;

use crate::types::{
    ChainCheckpoint, CommitKey, CommitStatus, CrossChainEvent, DepositRecord, HeaderAnchor,
    PendingCommit,
};

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| eyre!("timestamp out of range: {}", ms))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("negative value {} in column {}", value, column))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| eyre!("value {} out of range in column {}", value, column))
}

/// Row of the `checkpoints` table
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    pub chain_id: i64,
    pub last_scanned_height: i64,
    pub block_hash: Option<String>,
    pub updated_at: i64,
}

impl TryFrom<CheckpointRow> for ChainCheckpoint {
    type Error = eyre::Report;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        Ok(ChainCheckpoint {
            chain_id: to_u64(row.chain_id, "chain_id")?,
            last_scanned_height: to_u64(row.last_scanned_height, "last_scanned_height")?,
            block_hash: row.block_hash,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

/// Row of the `commits` table
#[derive(Debug, Clone, FromRow)]
pub struct CommitRow {
    pub commit_key: String,
    pub source_chain_id: i64,
    pub source_height: i64,
    pub tx_hash: String,
    pub event_index: i64,
    pub destination_chain_id: i64,
    pub payload: Vec<u8>,
    pub merkle_proof: Vec<u8>,
    pub header: Option<String>,
    pub status: String,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub destination_tx_hash: Option<String>,
    pub created_at: i64,
}

/// SELECT column list matching [`CommitRow`]
pub const COMMIT_SELECT: &str = "commit_key, source_chain_id, source_height, tx_hash, \
    event_index, destination_chain_id, payload, merkle_proof, header, status, attempts, \
    last_attempt_at, next_attempt_at, last_error, destination_tx_hash, created_at";

impl TryFrom<CommitRow> for PendingCommit {
    type Error = eyre::Report;

    fn try_from(row: CommitRow) -> Result<Self> {
        let header = row
            .header
            .as_deref()
            .map(serde_json::from_str::<HeaderAnchor>)
            .transpose()
            .wrap_err_with(|| format!("corrupt header anchor for commit {}", row.commit_key))?;

        let event = CrossChainEvent {
            source_chain_id: to_u64(row.source_chain_id, "source_chain_id")?,
            source_height: to_u64(row.source_height, "source_height")?,
            tx_hash: row.tx_hash,
            event_index: to_u32(row.event_index, "event_index")?,
            payload: row.payload,
            merkle_proof: row.merkle_proof,
            header,
        };

        let commit = PendingCommit {
            event,
            destination_chain_id: to_u64(row.destination_chain_id, "destination_chain_id")?,
            attempts: to_u32(row.attempts, "attempts")?,
            last_attempt_at: opt_from_millis(row.last_attempt_at)?,
            next_attempt_at: opt_from_millis(row.next_attempt_at)?,
            last_error: row.last_error,
            status: row.status.parse()?,
            destination_tx_hash: row.destination_tx_hash,
            created_at: from_millis(row.created_at)?,
        };

        if commit.key().to_string() != row.commit_key {
            return Err(eyre!(
                "commit key {} does not match its event columns",
                row.commit_key
            ));
        }

        Ok(commit)
    }
}

/// Row of the `deposits` table
#[derive(Debug, Clone, FromRow)]
pub struct DepositRow {
    pub deposit_id: String,
    pub source_chain_id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub observed_height: i64,
    pub observed_at: i64,
    pub matched_commit: Option<String>,
    pub reinjected_at: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub parked_at: Option<i64>,
    pub park_reason: Option<String>,
}

pub const DEPOSIT_SELECT: &str = "deposit_id, source_chain_id, tx_hash, log_index, \
    observed_height, observed_at, matched_commit, reinjected_at, last_checked_at, \
    parked_at, park_reason";

impl TryFrom<DepositRow> for DepositRecord {
    type Error = eyre::Report;

    fn try_from(row: DepositRow) -> Result<Self> {
        Ok(DepositRecord {
            deposit_id: row.deposit_id,
            source_chain_id: to_u64(row.source_chain_id, "source_chain_id")?,
            tx_hash: row.tx_hash,
            log_index: to_u32(row.log_index, "log_index")?,
            observed_height: to_u64(row.observed_height, "observed_height")?,
            observed_at: from_millis(row.observed_at)?,
            matched_commit: row
                .matched_commit
                .as_deref()
                .map(str::parse::<CommitKey>)
                .transpose()?,
            reinjected_at: opt_from_millis(row.reinjected_at)?,
            last_checked_at: opt_from_millis(row.last_checked_at)?,
            parked_at: opt_from_millis(row.parked_at)?,
            park_reason: row.park_reason,
        })
    }
}

/// Encode a header anchor for the `header` column
pub(crate) fn encode_header(header: Option<&HeaderAnchor>) -> Result<Option<String>> {
    header
        .map(serde_json::to_string)
        .transpose()
        .wrap_err("Failed to encode header anchor")
}

/// Status counts used by the health endpoint and queue gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub submitting: i64,
    pub committed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn get(&self, status: CommitStatus) -> i64 {
        match status {
            CommitStatus::Queued => self.queued,
            CommitStatus::Submitting => self.submitting,
            CommitStatus::Committed => self.committed,
            CommitStatus::Failed => self.failed,
        }
    }

    pub(crate) fn set(&mut self, status: CommitStatus, count: i64) {
        match status {
            CommitStatus::Queued => self.queued = count,
            CommitStatus::Submitting => self.submitting = count,
            CommitStatus::Committed => self.committed = count,
            CommitStatus::Failed => self.failed = count,
        }
    }
}
