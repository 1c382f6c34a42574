//! Checkpoint store
//!
//! Durable record of scan progress per chain, pending commits and observed
//! deposits, backed by SQLite. Every write keyed by a [`CommitKey`] is
//! idempotent, and a checkpoint only moves together with the commits and
//! deposits found below it.

use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info};

pub mod models;

pub use models::*;

use crate::types::{
    ChainCheckpoint, ChainId, CommitKey, CommitStatus, DepositRecord, PendingCommit,
};

/// Handle on the relayer database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    /// Open (or create) the database file and run pending migrations
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .wrap_err_with(|| format!("Failed to open checkpoint store at {}", path))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(path = %path, "Checkpoint store opened");
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .wrap_err("Invalid in-memory connection string")?;

        // A single connection that never recycles: each connection would
        // otherwise get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .wrap_err("Failed to open in-memory checkpoint store")?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run pending migrations (uses the migration files in migrations/)
    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .wrap_err("Failed to run database migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    /// Last fully processed height of `chain_id`, if the chain was ever scanned
    pub async fn get_checkpoint(&self, chain_id: ChainId) -> Result<Option<ChainCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT chain_id, last_scanned_height, block_hash, updated_at \
             FROM checkpoints WHERE chain_id = ?",
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get checkpoint")?;

        row.map(ChainCheckpoint::try_from).transpose()
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<ChainCheckpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT chain_id, last_scanned_height, block_hash, updated_at \
             FROM checkpoints ORDER BY chain_id",
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list checkpoints")?;

        rows.into_iter().map(ChainCheckpoint::try_from).collect()
    }

    /// Atomically persist the commits and deposits found up to `height` and move
    /// the checkpoint of `chain_id` to `height`.
    ///
    /// The checkpoint only moves forward: a height at or below the stored one is
    /// rejected and nothing is written. Commits already present are left
    /// untouched. Returns the number of newly queued commits.
    pub async fn advance_checkpoint(
        &self,
        chain_id: ChainId,
        height: u64,
        block_hash: Option<&str>,
        commits: &[PendingCommit],
        deposits: &[DepositRecord],
    ) -> Result<u64> {
        let now = models::to_millis(Utc::now());
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin checkpoint transaction")?;

        // Write first so the transaction takes the write lock up front
        let moved = sqlx::query(
            "INSERT INTO checkpoints (chain_id, last_scanned_height, block_hash, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(chain_id) DO UPDATE SET \
                 last_scanned_height = excluded.last_scanned_height, \
                 block_hash = excluded.block_hash, \
                 updated_at = excluded.updated_at \
             WHERE excluded.last_scanned_height > checkpoints.last_scanned_height",
        )
        .bind(chain_id as i64)
        .bind(height as i64)
        .bind(block_hash)
        .bind(now)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to advance checkpoint")?
        .rows_affected();

        if moved == 0 {
            tx.rollback().await.ok();
            let current = self
                .get_checkpoint(chain_id)
                .await?
                .map(|c| c.last_scanned_height);
            return Err(eyre!(
                "checkpoint for chain {} cannot move from {:?} to {}",
                chain_id,
                current,
                height
            ));
        }

        let inserted = insert_commits(&mut tx, commits, now).await?;

        for deposit in deposits {
            insert_deposit(&mut tx, deposit).await?;
        }

        tx.commit()
            .await
            .wrap_err("Failed to commit checkpoint transaction")?;

        debug!(
            chain_id,
            height,
            commits = commits.len(),
            inserted,
            deposits = deposits.len(),
            "Checkpoint advanced"
        );
        Ok(inserted)
    }

    /// Overwrite the checkpoint regardless of its current value.
    ///
    /// Only used for the operator's forced start height; this is the one path
    /// that may move a checkpoint backwards.
    pub async fn reset_checkpoint(&self, chain_id: ChainId, height: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (chain_id, last_scanned_height, block_hash, updated_at) \
             VALUES (?, ?, NULL, ?) \
             ON CONFLICT(chain_id) DO UPDATE SET \
                 last_scanned_height = excluded.last_scanned_height, \
                 block_hash = NULL, \
                 updated_at = excluded.updated_at",
        )
        .bind(chain_id as i64)
        .bind(height as i64)
        .bind(models::to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .wrap_err("Failed to reset checkpoint")?;

        info!(chain_id, height, "Checkpoint reset");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------------

    /// Insert commits that are not stored yet. Returns how many were new.
    pub async fn enqueue_commits(&self, commits: &[PendingCommit]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin enqueue transaction")?;
        let inserted = insert_commits(&mut tx, commits, models::to_millis(Utc::now())).await?;
        tx.commit()
            .await
            .wrap_err("Failed to commit enqueue transaction")?;
        Ok(inserted)
    }

    pub async fn get_commit(&self, key: &CommitKey) -> Result<Option<PendingCommit>> {
        let row = sqlx::query_as::<_, CommitRow>(&format!(
            "SELECT {} FROM commits WHERE commit_key = ?",
            COMMIT_SELECT
        ))
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get commit")?;

        row.map(PendingCommit::try_from).transpose()
    }

    /// All commits in `status`, in source order
    pub async fn list_pending(&self, status: CommitStatus) -> Result<Vec<PendingCommit>> {
        let rows = sqlx::query_as::<_, CommitRow>(&format!(
            "SELECT {} FROM commits WHERE status = ? \
             ORDER BY source_chain_id, source_height, event_index",
            COMMIT_SELECT
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("SQL error listing {} commits: {:?}", status, e);
            e
        })
        .wrap_err("Failed to list pending commits")?;

        rows.into_iter().map(PendingCommit::try_from).collect()
    }

    /// Queued commits whose retry time has passed, oldest source position first
    pub async fn list_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<PendingCommit>> {
        let rows = sqlx::query_as::<_, CommitRow>(&format!(
            "SELECT {} FROM commits \
             WHERE status = 'queued' AND (next_attempt_at IS NULL OR next_attempt_at <= ?) \
             ORDER BY source_chain_id, source_height, event_index \
             LIMIT ?",
            COMMIT_SELECT
        ))
        .bind(models::to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list due commits")?;

        rows.into_iter().map(PendingCommit::try_from).collect()
    }

    /// Claim a queued commit for submission.
    ///
    /// Returns false when the commit is no longer queued (another worker took it
    /// or it reached a terminal state in the meantime).
    pub async fn mark_submitting(&self, key: &CommitKey, now: DateTime<Utc>) -> Result<bool> {
        let now = models::to_millis(now);
        let claimed = sqlx::query(
            "UPDATE commits SET status = 'submitting', last_attempt_at = ?, updated_at = ? \
             WHERE commit_key = ? AND status = 'queued'",
        )
        .bind(now)
        .bind(now)
        .bind(key.to_string())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to mark commit submitting")?
        .rows_affected();

        Ok(claimed == 1)
    }

    /// Move a commit to `status`, recording `error` when given.
    ///
    /// An error counts as a failed attempt. Transitions that the commit
    /// lifecycle does not allow are rejected, so a committed commit never goes
    /// back to the queue.
    pub async fn update_commit(
        &self,
        key: &CommitKey,
        status: CommitStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let from: Vec<&str> = CommitStatus::ALL
            .iter()
            .filter(|s| s.can_transition_to(status))
            .map(|s| s.as_str())
            .collect();
        if from.is_empty() {
            return Err(eyre!("no commit may enter status {}", status));
        }

        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE commits SET status = ?, \
                 last_error = COALESCE(?, last_error), \
                 attempts = attempts + ?, \
                 updated_at = ? \
             WHERE commit_key = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(error)
            .bind(i64::from(error.is_some()))
            .bind(models::to_millis(Utc::now()))
            .bind(key.to_string());
        for state in &from {
            query = query.bind(*state);
        }

        let updated = query
            .execute(&self.pool)
            .await
            .wrap_err("Failed to update commit")?
            .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(key, status).await);
        }
        Ok(())
    }

    /// Mark a submitting commit as committed on the destination chain
    pub async fn mark_committed(&self, key: &CommitKey, destination_tx_hash: Option<&str>) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE commits SET status = 'committed', \
                 destination_tx_hash = COALESCE(?, destination_tx_hash), \
                 next_attempt_at = NULL, \
                 updated_at = ? \
             WHERE commit_key = ? AND status = 'submitting'",
        )
        .bind(destination_tx_hash)
        .bind(models::to_millis(Utc::now()))
        .bind(key.to_string())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to mark commit committed")?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(key, CommitStatus::Committed).await);
        }
        Ok(())
    }

    /// Return a submitting commit to the queue after a transient failure
    pub async fn record_transient_failure(
        &self,
        key: &CommitKey,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE commits SET status = 'queued', \
                 attempts = attempts + 1, \
                 last_error = ?, \
                 next_attempt_at = ?, \
                 updated_at = ? \
             WHERE commit_key = ? AND status = 'submitting'",
        )
        .bind(error)
        .bind(models::to_millis(next_attempt_at))
        .bind(models::to_millis(Utc::now()))
        .bind(key.to_string())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to record transient failure")?
        .rows_affected();

        if updated == 0 {
            return Err(self.transition_error(key, CommitStatus::Queued).await);
        }
        Ok(())
    }

    /// Requeue commits left in `submitting` by a previous run.
    ///
    /// Their outcome is unknown; the scheduler checks the destination chain
    /// before broadcasting them again.
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let recovered = sqlx::query(
            "UPDATE commits SET status = 'queued', next_attempt_at = NULL, updated_at = ? \
             WHERE status = 'submitting'",
        )
        .bind(models::to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .wrap_err("Failed to recover in-flight commits")?
        .rows_affected();

        if recovered > 0 {
            info!(recovered, "Requeued commits left in submitting");
        }
        Ok(recovered)
    }

    /// Commits extracted from one source transaction
    pub async fn commits_for_tx(
        &self,
        source_chain_id: ChainId,
        tx_hash: &str,
    ) -> Result<Vec<PendingCommit>> {
        let rows = sqlx::query_as::<_, CommitRow>(&format!(
            "SELECT {} FROM commits WHERE source_chain_id = ? AND tx_hash = ? \
             ORDER BY event_index",
            COMMIT_SELECT
        ))
        .bind(source_chain_id as i64)
        .bind(crate::types::normalize_tx_hash(tx_hash))
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get commits for transaction")?;

        rows.into_iter().map(PendingCommit::try_from).collect()
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM commits GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to count commits")?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.set(status.parse()?, count);
        }
        Ok(counts)
    }

    async fn transition_error(&self, key: &CommitKey, to: CommitStatus) -> eyre::Report {
        match self.get_commit(key).await {
            Ok(Some(commit)) => eyre!(
                "commit {} cannot move from {} to {}",
                key,
                commit.status,
                to
            ),
            Ok(None) => eyre!("unknown commit {}", key),
            Err(e) => e,
        }
    }

    // ------------------------------------------------------------------------
    // Deposits
    // ------------------------------------------------------------------------

    /// Record an observed deposit. Matching and re-injection marks are kept.
    pub async fn upsert_deposit(&self, deposit: &DepositRecord) -> Result<()> {
        sqlx::query(UPSERT_DEPOSIT)
            .bind(&deposit.deposit_id)
            .bind(deposit.source_chain_id as i64)
            .bind(&deposit.tx_hash)
            .bind(deposit.log_index as i64)
            .bind(deposit.observed_height as i64)
            .bind(models::to_millis(deposit.observed_at))
            .execute(&self.pool)
            .await
            .wrap_err("Failed to upsert deposit")?;
        Ok(())
    }

    /// Unparked, unmatched deposits observed at or before `observed_before`.
    /// Deposits never examined come first, then the least recently examined.
    pub async fn unmatched_deposits(
        &self,
        observed_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DepositRecord>> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits \
             WHERE matched_commit IS NULL AND parked_at IS NULL AND observed_at <= ? \
             ORDER BY COALESCE(last_checked_at, 0), observed_at, deposit_id LIMIT ?",
            DEPOSIT_SELECT
        ))
        .bind(models::to_millis(observed_before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to list unmatched deposits")?;

        rows.into_iter().map(DepositRecord::try_from).collect()
    }

    pub async fn get_deposit(&self, deposit_id: &str) -> Result<Option<DepositRecord>> {
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE deposit_id = ?",
            DEPOSIT_SELECT
        ))
        .bind(deposit_id)
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get deposit")?;

        row.map(DepositRecord::try_from).transpose()
    }

    /// Link a deposit to the commit that carried it
    pub async fn match_deposit(&self, deposit_id: &str, key: &CommitKey) -> Result<()> {
        sqlx::query("UPDATE deposits SET matched_commit = ? WHERE deposit_id = ?")
            .bind(key.to_string())
            .bind(deposit_id)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to match deposit")?;
        Ok(())
    }

    pub async fn mark_deposit_reinjected(&self, deposit_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE deposits SET reinjected_at = ?, last_checked_at = ? WHERE deposit_id = ?")
            .bind(models::to_millis(at))
            .bind(models::to_millis(at))
            .bind(deposit_id)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to mark deposit reinjected")?;
        Ok(())
    }

    /// Move a deposit to the back of the sweep order
    pub async fn touch_deposit(&self, deposit_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE deposits SET last_checked_at = ? WHERE deposit_id = ?")
            .bind(models::to_millis(at))
            .bind(deposit_id)
            .execute(&self.pool)
            .await
            .wrap_err("Failed to touch deposit")?;
        Ok(())
    }

    /// Take a deposit out of the sweep for good
    pub async fn park_deposit(&self, deposit_id: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE deposits SET parked_at = ?, park_reason = ?, last_checked_at = ? \
             WHERE deposit_id = ? AND matched_commit IS NULL",
        )
        .bind(models::to_millis(at))
        .bind(reason)
        .bind(models::to_millis(at))
        .bind(deposit_id)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to park deposit")?;
        Ok(())
    }

    /// Number of parked deposits, exported as a gauge
    pub async fn parked_deposits(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deposits WHERE parked_at IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .wrap_err("Failed to count parked deposits")?;
        Ok(count)
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const UPSERT_DEPOSIT: &str = "INSERT INTO deposits \
    (deposit_id, source_chain_id, tx_hash, log_index, observed_height, observed_at) \
    VALUES (?, ?, ?, ?, ?, ?) \
    ON CONFLICT(deposit_id) DO UPDATE SET observed_height = excluded.observed_height";

async fn insert_deposit(tx: &mut Transaction<'_, Sqlite>, deposit: &DepositRecord) -> Result<()> {
    sqlx::query(UPSERT_DEPOSIT)
        .bind(&deposit.deposit_id)
        .bind(deposit.source_chain_id as i64)
        .bind(&deposit.tx_hash)
        .bind(deposit.log_index as i64)
        .bind(deposit.observed_height as i64)
        .bind(models::to_millis(deposit.observed_at))
        .execute(&mut **tx)
        .await
        .wrap_err("Failed to insert deposit")?;
    Ok(())
}

async fn insert_commits(
    tx: &mut Transaction<'_, Sqlite>,
    commits: &[PendingCommit],
    now: i64,
) -> Result<u64> {
    let mut inserted = 0;
    for commit in commits {
        let event = &commit.event;
        let header = models::encode_header(event.header.as_ref())?;
        inserted += sqlx::query(
            "INSERT INTO commits (commit_key, source_chain_id, source_height, tx_hash, \
                 event_index, destination_chain_id, payload, merkle_proof, header, status, \
                 attempts, next_attempt_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', 0, NULL, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(commit.key().to_string())
        .bind(event.source_chain_id as i64)
        .bind(event.source_height as i64)
        .bind(crate::types::normalize_tx_hash(&event.tx_hash))
        .bind(event.event_index as i64)
        .bind(commit.destination_chain_id as i64)
        .bind(&event.payload)
        .bind(&event.merkle_proof)
        .bind(header)
        .bind(models::to_millis(commit.created_at))
        .bind(now)
        .execute(&mut **tx)
        .await
        .wrap_err_with(|| format!("Failed to insert commit {}", commit.key()))?
        .rows_affected();
    }
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CrossChainEvent;

    fn event(tx: &str, index: u32, height: u64) -> CrossChainEvent {
        CrossChainEvent {
            source_chain_id: 7,
            source_height: height,
            tx_hash: tx.to_string(),
            event_index: index,
            payload: vec![0xde, 0xad],
            merkle_proof: vec![0xbe, 0xef],
            header: None,
        }
    }

    fn commit(tx: &str, index: u32, height: u64) -> PendingCommit {
        PendingCommit::queued(event(tx, index, height), 2)
    }

    #[tokio::test]
    async fn test_checkpoint_advances_with_commits() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        assert!(store.get_checkpoint(7).await.unwrap().is_none());

        let inserted = store
            .advance_checkpoint(7, 101, Some("0x01"), &[commit("0xaa", 0, 101)], &[])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let checkpoint = store.get_checkpoint(7).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_scanned_height, 101);
        assert_eq!(checkpoint.block_hash.as_deref(), Some("0x01"));
        assert_eq!(store.list_pending(CommitStatus::Queued).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        store.advance_checkpoint(7, 100, None, &[], &[]).await.unwrap();

        let err = store
            .advance_checkpoint(7, 100, None, &[commit("0xaa", 0, 100)], &[])
            .await;
        assert!(err.is_err());
        assert!(store.advance_checkpoint(7, 99, None, &[], &[]).await.is_err());

        // Rejected batch wrote nothing
        assert!(store.list_pending(CommitStatus::Queued).await.unwrap().is_empty());
        assert_eq!(
            store.get_checkpoint(7).await.unwrap().unwrap().last_scanned_height,
            100
        );
    }

    #[tokio::test]
    async fn test_reset_checkpoint_may_decrease() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        store.advance_checkpoint(7, 500, Some("0x05"), &[], &[]).await.unwrap();
        store.reset_checkpoint(7, 50).await.unwrap();

        let checkpoint = store.get_checkpoint(7).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_scanned_height, 50);
        assert!(checkpoint.block_hash.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let first = commit("0xAA", 0, 10);

        assert_eq!(store.enqueue_commits(&[first.clone()]).await.unwrap(), 1);
        assert_eq!(store.enqueue_commits(&[first.clone()]).await.unwrap(), 0);
        // Same identity under a differently cased hash
        assert_eq!(store.enqueue_commits(&[commit("0xaa", 0, 10)]).await.unwrap(), 0);
        assert_eq!(store.enqueue_commits(&[commit("0xaa", 1, 10)]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_lifecycle() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let pending = commit("0xaa", 0, 10);
        let key = pending.key();
        store.enqueue_commits(&[pending]).await.unwrap();

        let now = Utc::now();
        assert!(store.mark_submitting(&key, now).await.unwrap());
        assert!(!store.mark_submitting(&key, now).await.unwrap());

        store
            .record_transient_failure(&key, "timeout", now + chrono::Duration::seconds(2))
            .await
            .unwrap();
        let stored = store.get_commit(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitStatus::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        // Not due until the backoff passes
        assert!(store.list_due(now, 10).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(3);
        assert_eq!(store.list_due(later, 10).await.unwrap().len(), 1);

        assert!(store.mark_submitting(&key, later).await.unwrap());
        store.mark_committed(&key, Some("0xfeed")).await.unwrap();

        let stored = store.get_commit(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitStatus::Committed);
        assert_eq!(stored.destination_tx_hash.as_deref(), Some("0xfeed"));
    }

    #[tokio::test]
    async fn test_committed_never_regresses() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let pending = commit("0xaa", 0, 10);
        let key = pending.key();
        store.enqueue_commits(&[pending.clone()]).await.unwrap();
        store.mark_submitting(&key, Utc::now()).await.unwrap();
        store.mark_committed(&key, None).await.unwrap();

        assert!(store.update_commit(&key, CommitStatus::Queued, None).await.is_err());
        assert!(store
            .update_commit(&key, CommitStatus::Failed, Some("late error"))
            .await
            .is_err());
        assert!(!store.mark_submitting(&key, Utc::now()).await.unwrap());
        // Re-extraction leaves the committed row alone
        assert_eq!(store.enqueue_commits(&[pending]).await.unwrap(), 0);

        let stored = store.get_commit(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitStatus::Committed);
    }

    #[tokio::test]
    async fn test_update_commit_failed_counts_attempt() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let pending = commit("0xaa", 0, 10);
        let key = pending.key();
        store.enqueue_commits(&[pending]).await.unwrap();
        store.mark_submitting(&key, Utc::now()).await.unwrap();

        store
            .update_commit(&key, CommitStatus::Failed, Some("invalid proof"))
            .await
            .unwrap();

        let stored = store.get_commit(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(store.status_counts().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_recover_in_flight() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let pending = commit("0xaa", 0, 10);
        let key = pending.key();
        store.enqueue_commits(&[pending]).await.unwrap();
        store.mark_submitting(&key, Utc::now()).await.unwrap();

        assert_eq!(store.recover_in_flight().await.unwrap(), 1);
        let stored = store.get_commit(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, CommitStatus::Queued);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_header_anchor_persists() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let mut pending = commit("0xaa", 0, 10);
        pending.event.header = Some(crate::types::HeaderAnchor {
            raw_header: vec![1],
            header_proof: vec![2],
            cur_raw_header: vec![3],
            signatures: vec![4, 5],
        });
        store.enqueue_commits(&[pending.clone()]).await.unwrap();

        let stored = store.get_commit(&pending.key()).await.unwrap().unwrap();
        assert_eq!(stored.event, pending.event);
    }

    #[tokio::test]
    async fn test_deposits_match_and_window() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let mut deposit = DepositRecord::observed(7, "0xaa", 3, 10);
        deposit.observed_at = Utc::now() - chrono::Duration::seconds(900);
        store.upsert_deposit(&deposit).await.unwrap();
        store
            .upsert_deposit(&DepositRecord::observed(7, "0xbb", 0, 11))
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(600);
        let old = store.unmatched_deposits(cutoff, 10).await.unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].deposit_id, deposit.deposit_id);

        let key = CommitKey::new(7, "0xaa", 0);
        store.match_deposit(&deposit.deposit_id, &key).await.unwrap();
        assert!(store.unmatched_deposits(cutoff, 10).await.unwrap().is_empty());

        // Observing again keeps the match
        store.upsert_deposit(&deposit).await.unwrap();
        let stored = store.get_deposit(&deposit.deposit_id).await.unwrap().unwrap();
        assert_eq!(stored.matched_commit, Some(key));
    }

    #[tokio::test]
    async fn test_sweep_order_rotates_and_skips_parked() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, tx) in ["0xa1", "0xa2", "0xa3"].iter().enumerate() {
            let mut deposit = DepositRecord::observed(7, tx, 0, 10 + i as u64);
            deposit.observed_at = now - chrono::Duration::seconds(3000 - i as i64);
            store.upsert_deposit(&deposit).await.unwrap();
            ids.push(deposit.deposit_id);
        }

        let first: Vec<_> = store
            .unmatched_deposits(now, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.deposit_id)
            .collect();
        assert_eq!(first, vec![ids[0].clone(), ids[1].clone()]);

        store.touch_deposit(&ids[0], now).await.unwrap();
        store.park_deposit(&ids[1], "no_event", now).await.unwrap();

        let second: Vec<_> = store
            .unmatched_deposits(now, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.deposit_id)
            .collect();
        assert_eq!(second, vec![ids[2].clone(), ids[0].clone()]);

        let parked = store.get_deposit(&ids[1]).await.unwrap().unwrap();
        assert!(parked.parked_at.is_some());
        assert_eq!(parked.park_reason.as_deref(), Some("no_event"));
        assert_eq!(store.parked_deposits().await.unwrap(), 1);

        // Observing a parked deposit again keeps it parked
        let mut again = DepositRecord::observed(7, "0xa2", 0, 11);
        again.observed_at = now;
        store.upsert_deposit(&again).await.unwrap();
        assert!(store.get_deposit(&ids[1]).await.unwrap().unwrap().parked_at.is_some());
    }

    #[tokio::test]
    async fn test_commits_for_tx() {
        let store = CheckpointStore::open_in_memory().await.unwrap();
        store
            .enqueue_commits(&[commit("0xaa", 1, 10), commit("0xaa", 0, 10), commit("0xbb", 0, 11)])
            .await
            .unwrap();

        let found = store.commits_for_tx(7, "0xAA").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].event.event_index, 0);
        assert!(store.commits_for_tx(8, "0xaa").await.unwrap().is_empty());
    }
}
