//! Commit scheduler
//!
//! Drains due commits from the store and submits them to their destination
//! chain. Every commit is claimed (`queued` → `submitting`) before any
//! broadcast, and the destination chain is asked whether the event is already
//! there before a new transaction is built. A commit whose broadcast timed out
//! is therefore recognised on its next attempt instead of being sent twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, ChainWriter};
use crate::metrics;
use crate::monitor::sleep_or_cancel;
use crate::store::CheckpointStore;
use crate::types::{ChainId, CommitStatus, PendingCommit};

pub mod accounts;
pub mod retry;

use accounts::AccountPool;
use retry::RetryConfig;

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: std::time::Duration,
    pub batch_limit: u32,
    pub max_parallel_submissions: usize,
    pub retry: RetryConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &crate::config::SchedulerConfig) -> Self {
        Self {
            interval: config.interval(),
            batch_limit: config.batch_limit,
            max_parallel_submissions: config.max_parallel_submissions,
            retry: config.retry(),
        }
    }
}

/// Destination chain writer and the accounts allowed to submit to it
struct Route {
    writer: Arc<dyn ChainWriter>,
    accounts: AccountPool,
}

/// Outcome of one commit within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    AlreadyRelayed,
    Retrying,
    Failed,
    /// Claimed elsewhere or cancelled before broadcast
    Skipped,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::AlreadyRelayed => "already_relayed",
            Outcome::Retrying => "retrying",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

/// Counts of one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub committed: usize,
    pub already_relayed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Commits whose processing hit a store error
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Committed => self.committed += 1,
            Outcome::AlreadyRelayed => self.already_relayed += 1,
            Outcome::Retrying => self.retrying += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct CommitScheduler {
    store: CheckpointStore,
    routes: HashMap<ChainId, Route>,
    settings: SchedulerSettings,
}

impl CommitScheduler {
    pub fn new(store: CheckpointStore, settings: SchedulerSettings) -> Self {
        Self {
            store,
            routes: HashMap::new(),
            settings,
        }
    }

    /// Register the writer of a destination chain and its submitting accounts
    pub fn add_route(&mut self, writer: Arc<dyn ChainWriter>, accounts: &[Address]) -> Result<()> {
        let chain_id = writer.chain_id();
        let accounts = AccountPool::new(accounts)
            .wrap_err_with(|| format!("No submitting accounts for {}", writer.name()))?;
        info!(
            destination = writer.name(),
            chain_id,
            accounts = accounts.size(),
            "Registered destination chain"
        );
        self.routes.insert(chain_id, Route { writer, accounts });
        Ok(())
    }

    /// Run until cancelled. Failed ticks are logged and retried on the next interval.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            match self.store.recover_in_flight().await {
                Ok(_) => break,
                Err(e) => {
                    metrics::record_error("scheduler", "recovery");
                    error!(error = ?e, "Failed to recover in-flight commits, retrying");
                    if !sleep_or_cancel(&cancel, self.settings.interval).await {
                        info!("Commit scheduler stopped");
                        return Ok(());
                    }
                }
            }
        }

        let mut timer = tokio::time::interval(self.settings.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            destinations = self.routes.len(),
            "Commit scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Commit scheduler stopped");
                    return Ok(());
                }
                _ = timer.tick() => {
                    match self.tick_at(Utc::now(), &cancel).await {
                        Ok(summary) if summary.due > 0 => info!(
                            due = summary.due,
                            committed = summary.committed,
                            already_relayed = summary.already_relayed,
                            retrying = summary.retrying,
                            failed = summary.failed,
                            errors = summary.errors,
                            "Scheduler tick"
                        ),
                        Ok(_) => {}
                        Err(e) => {
                            metrics::record_error("scheduler", "tick");
                            error!(error = ?e, "Scheduler tick failed, retrying next interval");
                        }
                    }
                    match self.store.status_counts().await {
                        Ok(counts) => metrics::set_queue(&counts),
                        Err(e) => warn!(error = %e, "Failed to refresh queue gauges"),
                    }
                }
            }
        }
    }

    /// Process every commit due at `now`. Returns once every claimed commit settled.
    pub async fn tick_at(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<TickSummary> {
        let due = self
            .store
            .list_due(now, self.settings.batch_limit)
            .await?;

        let mut summary = TickSummary {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(summary);
        }

        let accounts: usize = self.routes.values().map(|r| r.accounts.size()).sum();
        let parallel = self.settings.max_parallel_submissions.min(accounts).max(1);

        let outcomes: Vec<Result<Outcome>> = stream::iter(due)
            .map(|commit| {
                let key = commit.key();
                async move {
                    self.process(commit, now, cancel)
                        .await
                        .wrap_err_with(|| format!("Failed to process commit {}", key))
                }
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    summary.errors += 1;
                    metrics::record_error("scheduler", "store");
                    error!(error = ?e, "Commit left unsettled");
                }
            }
        }

        if summary.errors > 0 {
            // Nothing of this tick is in flight any more
            let requeued = self.store.recover_in_flight().await?;
            if requeued > 0 {
                warn!(requeued, "Returned unsettled commits to the queue");
            }
        }
        Ok(summary)
    }

    async fn process(
        &self,
        commit: PendingCommit,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let key = commit.key();
        let Some(route) = self.routes.get(&commit.destination_chain_id) else {
            warn!(commit = %key, destination = commit.destination_chain_id, "No route to destination chain");
            return Ok(Outcome::Skipped);
        };
        let destination = route.writer.name();

        let lease = tokio::select! {
            _ = cancel.cancelled() => return Ok(Outcome::Skipped),
            lease = route.accounts.lease() => lease?,
        };
        if cancel.is_cancelled() {
            return Ok(Outcome::Skipped);
        }

        if !self.store.mark_submitting(&key, now).await? {
            debug!(commit = %key, "Commit no longer queued");
            return Ok(Outcome::Skipped);
        }
        let attempt = commit.attempts + 1;

        match route.writer.is_relayed(&commit).await {
            Ok(true) => {
                self.store.mark_committed(&key, None).await?;
                metrics::record_commit(destination, Outcome::AlreadyRelayed.as_str());
                info!(commit = %key, destination, "Event already on destination chain");
                return Ok(Outcome::AlreadyRelayed);
            }
            Ok(false) => {}
            // Never broadcast without a completed check
            Err(ChainError::Transient(reason)) => {
                let e = ChainError::Transient(format!("relay check failed: {}", reason));
                return self.settle_failure(&commit, attempt, now, e, destination).await;
            }
            Err(e) => return self.settle_failure(&commit, attempt, now, e, destination).await,
        }

        let started = Instant::now();
        let result = route.writer.submit(&commit, lease.address()).await;
        drop(lease);

        match result {
            Ok(tx_hash) => {
                self.store.mark_committed(&key, Some(&tx_hash)).await?;
                metrics::record_commit(destination, Outcome::Committed.as_str());
                metrics::record_submission_latency(destination, started.elapsed().as_secs_f64());
                info!(
                    commit = %key,
                    destination,
                    tx_hash = %tx_hash,
                    attempt,
                    "Commit executed"
                );
                Ok(Outcome::Committed)
            }
            Err(ChainError::AlreadyRelayed(reason)) => {
                self.store.mark_committed(&key, None).await?;
                metrics::record_commit(destination, Outcome::AlreadyRelayed.as_str());
                info!(commit = %key, destination, reason = %reason, "Event already on destination chain");
                Ok(Outcome::AlreadyRelayed)
            }
            Err(e) => self.settle_failure(&commit, attempt, now, e, destination).await,
        }
    }

    async fn settle_failure(
        &self,
        commit: &PendingCommit,
        attempt: u32,
        now: DateTime<Utc>,
        err: ChainError,
        destination: &str,
    ) -> Result<Outcome> {
        let key = commit.key();
        let message = err.to_string();

        if err.is_transient() && self.settings.retry.should_retry(attempt) {
            let next = self.settings.retry.next_retry_after(now, attempt);
            self.store.record_transient_failure(&key, &message, next).await?;
            metrics::record_commit(destination, Outcome::Retrying.as_str());
            warn!(
                commit = %key,
                destination,
                attempt,
                next_attempt_at = %next,
                error = %message,
                "Commit attempt failed, will retry"
            );
            return Ok(Outcome::Retrying);
        }

        self.store
            .update_commit(&key, CommitStatus::Failed, Some(&message))
            .await?;
        metrics::record_commit(destination, Outcome::Failed.as_str());
        metrics::record_error("scheduler", if err.is_transient() { "exhausted" } else { "rejected" });
        error!(
            commit = %key,
            destination,
            attempt,
            error = %message,
            "Commit failed permanently"
        );
        Ok(Outcome::Failed)
    }

    /// Error unless a destination chain is registered
    pub fn ensure_route(&self, chain_id: ChainId) -> Result<()> {
        if self.routes.contains_key(&chain_id) {
            Ok(())
        } else {
            Err(eyre!("no route to chain {}", chain_id))
        }
    }
}
