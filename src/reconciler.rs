//! Deposit reconciler
//!
//! Periodically cross-checks observed deposits against the commit queue. A
//! deposit that outlived the expected relay latency without a committed commit
//! for its source transaction is traced back to its cross-chain event(s), which
//! are queued again. Commit keys deduplicate against anything the monitor
//! already queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::DepositSource;
use crate::config::ReconcilerConfig;
use crate::metrics;
use crate::store::CheckpointStore;
use crate::types::{ChainId, CommitStatus, DepositRecord, PendingCommit};

/// Counts of one reconciliation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub matched: usize,
    pub in_flight: usize,
    pub reinjected: usize,
    pub parked: usize,
    pub errors: usize,
}

/// Why a deposit left the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkReason {
    /// Every commit of the deposit transaction was rejected by the destination
    FailedCommits,
    /// No deposit source is registered for the chain
    NoSource,
    /// The deposit transaction carries no cross-chain event
    NoEvent,
}

impl ParkReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParkReason::FailedCommits => "failed_commits",
            ParkReason::NoSource => "no_source",
            ParkReason::NoEvent => "no_event",
        }
    }
}

struct Source {
    source: Arc<dyn DepositSource>,
    destination_chain_id: ChainId,
}

pub struct DepositReconciler {
    store: CheckpointStore,
    sources: HashMap<ChainId, Source>,
    interval: Duration,
    window: Duration,
    batch_limit: u32,
}

impl DepositReconciler {
    pub fn new(store: CheckpointStore, config: &ReconcilerConfig) -> Self {
        Self {
            store,
            sources: HashMap::new(),
            interval: config.interval(),
            window: config.window(),
            batch_limit: config.batch_limit,
        }
    }

    /// Register how deposits of `source_chain_id` are traced back to their events
    pub fn add_source(
        &mut self,
        source_chain_id: ChainId,
        source: Arc<dyn DepositSource>,
        destination_chain_id: ChainId,
    ) {
        self.sources.insert(
            source_chain_id,
            Source {
                source,
                destination_chain_id,
            },
        );
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.interval.as_secs(),
            window_secs = self.window.as_secs(),
            "Deposit reconciler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Deposit reconciler stopped");
                    return Ok(());
                }
                _ = timer.tick() => {
                    match self.sweep_at(Utc::now()).await {
                        Ok(summary) => {
                            if summary.reinjected > 0 || summary.parked > 0 || summary.errors > 0 {
                                info!(
                                    examined = summary.examined,
                                    matched = summary.matched,
                                    in_flight = summary.in_flight,
                                    reinjected = summary.reinjected,
                                    parked = summary.parked,
                                    errors = summary.errors,
                                    "Reconciliation sweep"
                                );
                            }
                        }
                        Err(e) => {
                            metrics::record_error("reconciler", "sweep");
                            error!(error = ?e, "Reconciliation sweep failed, retrying next interval");
                        }
                    }
                }
            }
        }
    }

    /// Examine unmatched deposits observed more than the window before `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let deposits = self
            .store
            .unmatched_deposits(now - window, self.batch_limit)
            .await?;

        let mut summary = SweepSummary {
            examined: deposits.len(),
            ..Default::default()
        };

        for deposit in deposits {
            if let Err(e) = self.reconcile(&deposit, now, &mut summary).await {
                summary.errors += 1;
                metrics::record_error("reconciler", "store");
                warn!(deposit = %deposit.deposit_id, error = ?e, "Failed to reconcile deposit");
            }
        }
        Ok(summary)
    }

    async fn reconcile(
        &self,
        deposit: &DepositRecord,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        let commits = self
            .store
            .commits_for_tx(deposit.source_chain_id, &deposit.tx_hash)
            .await?;

        if let Some(done) = commits.iter().find(|c| c.status == CommitStatus::Committed) {
            self.store.match_deposit(&deposit.deposit_id, &done.key()).await?;
            summary.matched += 1;
            debug!(deposit = %deposit.deposit_id, commit = %done.key(), "Deposit matched");
            return Ok(());
        }

        if commits.iter().any(|c| !c.status.is_terminal()) {
            self.store.touch_deposit(&deposit.deposit_id, now).await?;
            summary.in_flight += 1;
            return Ok(());
        }

        if !commits.is_empty() {
            // Re-deriving yields the same keys, which the destination already rejected
            return self.park(deposit, ParkReason::FailedCommits, now, summary).await;
        }

        let Some(source) = self.sources.get(&deposit.source_chain_id) else {
            return self.park(deposit, ParkReason::NoSource, now, summary).await;
        };

        let events = match source.source.rederive(deposit).await {
            Ok(events) => events,
            Err(e) => {
                self.store.touch_deposit(&deposit.deposit_id, now).await?;
                summary.errors += 1;
                metrics::record_error("reconciler", "rederive");
                warn!(deposit = %deposit.deposit_id, error = %e, "Failed to re-derive deposit events");
                return Ok(());
            }
        };
        if events.is_empty() {
            return self.park(deposit, ParkReason::NoEvent, now, summary).await;
        }

        let commits: Vec<PendingCommit> = events
            .into_iter()
            .map(|event| PendingCommit::queued(event, source.destination_chain_id))
            .collect();
        let inserted = self.store.enqueue_commits(&commits).await?;
        self.store.mark_deposit_reinjected(&deposit.deposit_id, now).await?;

        summary.reinjected += 1;
        metrics::record_reinjected(&deposit.source_chain_id.to_string(), commits.len());
        info!(
            deposit = %deposit.deposit_id,
            tx_hash = %deposit.tx_hash,
            events = commits.len(),
            queued = inserted,
            "Re-injected missing cross-chain events"
        );
        Ok(())
    }

    async fn park(
        &self,
        deposit: &DepositRecord,
        reason: ParkReason,
        now: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        self.store
            .park_deposit(&deposit.deposit_id, reason.as_str(), now)
            .await?;
        summary.parked += 1;
        metrics::record_parked(&deposit.source_chain_id.to_string(), reason.as_str());
        warn!(
            deposit = %deposit.deposit_id,
            chain_id = deposit.source_chain_id,
            tx_hash = %deposit.tx_hash,
            reason = reason.as_str(),
            "Deposit parked, it needs manual attention"
        );
        Ok(())
    }
}
