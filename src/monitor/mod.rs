//! Chain monitor
//!
//! One scanning state machine shared by the side-chain and the relay-chain
//! monitors. Per height it fetches the block, extracts the events destined for
//! the peer chain and persists them as queued commits in the same store
//! transaction that advances the checkpoint. A crash between two heights
//! therefore resumes at the first height whose commits are not durable.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainError, ChainReader, Extraction};
use crate::config::{Config, ScanConfig};
use crate::error::ConsistencyError;
use crate::metrics;
use crate::store::CheckpointStore;
use crate::types::{ChainId, PendingCommit};

/// Where the monitor scans from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSource {
    Forced,
    Persisted,
    Configured,
    SafeHead,
}

/// Resolved last-scanned height the monitor resumes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPoint {
    pub height: u64,
    pub source: StartSource,
}

/// Pick the last-scanned height to resume from.
///
/// A forced height wins, then the persisted checkpoint, then the configured
/// start height, then the current safe head. Scanning resumes at `height + 1`.
pub fn resolve_start(
    persisted: Option<u64>,
    configured: Option<u64>,
    forced: Option<u64>,
    safe_head: u64,
) -> StartPoint {
    if let Some(height) = forced {
        return StartPoint {
            height,
            source: StartSource::Forced,
        };
    }
    if let Some(height) = persisted {
        return StartPoint {
            height,
            source: StartSource::Persisted,
        };
    }
    if let Some(height) = configured {
        return StartPoint {
            height,
            source: StartSource::Configured,
        };
    }
    StartPoint {
        height: safe_head,
        source: StartSource::SafeHead,
    }
}

/// Monitor configuration for one chain
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub confirmation_depth: u64,
    pub start_height: Option<u64>,
    pub start_force_height: Option<u64>,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_blocks_per_cycle: u64,
}

impl MonitorConfig {
    fn with_scan(
        scan: &ScanConfig,
        confirmation_depth: u64,
        start_height: Option<u64>,
        start_force_height: Option<u64>,
    ) -> Self {
        Self {
            confirmation_depth,
            start_height,
            start_force_height,
            poll_interval: scan.poll_interval(),
            retry_delay: scan.retry_delay(),
            max_blocks_per_cycle: scan.max_blocks_per_cycle,
        }
    }

    pub fn side(config: &Config) -> Self {
        Self::with_scan(
            &config.scan,
            config.side.confirmation_depth,
            config.side.start_height,
            config.side.start_force_height,
        )
    }

    pub fn relay(config: &Config) -> Self {
        Self::with_scan(
            &config.scan,
            config.relay.confirmation_depth,
            config.relay.start_height,
            config.relay.start_force_height,
        )
    }
}

/// Phase of the scanning state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Fetching,
    Extracting,
    Persisting,
}

/// Failure of one scan cycle
#[derive(Debug, Error)]
pub enum ScanError {
    /// Retry the same height after the retry delay
    #[error(transparent)]
    Transient(ChainError),
    /// Stop the monitor
    #[error("{0:#}")]
    Fatal(eyre::Report),
}

impl From<eyre::Report> for ScanError {
    fn from(report: eyre::Report) -> Self {
        ScanError::Fatal(report)
    }
}

impl From<ConsistencyError> for ScanError {
    fn from(err: ConsistencyError) -> Self {
        ScanError::Fatal(err.into())
    }
}

/// Scanner of one chain, writing commits destined for `destination_chain_id`
pub struct ChainMonitor<R: ChainReader> {
    reader: Arc<R>,
    store: CheckpointStore,
    destination_chain_id: ChainId,
    config: MonitorConfig,
    state: ScanState,
    checkpoint: u64,
    checkpoint_hash: Option<String>,
}

impl<R: ChainReader + 'static> ChainMonitor<R> {
    pub fn new(
        reader: Arc<R>,
        store: CheckpointStore,
        destination_chain_id: ChainId,
        config: MonitorConfig,
    ) -> Self {
        Self {
            reader,
            store,
            destination_chain_id,
            config,
            state: ScanState::Idle,
            checkpoint: 0,
            checkpoint_hash: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Last height whose events are durable
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    /// Run until cancelled or a fatal error
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let chain = self.reader.name().to_string();

        if !self.initialize(&cancel).await? {
            return Ok(());
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.scan_cycle(&cancel).await {
                Ok(0) => {
                    if !sleep_or_cancel(&cancel, self.config.poll_interval).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(ScanError::Transient(e)) => {
                    self.state = ScanState::Idle;
                    metrics::record_error(&chain, "transient");
                    warn!(
                        chain = %chain,
                        height = self.checkpoint + 1,
                        error = %e,
                        "Scan failed, retrying the same height"
                    );
                    if !sleep_or_cancel(&cancel, self.config.retry_delay).await {
                        break;
                    }
                }
                Err(ScanError::Fatal(report)) => {
                    metrics::record_error(&chain, "fatal");
                    error!(
                        chain = %chain,
                        checkpoint = self.checkpoint,
                        error = %report,
                        "Monitor halted"
                    );
                    return Err(report).wrap_err_with(|| format!("{} monitor halted", chain));
                }
            }
        }

        info!(chain = %chain, checkpoint = self.checkpoint, "Monitor stopped");
        Ok(())
    }

    /// Resolve the start height and seed the checkpoint.
    ///
    /// Returns false when cancelled before the chain could be reached.
    pub async fn initialize(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let chain_id = self.reader.chain_id();

        let head = loop {
            match self.reader.head_height().await {
                Ok(head) => break head,
                Err(e) if e.is_transient() => {
                    warn!(chain = self.reader.name(), error = %e, "Head height unavailable");
                    if !sleep_or_cancel(cancel, self.config.retry_delay).await {
                        return Ok(false);
                    }
                }
                Err(e) => {
                    return Err(e).wrap_err_with(|| {
                        format!("Failed to read {} head height", self.reader.name())
                    })
                }
            }
        };
        let safe_head = head.saturating_sub(self.config.confirmation_depth);

        let persisted = self.store.get_checkpoint(chain_id).await?;
        let start = resolve_start(
            persisted.as_ref().map(|c| c.last_scanned_height),
            self.config.start_height,
            self.config.start_force_height,
            safe_head,
        );

        match start.source {
            StartSource::Persisted => {
                self.checkpoint_hash = persisted.and_then(|c| c.block_hash);
            }
            _ => {
                self.store.reset_checkpoint(chain_id, start.height).await?;
                self.checkpoint_hash = None;
            }
        }
        self.checkpoint = start.height;

        info!(
            chain = self.reader.name(),
            chain_id,
            head,
            safe_head,
            checkpoint = start.height,
            source = ?start.source,
            "Monitor starting"
        );
        Ok(true)
    }

    /// Scan up to `max_blocks_per_cycle` heights. Returns how many were persisted.
    pub async fn scan_cycle(&mut self, cancel: &CancellationToken) -> Result<u64, ScanError> {
        let chain_id = self.reader.chain_id();
        let head = self.reader.head_height().await.map_err(|e| self.classify(e, 0))?;
        let safe_head = head.saturating_sub(self.config.confirmation_depth);
        if safe_head <= self.checkpoint {
            return Ok(0);
        }

        // The block under the checkpoint must still be canonical
        if let Some(recorded) = self.checkpoint_hash.clone() {
            let observed = self
                .reader
                .block_hash(self.checkpoint)
                .await
                .map_err(|e| self.classify(e, self.checkpoint))?;
            if observed != recorded {
                return Err(ConsistencyError::Reorg {
                    chain_id,
                    height: self.checkpoint,
                    recorded,
                    observed,
                }
                .into());
            }
        }

        let end = safe_head.min(self.checkpoint + self.config.max_blocks_per_cycle);
        let mut scanned = 0;
        for height in self.checkpoint + 1..=end {
            if cancel.is_cancelled() {
                break;
            }
            self.scan_height(height).await?;
            scanned += 1;
        }
        Ok(scanned)
    }

    async fn scan_height(&mut self, height: u64) -> Result<(), ScanError> {
        let chain_id = self.reader.chain_id();

        self.state = ScanState::Fetching;
        let (block, data) = self
            .reader
            .fetch_block(height)
            .await
            .map_err(|e| self.classify(e, height))?;

        if let (Some(parent), Some(recorded)) = (&block.parent_hash, &self.checkpoint_hash) {
            if parent != recorded {
                return Err(ConsistencyError::Reorg {
                    chain_id,
                    height: height - 1,
                    recorded: recorded.clone(),
                    observed: parent.clone(),
                }
                .into());
            }
        }

        self.state = ScanState::Extracting;
        let extraction = self
            .reader
            .extract(&block, &data)
            .await
            .map_err(|e| self.classify(e, height))?;
        let Extraction {
            mut events,
            deposits,
        } = extraction;

        events.sort_by_key(|event| event.event_index);
        for (i, event) in events.iter().enumerate() {
            if event.source_chain_id != chain_id || event.source_height != height {
                return Err(ConsistencyError::Malformed {
                    chain_id,
                    height,
                    reason: format!(
                        "event {} reports source {}@{}",
                        event.key(),
                        event.source_chain_id,
                        event.source_height
                    ),
                }
                .into());
            }
            if i > 0 && events[i - 1].key() == event.key() {
                return Err(ConsistencyError::Malformed {
                    chain_id,
                    height,
                    reason: format!("event {} extracted twice", event.key()),
                }
                .into());
            }
        }
        if let Some(foreign) = deposits.iter().find(|d| d.source_chain_id != chain_id) {
            return Err(ConsistencyError::Malformed {
                chain_id,
                height,
                reason: format!("deposit {} from another chain", foreign.deposit_id),
            }
            .into());
        }

        self.state = ScanState::Persisting;
        let event_count = events.len();
        let commits: Vec<PendingCommit> = events
            .into_iter()
            .map(|event| PendingCommit::queued(event, self.destination_chain_id))
            .collect();

        let inserted = self
            .store
            .advance_checkpoint(chain_id, height, Some(&block.hash), &commits, &deposits)
            .await?;

        self.checkpoint = height;
        self.checkpoint_hash = Some(block.hash);
        self.state = ScanState::Idle;

        metrics::record_block_scanned(self.reader.name(), height, event_count);
        if event_count > 0 || !deposits.is_empty() {
            info!(
                chain = self.reader.name(),
                height,
                events = event_count,
                queued = inserted,
                deposits = deposits.len(),
                "Block processed"
            );
        } else {
            debug!(chain = self.reader.name(), height, "Block processed");
        }
        Ok(())
    }

    fn classify(&self, err: ChainError, height: u64) -> ScanError {
        let chain_id = self.reader.chain_id();
        match err {
            ChainError::Malformed(reason) => ConsistencyError::Malformed {
                chain_id,
                height,
                reason,
            }
            .into(),
            ChainError::Proof(reason) => ConsistencyError::Proof {
                chain_id,
                height,
                reason,
            }
            .into(),
            other => ScanError::Transient(other),
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
