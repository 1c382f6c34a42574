//! In-process chain doubles for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;

use relayer::chain::{BlockRef, ChainError, ChainReader, ChainWriter, DepositSource, Extraction};
use relayer::monitor::MonitorConfig;
use relayer::scheduler::retry::RetryConfig;
use relayer::scheduler::SchedulerSettings;
use relayer::types::{ChainId, CommitKey, CrossChainEvent, DepositRecord, PendingCommit};

pub const SIDE: ChainId = 2;
pub const RELAY: ChainId = 0;

pub fn event(chain: ChainId, height: u64, tx: &str, index: u32) -> CrossChainEvent {
    CrossChainEvent {
        source_chain_id: chain,
        source_height: height,
        tx_hash: tx.to_string(),
        event_index: index,
        payload: format!("payload-{}-{}", tx, index).into_bytes(),
        merkle_proof: vec![0xaa, index as u8],
        header: None,
    }
}

pub fn block_hash(height: u64) -> String {
    format!("0x{:064x}", height)
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        confirmation_depth: 0,
        start_height: None,
        start_force_height: None,
        poll_interval: Duration::from_millis(10),
        retry_delay: Duration::from_millis(10),
        max_blocks_per_cycle: 100,
    }
}

pub fn scheduler_settings(parallel: usize) -> SchedulerSettings {
    SchedulerSettings {
        interval: Duration::from_millis(10),
        batch_limit: 100,
        max_parallel_submissions: parallel,
        retry: RetryConfig {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            ..Default::default()
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBlock {
    pub hash: String,
    pub parent_hash: Option<String>,
    pub events: Vec<CrossChainEvent>,
    pub deposits: Vec<DepositRecord>,
}

/// Scripted source chain
pub struct MockReader {
    pub chain_id: ChainId,
    pub head: AtomicU64,
    pub blocks: Mutex<BTreeMap<u64, MockBlock>>,
    /// Heights whose fetch fails transiently once
    pub flaky: Mutex<HashSet<u64>>,
    pub fetched: Mutex<Vec<u64>>,
}

impl MockReader {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            head: AtomicU64::new(0),
            blocks: Mutex::new(BTreeMap::new()),
            flaky: Mutex::new(HashSet::new()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Canonical chain of empty blocks `1..=head`
    pub fn with_chain(chain_id: ChainId, head: u64) -> Self {
        let reader = Self::new(chain_id);
        for height in 1..=head {
            reader.put_block(height, Vec::new(), Vec::new());
        }
        reader.set_head(head);
        reader
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn put_block(&self, height: u64, events: Vec<CrossChainEvent>, deposits: Vec<DepositRecord>) {
        self.blocks.lock().unwrap().insert(
            height,
            MockBlock {
                hash: block_hash(height),
                parent_hash: height.checked_sub(1).map(block_hash),
                events,
                deposits,
            },
        );
    }

    /// Replace the hash of `height`, as a fork would
    pub fn fork_at(&self, height: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(block) = blocks.get_mut(&height) {
            block.hash = format!("0xf0{:062x}", height);
        }
    }
}

#[async_trait]
impl ChainReader for MockReader {
    type Block = MockBlock;

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "mock"
    }

    async fn head_height(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or_else(|| ChainError::Transient(format!("no block {}", height)))
    }

    async fn fetch_block(&self, height: u64) -> Result<(BlockRef, MockBlock), ChainError> {
        if self.flaky.lock().unwrap().remove(&height) {
            return Err(ChainError::Transient("connection reset".to_string()));
        }
        let block = self
            .blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| ChainError::Transient(format!("no block {}", height)))?;
        self.fetched.lock().unwrap().push(height);
        Ok((
            BlockRef {
                height,
                hash: block.hash.clone(),
                parent_hash: block.parent_hash.clone(),
            },
            block,
        ))
    }

    async fn extract(&self, _block: &BlockRef, data: &MockBlock) -> Result<Extraction, ChainError> {
        Ok(Extraction {
            events: data.events.clone(),
            deposits: data.deposits.clone(),
        })
    }
}

/// How the next submission behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Ok,
    /// The transaction lands but the client gives up waiting for it
    LandsThenTimesOut,
    Transient,
    Reject,
}

/// Scripted destination chain
pub struct MockWriter {
    pub chain_id: ChainId,
    pub script: Mutex<VecDeque<Submit>>,
    pub relayed: Mutex<HashSet<CommitKey>>,
    pub broadcasts: Mutex<Vec<(CommitKey, Address)>>,
    pub in_flight: Mutex<HashSet<Address>>,
    pub overlap: AtomicBool,
    pub delay: Duration,
}

impl MockWriter {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            script: Mutex::new(VecDeque::new()),
            relayed: Mutex::new(HashSet::new()),
            broadcasts: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, steps: &[Submit]) {
        self.script.lock().unwrap().extend(steps.iter().copied());
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn broadcasts_of(&self, key: &CommitKey) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .count()
    }
}

#[async_trait]
impl ChainWriter for MockWriter {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "mock-destination"
    }

    async fn is_relayed(&self, commit: &PendingCommit) -> Result<bool, ChainError> {
        Ok(self.relayed.lock().unwrap().contains(&commit.key()))
    }

    async fn submit(&self, commit: &PendingCommit, identity: Address) -> Result<String, ChainError> {
        if !self.in_flight.lock().unwrap().insert(identity) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let key = commit.key();
        self.broadcasts.lock().unwrap().push((key.clone(), identity));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Submit::Ok);
        let result = match step {
            Submit::Ok => {
                self.relayed.lock().unwrap().insert(key.clone());
                Ok(format!("0xdest{}", key.event_index))
            }
            Submit::LandsThenTimesOut => {
                self.relayed.lock().unwrap().insert(key.clone());
                Err(ChainError::Transient("receipt wait timed out".to_string()))
            }
            Submit::Transient => Err(ChainError::Transient("connection refused".to_string())),
            Submit::Reject => Err(ChainError::Rejected("execution reverted".to_string())),
        };

        self.in_flight.lock().unwrap().remove(&identity);
        result
    }
}

/// Deposit transactions and the events their receipts carry
#[derive(Default)]
pub struct MockDepositSource {
    pub events: Mutex<HashMap<String, Vec<CrossChainEvent>>>,
    pub calls: AtomicU64,
}

impl MockDepositSource {
    pub fn insert(&self, tx_hash: &str, events: Vec<CrossChainEvent>) {
        self.events
            .lock()
            .unwrap()
            .insert(relayer::types::normalize_tx_hash(tx_hash), events);
    }
}

#[async_trait]
impl DepositSource for MockDepositSource {
    async fn rederive(&self, deposit: &DepositRecord) -> Result<Vec<CrossChainEvent>, ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events
            .lock()
            .unwrap()
            .get(&deposit.tx_hash)
            .cloned()
            .ok_or_else(|| ChainError::Transient(format!("no receipt for {}", deposit.tx_hash)))
    }
}

pub fn accounts(n: u8) -> Vec<Address> {
    (1..=n).map(Address::repeat_byte).collect()
}
