//! Side chain adapter
//!
//! Scans the cross-chain manager for outbound messages, proves them against the
//! data contract storage with `eth_getProof`, reports lock-proxy deposits and
//! submits relay-chain proofs back to the manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::network::TransactionBuilder;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter, Log, TransactionRequest};
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use super::contracts::{
    EthCrossChainData, EthCrossChainManager, LockProxy, ECCD_TX_HASH_SLOT,
};
use super::merkle::MerkleValue;
use super::{
    BlockRef, ChainError, ChainReader, ChainWriter, DepositSource, EpochSource, Extraction,
};
use crate::config::SideChainConfig;
use crate::scheduler::retry::RetryConfig;
use crate::signer::Signer;
use crate::types::{ChainId, CrossChainEvent, DepositRecord, HeaderAnchor, PendingCommit};

/// Logs of the watched contracts at one height
#[derive(Debug, Clone, Default)]
pub struct SideBlock {
    pub logs: Vec<Log>,
}

/// EVM side chain client
pub struct SideChainClient {
    chain_id: ChainId,
    /// Chain id used in transaction signatures, read from the node
    evm_chain_id: u64,
    provider: RootProvider<Http<Client>>,
    eccm_address: Address,
    eccd_address: Address,
    lock_proxy_addresses: Vec<Address>,
    signer: Arc<Signer>,
    retry: RetryConfig,
    submit_timeout: Duration,
}

impl SideChainClient {
    /// Connect to the side-chain node
    pub async fn connect(
        config: &SideChainConfig,
        signer: Arc<Signer>,
        retry: RetryConfig,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let provider = ProviderBuilder::new()
            .on_http(config.rpc_url.parse().wrap_err("Invalid SIDE_RPC_URL")?);

        let evm_chain_id = provider
            .get_chain_id()
            .await
            .wrap_err("Failed to query side chain id")?;

        info!(
            chain_id = config.chain_id,
            evm_chain_id,
            eccm = %config.eccm_address,
            eccd = %config.eccd_address,
            lock_proxies = config.lock_proxy_addresses.len(),
            accounts = signer.accounts().len(),
            "Side chain client initialized"
        );

        Ok(Self {
            chain_id: config.chain_id,
            evm_chain_id,
            provider,
            eccm_address: config.eccm_address,
            eccd_address: config.eccd_address,
            lock_proxy_addresses: config.lock_proxy_addresses.clone(),
            signer,
            retry,
            submit_timeout,
        })
    }

    async fn block_ref(&self, height: u64) -> Result<BlockRef, ChainError> {
        let block = self
            .provider
            .get_block_by_number(
                BlockNumberOrTag::Number(height),
                BlockTransactionsKind::Hashes,
            )
            .await
            .map_err(transient)?
            .ok_or_else(|| ChainError::Transient(format!("block {} not available yet", height)))?;

        Ok(BlockRef {
            height,
            hash: format!("{:#x}", block.header.hash),
            parent_hash: Some(format!("{:#x}", block.header.inner.parent_hash)),
        })
    }

    /// Build the cross-chain event of one manager log, proof included
    async fn event_from_log(&self, log: &Log, height: u64) -> Result<CrossChainEvent, ChainError> {
        let decoded = log
            .log_decode::<EthCrossChainManager::CrossChainEvent>()
            .map_err(|e| ChainError::Malformed(format!("undecodable CrossChainEvent: {}", e)))?;
        let message = decoded.inner.data;

        let (tx_hash, log_index) = log_position(log)?;
        let key = storage_key(&message.txId)?;

        let proof = self
            .provider
            .get_proof(self.eccd_address, vec![key])
            .block_id(BlockId::number(height))
            .await
            .map_err(transient)?;

        let stored = proof
            .storage_proof
            .first()
            .map(|slot| slot.value)
            .unwrap_or(U256::ZERO);
        if stored.is_zero() {
            return Err(ChainError::Proof(format!(
                "data contract holds no hash for txId 0x{} at height {}",
                hex::encode(&message.txId),
                height
            )));
        }

        let merkle_proof = serde_json::to_vec(&proof)
            .map_err(|e| ChainError::Proof(format!("failed to encode storage proof: {}", e)))?;

        debug!(
            height,
            tx_hash = %tx_hash,
            log_index,
            to_chain_id = message.toChainId,
            "Extracted cross-chain message"
        );

        Ok(CrossChainEvent {
            source_chain_id: self.chain_id,
            source_height: height,
            tx_hash,
            event_index: log_index,
            payload: message.rawdata.to_vec(),
            merkle_proof,
            header: None,
        })
    }

    fn deposit_from_log(&self, log: &Log, height: u64) -> Result<DepositRecord, ChainError> {
        log.log_decode::<LockProxy::LockEvent>()
            .map_err(|e| ChainError::Malformed(format!("undecodable LockEvent: {}", e)))?;
        let (tx_hash, log_index) = log_position(log)?;
        Ok(DepositRecord::observed(self.chain_id, &tx_hash, log_index, height))
    }

    fn is_manager_event(&self, log: &Log) -> bool {
        log.address() == self.eccm_address
            && log.topics().first() == Some(&EthCrossChainManager::CrossChainEvent::SIGNATURE_HASH)
    }

    fn is_lock_event(&self, log: &Log) -> bool {
        self.lock_proxy_addresses.contains(&log.address())
            && log.topics().first() == Some(&LockProxy::LockEvent::SIGNATURE_HASH)
    }
}

/// Storage key of `txId` in the data contract's hash mapping
fn storage_key(tx_id: &[u8]) -> Result<B256, ChainError> {
    if tx_id.len() > 32 {
        return Err(ChainError::Malformed(format!(
            "txId of {} bytes does not fit a mapping key",
            tx_id.len()
        )));
    }
    let mut preimage = [0u8; 64];
    preimage[32 - tx_id.len()..32].copy_from_slice(tx_id);
    preimage[63] = ECCD_TX_HASH_SLOT;
    Ok(keccak256(preimage))
}

fn log_position(log: &Log) -> Result<(String, u32), ChainError> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| ChainError::Malformed("log without transaction hash".into()))?;
    let log_index = log
        .log_index
        .ok_or_else(|| ChainError::Malformed("log without log index".into()))?;
    let log_index = u32::try_from(log_index)
        .map_err(|_| ChainError::Malformed(format!("log index {} out of range", log_index)))?;
    Ok((format!("{:#x}", tx_hash), log_index))
}

/// Relay header and proven message of a commit bound for the side chain
fn inbound(commit: &PendingCommit) -> Result<(&HeaderAnchor, MerkleValue), ChainError> {
    let header = commit.event.header.as_ref().ok_or_else(|| {
        ChainError::Malformed(format!("commit {} carries no relay header", commit.key()))
    })?;
    let value = MerkleValue::from_audit_path(&commit.event.merkle_proof)?;
    Ok((header, value))
}

fn transient(e: impl std::fmt::Display) -> ChainError {
    ChainError::Transient(e.to_string())
}

fn parse_tx_hash(tx_hash: &str) -> Result<B256, ChainError> {
    tx_hash
        .parse()
        .map_err(|_| ChainError::Malformed(format!("invalid transaction hash {}", tx_hash)))
}

#[async_trait]
impl ChainReader for SideChainClient {
    type Block = SideBlock;

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "side"
    }

    async fn head_height(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(transient)
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        Ok(self.block_ref(height).await?.hash)
    }

    async fn fetch_block(&self, height: u64) -> Result<(BlockRef, SideBlock), ChainError> {
        let block = self.block_ref(height).await?;

        let mut addresses = vec![self.eccm_address];
        addresses.extend(self.lock_proxy_addresses.iter().copied());
        let filter = Filter::new()
            .address(addresses)
            .from_block(height)
            .to_block(height);

        let mut logs = self.provider.get_logs(&filter).await.map_err(transient)?;
        logs.sort_by_key(|log| log.log_index);

        Ok((block, SideBlock { logs }))
    }

    async fn extract(&self, block: &BlockRef, data: &SideBlock) -> Result<Extraction, ChainError> {
        let mut extraction = Extraction::default();
        for log in &data.logs {
            if self.is_manager_event(log) {
                extraction
                    .events
                    .push(self.event_from_log(log, block.height).await?);
            } else if self.is_lock_event(log) {
                extraction
                    .deposits
                    .push(self.deposit_from_log(log, block.height)?);
            }
        }
        Ok(extraction)
    }
}

#[async_trait]
impl ChainWriter for SideChainClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "side"
    }

    async fn is_relayed(&self, commit: &PendingCommit) -> Result<bool, ChainError> {
        let (_, value) = inbound(commit)?;
        let (from_chain_id, tx_hash) = value.executed_key()?;
        let contract = EthCrossChainData::new(self.eccd_address, &self.provider);
        let exists = contract
            .checkIfFromChainTxExist(from_chain_id, tx_hash)
            .call()
            .await
            .map_err(transient)?;
        Ok(exists._0)
    }

    async fn submit(&self, commit: &PendingCommit, identity: Address) -> Result<String, ChainError> {
        let (header, _) = inbound(commit)?;

        let input = EthCrossChainManager::verifyHeaderAndExecuteTxCall {
            proof: Bytes::from(commit.event.merkle_proof.clone()),
            rawHeader: Bytes::from(header.raw_header.clone()),
            headerProof: Bytes::from(header.header_proof.clone()),
            curRawHeader: Bytes::from(header.cur_raw_header.clone()),
            headerSig: Bytes::from(header.signatures.clone()),
        }
        .abi_encode();

        let nonce = self
            .provider
            .get_transaction_count(identity)
            .pending()
            .await
            .map_err(transient)?;
        let fees = self
            .provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(transient)?;

        // Each retry bumps fees so a stuck transaction can be replaced
        let max_fee = self
            .retry
            .gas_price_for_attempt(fees.max_fee_per_gas, commit.attempts);
        let priority_fee = self
            .retry
            .gas_price_for_attempt(fees.max_priority_fee_per_gas, commit.attempts);

        let tx = TransactionRequest::default()
            .with_from(identity)
            .with_to(self.eccm_address)
            .with_input(input)
            .with_chain_id(self.evm_chain_id)
            .with_nonce(nonce)
            .with_max_fee_per_gas(max_fee)
            .with_max_priority_fee_per_gas(priority_fee);

        // A revert here carries the contract's reason, e.g. an executed message
        let gas = self
            .provider
            .estimate_gas(&tx)
            .await
            .map_err(|e| ChainError::from_message(e.to_string()))?;
        let tx = tx.with_gas_limit(gas.saturating_mul(12) / 10);

        let signed = self
            .signer
            .sign(tx, identity)
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        let tx_hash = format!("{:#x}", signed.hash);

        let started = Instant::now();
        let pending = self
            .provider
            .send_raw_transaction(&signed.raw)
            .await
            .map_err(|e| ChainError::from_message(e.to_string()))?;

        info!(
            commit_key = %commit.key(),
            tx_hash = %tx_hash,
            account = %identity,
            nonce,
            "Transaction sent, waiting for confirmation"
        );

        let receipt = tokio::time::timeout(self.submit_timeout, pending.get_receipt())
            .await
            .map_err(|_| {
                ChainError::Transient(format!("timed out waiting for receipt of {}", tx_hash))
            })?
            .map_err(|e| ChainError::Transient(format!("receipt of {}: {}", tx_hash, e)))?;

        if !receipt.status() {
            // Lost a race against another relayer
            if self.is_relayed(commit).await.unwrap_or(false) {
                return Err(ChainError::AlreadyRelayed(format!(
                    "{} reverted, message already executed",
                    tx_hash
                )));
            }
            return Err(ChainError::Rejected(format!("transaction {} reverted", tx_hash)));
        }

        debug!(
            tx_hash = %tx_hash,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transaction confirmed"
        );
        Ok(tx_hash)
    }
}

#[async_trait]
impl EpochSource for SideChainClient {
    async fn current_epoch_start(&self) -> Result<u64, ChainError> {
        let contract = EthCrossChainData::new(self.eccd_address, &self.provider);
        let height = contract
            .getCurEpochStartHeight()
            .call()
            .await
            .map_err(transient)?;
        Ok(height._0 as u64)
    }
}

#[async_trait]
impl DepositSource for SideChainClient {
    async fn rederive(&self, deposit: &DepositRecord) -> Result<Vec<CrossChainEvent>, ChainError> {
        let receipt = self
            .provider
            .get_transaction_receipt(parse_tx_hash(&deposit.tx_hash)?)
            .await
            .map_err(transient)?
            .ok_or_else(|| {
                ChainError::Transient(format!("no receipt for deposit tx {}", deposit.tx_hash))
            })?;

        let height = receipt.block_number.unwrap_or(deposit.observed_height);
        if height != deposit.observed_height {
            warn!(
                deposit_id = %deposit.deposit_id,
                observed_height = deposit.observed_height,
                receipt_height = height,
                "Deposit receipt height differs from the observed height"
            );
        }

        let mut events = Vec::new();
        for log in receipt.inner.logs() {
            if self.is_manager_event(log) {
                events.push(self.event_from_log(log, height).await?);
            }
        }
        Ok(events)
    }
}
