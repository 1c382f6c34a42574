//! Relay chain adapter
//!
//! JSON-RPC client of the relay chain. Reads headers, cross-chain
//! notifications and cross-states proofs for the relay-chain monitor, and
//! imports side-chain messages as signed relay transactions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{keccak256, Address};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::{BlockRef, ChainError, ChainReader, ChainWriter, EpochSource, Extraction};
use crate::config::RelayChainConfig;
use crate::signer::Signer;
use crate::types::{normalize_tx_hash, ChainId, CrossChainEvent, HeaderAnchor, PendingCommit};

/// Notification name of a message that is ready to be proven on its destination
const MAKE_PROOF: &str = "makeProof";

/// Storage prefix of executed inbound messages in the native manager
const DONE_TX_PREFIX: &[u8] = b"doneTx";

/// Interval between inclusion checks of a submitted relay transaction
const INCLUSION_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'a str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[serde(default)]
    error: i64,
    #[serde(default)]
    desc: String,
    result: Option<T>,
}

/// Header as returned by `getheaderbyheight`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct RelayHeader {
    #[serde(rename = "ChainID")]
    pub chain_id: u64,
    pub hash: String,
    pub prev_block_hash: String,
    pub height: u64,
    /// Serialized header, hex
    pub raw_header: String,
    /// Consensus signatures, hex each
    #[serde(default)]
    pub sig_data: Vec<String>,
}

/// One contract notification of a transaction
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Notify {
    pub contract_address: String,
    #[serde(default)]
    pub states: Vec<Value>,
}

/// Execution result of one relay transaction
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteNotify {
    pub tx_hash: String,
    /// 1 = success, 0 = failure
    pub state: u8,
    #[serde(default)]
    pub notify: Vec<Notify>,
}

/// Result of `getcrossstatesproof` and `getmerkleproof`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuditPath {
    audit_path: String,
}

/// Header and notifications of one relay height
#[derive(Debug, Clone)]
pub struct RelayBlock {
    pub header: RelayHeader,
    pub events: Vec<ExecuteNotify>,
}

/// Side-chain message imported into the relay chain
#[derive(Debug, Serialize)]
struct ImportOuterTransfer {
    source_chain_id: u64,
    height: u64,
    tx_hash: String,
    payload: String,
    proof: String,
    relayer: String,
}

#[derive(Debug, Serialize)]
struct SignedRelayTx {
    method: &'static str,
    params: ImportOuterTransfer,
    signature: String,
}

/// A `makeProof` notification addressed to the side chain
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProofRequest {
    tx_hash: String,
    /// Position of the notification within its transaction
    index: u32,
    key: String,
}

/// Relay chain JSON-RPC client
pub struct RelayChainClient {
    http: reqwest::Client,
    rpc_url: String,
    chain_id: ChainId,
    side_chain_id: ChainId,
    ccm_address: String,
    signer: Arc<Signer>,
    submit_timeout: Duration,
    request_id: AtomicU64,
    epoch_source: Option<Arc<dyn EpochSource>>,
}

impl RelayChainClient {
    /// Connect and learn the relay chain id from the genesis header
    pub async fn connect(
        config: &RelayChainConfig,
        side_chain_id: ChainId,
        signer: Arc<Signer>,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build relay chain HTTP client")?;

        let mut client = Self {
            http,
            rpc_url: config.rpc_url.clone(),
            chain_id: 0,
            side_chain_id,
            ccm_address: config.ccm_address.trim_start_matches("0x").to_lowercase(),
            signer,
            submit_timeout,
            request_id: AtomicU64::new(1),
            epoch_source: None,
        };

        let genesis = client
            .header(0)
            .await
            .map_err(|e| eyre!("Failed to read relay chain genesis header: {}", e))?;
        client.chain_id = genesis.chain_id;

        info!(
            chain_id = client.chain_id,
            side_chain_id,
            ccm = %client.ccm_address,
            accounts = client.signer.accounts().len(),
            "Relay chain client initialized"
        );
        Ok(client)
    }

    /// Check headers against the epoch the side chain trusts, read from `source`
    pub fn with_epoch_source(mut self, source: Arc<dyn EpochSource>) -> Self {
        self.epoch_source = Some(source);
        self
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Transient(format!("{}: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(ChainError::Transient(format!(
                "{}: HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{}: {}", method, e)))?;

        if body.error != 0 {
            return Err(ChainError::from_message(format!(
                "{} failed with code {}: {}",
                method, body.error, body.desc
            )));
        }
        Ok(body.result)
    }

    pub async fn header(&self, height: u64) -> Result<RelayHeader, ChainError> {
        self.call("getheaderbyheight", json!([height]))
            .await?
            .ok_or_else(|| ChainError::Transient(format!("relay header {} not available", height)))
    }

    async fn events(&self, height: u64) -> Result<Vec<ExecuteNotify>, ChainError> {
        Ok(self
            .call("getsmartcodeevent", json!([height]))
            .await?
            .unwrap_or_default())
    }

    async fn tx_event(&self, tx_hash: &str) -> Result<Option<ExecuteNotify>, ChainError> {
        self.call("getsmartcodeevent", json!([tx_hash.trim_start_matches("0x")]))
            .await
    }

    async fn cross_states_proof(&self, height: u64, key: &str) -> Result<Vec<u8>, ChainError> {
        let proof: AuditPath = self
            .call("getcrossstatesproof", json!([height, key]))
            .await?
            .ok_or_else(|| {
                ChainError::Proof(format!("no cross-states proof for {} at {}", key, height))
            })?;
        decode_hex(&proof.audit_path)
    }

    async fn storage(&self, key: &[u8]) -> Result<Option<String>, ChainError> {
        self.call("getstorage", json!([self.ccm_address, hex::encode(key)]))
            .await
    }

    /// `makeProof` notifications of `events` whose destination is the side chain
    fn proof_requests(&self, events: &[ExecuteNotify]) -> Result<Vec<ProofRequest>, ChainError> {
        let mut requests = Vec::new();
        for event in events.iter().filter(|e| e.state == 1) {
            for (index, notify) in event.notify.iter().enumerate() {
                if notify.contract_address.trim_start_matches("0x").to_lowercase()
                    != self.ccm_address
                {
                    continue;
                }
                if notify.states.first().and_then(Value::as_str) != Some(MAKE_PROOF) {
                    continue;
                }
                let (to_chain, key) = parse_make_proof(&notify.states)?;
                if to_chain != self.side_chain_id {
                    continue;
                }
                let index = u32::try_from(index).map_err(|_| {
                    ChainError::Malformed(format!("notification index {} out of range", index))
                })?;
                requests.push(ProofRequest {
                    tx_hash: event.tx_hash.clone(),
                    index,
                    key,
                });
            }
        }
        Ok(requests)
    }

    /// Header anchor for events proven against the signed header `signed`
    async fn header_anchor(&self, signed: &RelayHeader) -> Result<HeaderAnchor, ChainError> {
        let epoch_start = match &self.epoch_source {
            Some(source) => Some(source.current_epoch_start().await?),
            None => None,
        };
        let raw_header = decode_hex(&signed.raw_header)?;

        let Some(anchor_height) = anchor_height(signed.height, epoch_start) else {
            return Ok(HeaderAnchor {
                raw_header,
                header_proof: Vec::new(),
                cur_raw_header: Vec::new(),
                signatures: join_signatures(&signed.sig_data)?,
            });
        };

        let anchor = self.header(anchor_height).await?;
        let proof: AuditPath = self
            .call("getmerkleproof", json!([signed.height, anchor_height]))
            .await?
            .ok_or_else(|| {
                ChainError::Proof(format!(
                    "no header proof of {} in {}",
                    signed.height, anchor_height
                ))
            })?;
        debug!(
            height = signed.height,
            anchor_height,
            "Header predates the trusted epoch, anchoring it"
        );
        Ok(HeaderAnchor {
            raw_header,
            header_proof: decode_hex(&proof.audit_path)?,
            cur_raw_header: decode_hex(&anchor.raw_header)?,
            signatures: join_signatures(&anchor.sig_data)?,
        })
    }

    fn done_tx_key(&self, commit: &PendingCommit) -> Vec<u8> {
        let mut key = DONE_TX_PREFIX.to_vec();
        key.extend_from_slice(&commit.event.source_chain_id.to_le_bytes());
        key.extend_from_slice(keccak256(&commit.event.payload).as_slice());
        key
    }
}

/// `["makeProof", fromChainID, toChainID, txHash, height, key]`
fn parse_make_proof(states: &[Value]) -> Result<(u64, String), ChainError> {
    if states.len() < 6 {
        return Err(ChainError::Malformed(format!(
            "makeProof notification with {} states",
            states.len()
        )));
    }
    let to_chain = states[2]
        .as_u64()
        .or_else(|| states[2].as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| ChainError::Malformed(format!("invalid toChainID {}", states[2])))?;
    let key = states[5]
        .as_str()
        .ok_or_else(|| ChainError::Malformed(format!("invalid proof key {}", states[5])))?
        .to_string();
    Ok((to_chain, key))
}

/// Height of the header that anchors `header_height` once the destination trusts
/// only headers after `epoch_start`
fn anchor_height(header_height: u64, epoch_start: Option<u64>) -> Option<u64> {
    let epoch_start = epoch_start?;
    (header_height <= epoch_start).then(|| epoch_start + 1)
}

fn join_signatures(sig_data: &[String]) -> Result<Vec<u8>, ChainError> {
    let mut signatures = Vec::new();
    for sig in sig_data {
        signatures.extend(decode_hex(sig)?);
    }
    Ok(signatures)
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChainError::Malformed(format!("invalid hex {}: {}", raw, e)))
}

#[async_trait]
impl ChainReader for RelayChainClient {
    type Block = RelayBlock;

    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "relay"
    }

    async fn head_height(&self) -> Result<u64, ChainError> {
        let count: u64 = self
            .call("getblockcount", json!([]))
            .await?
            .ok_or_else(|| ChainError::Transient("empty getblockcount result".into()))?;
        Ok(count.saturating_sub(1))
    }

    async fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        Ok(normalize_tx_hash(&self.header(height).await?.hash))
    }

    async fn fetch_block(&self, height: u64) -> Result<(BlockRef, RelayBlock), ChainError> {
        let header = self.header(height).await?;
        if header.height != height {
            return Err(ChainError::Malformed(format!(
                "asked for header {} but got {}",
                height, header.height
            )));
        }
        let events = self.events(height).await?;

        let block = BlockRef {
            height,
            hash: normalize_tx_hash(&header.hash),
            parent_hash: (height > 0).then(|| normalize_tx_hash(&header.prev_block_hash)),
        };
        Ok((block, RelayBlock { header, events }))
    }

    async fn extract(&self, block: &BlockRef, data: &RelayBlock) -> Result<Extraction, ChainError> {
        let requests = self.proof_requests(&data.events)?;
        if requests.is_empty() {
            return Ok(Extraction::default());
        }

        // The header one height up commits to the cross states of this height
        let signed = self.header(block.height + 1).await?;
        let header = self.header_anchor(&signed).await?;

        let mut extraction = Extraction::default();
        for request in requests {
            let merkle_proof = self.cross_states_proof(block.height, &request.key).await?;
            debug!(
                height = block.height,
                tx_hash = %request.tx_hash,
                index = request.index,
                key = %request.key,
                "Extracted relay message for the side chain"
            );
            extraction.events.push(CrossChainEvent {
                source_chain_id: self.chain_id,
                source_height: block.height,
                tx_hash: normalize_tx_hash(&request.tx_hash),
                event_index: request.index,
                payload: decode_hex(&request.key)?,
                merkle_proof,
                header: Some(header.clone()),
            });
        }
        Ok(extraction)
    }
}

#[async_trait]
impl ChainWriter for RelayChainClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn name(&self) -> &str {
        "relay"
    }

    async fn is_relayed(&self, commit: &PendingCommit) -> Result<bool, ChainError> {
        let stored = self.storage(&self.done_tx_key(commit)).await?;
        Ok(stored.map_or(false, |value| !value.is_empty()))
    }

    async fn submit(&self, commit: &PendingCommit, identity: Address) -> Result<String, ChainError> {
        let event = &commit.event;
        let params = ImportOuterTransfer {
            source_chain_id: event.source_chain_id,
            height: event.source_height,
            tx_hash: event.tx_hash.clone(),
            payload: hex::encode(&event.payload),
            proof: hex::encode(&event.merkle_proof),
            relayer: format!("{:#x}", identity),
        };

        let message = serde_json::to_vec(&params)
            .map_err(|e| ChainError::Malformed(format!("failed to encode import: {}", e)))?;
        let signature = self
            .signer
            .sign_digest(&keccak256(&message), identity)
            .map_err(|e| ChainError::Malformed(e.to_string()))?;

        let tx = SignedRelayTx {
            method: "importOuterTransfer",
            params,
            signature: hex::encode(signature.as_bytes()),
        };
        let raw = serde_json::to_vec(&tx)
            .map_err(|e| ChainError::Malformed(format!("failed to encode relay tx: {}", e)))?;

        let tx_hash: String = self
            .call("sendrawtransaction", json!([hex::encode(raw)]))
            .await?
            .ok_or_else(|| ChainError::Transient("sendrawtransaction returned no hash".into()))?;
        let tx_hash = normalize_tx_hash(&tx_hash);

        info!(
            commit_key = %commit.key(),
            tx_hash = %tx_hash,
            account = %identity,
            "Relay transaction sent, waiting for inclusion"
        );

        let started = Instant::now();
        loop {
            match self.tx_event(&tx_hash).await {
                Ok(Some(result)) if result.state == 1 => return Ok(tx_hash),
                Ok(Some(_)) => {
                    if self.is_relayed(commit).await.unwrap_or(false) {
                        return Err(ChainError::AlreadyRelayed(format!(
                            "{} failed, message already imported",
                            tx_hash
                        )));
                    }
                    return Err(ChainError::Rejected(format!(
                        "relay transaction {} failed",
                        tx_hash
                    )));
                }
                Ok(None) => {}
                Err(e) => warn!(tx_hash = %tx_hash, error = %e, "Inclusion check failed"),
            }

            if started.elapsed() >= self.submit_timeout {
                return Err(ChainError::Transient(format!(
                    "timed out waiting for inclusion of {}",
                    tx_hash
                )));
            }
            tokio::time::sleep(INCLUSION_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use alloy::signers::local::PrivateKeySigner;
    use axum::{routing::post, Json, Router};

    use crate::config::NATIVE_CCM_ADDRESS;

    const SIDE_CHAIN: ChainId = 2;

    struct FixedEpoch(u64);

    #[async_trait]
    impl EpochSource for FixedEpoch {
        async fn current_epoch_start(&self) -> Result<u64, ChainError> {
            Ok(self.0)
        }
    }

    fn client(rpc_url: &str) -> RelayChainClient {
        let signer = Signer::from_keys(vec![PrivateKeySigner::random()]).unwrap();
        RelayChainClient {
            http: reqwest::Client::new(),
            rpc_url: rpc_url.to_string(),
            chain_id: 0,
            side_chain_id: SIDE_CHAIN,
            ccm_address: NATIVE_CCM_ADDRESS.to_string(),
            signer: Arc::new(signer),
            submit_timeout: Duration::from_secs(1),
            request_id: AtomicU64::new(1),
            epoch_source: None,
        }
    }

    fn make_proof(to_chain: u64, key: &str) -> Notify {
        Notify {
            contract_address: NATIVE_CCM_ADDRESS.to_string(),
            states: vec![
                json!(MAKE_PROOF),
                json!(6),
                json!(to_chain),
                json!("ab"),
                json!(100),
                json!(key),
            ],
        }
    }

    fn header_json(height: u64) -> Value {
        json!({
            "ChainID": 0,
            "Hash": format!("{:064x}", height),
            "PrevBlockHash": format!("{:064x}", height.saturating_sub(1)),
            "Height": height,
            "RawHeader": format!("{:02x}", height),
            "SigData": [format!("{:02x}", height + 100)]
        })
    }

    /// Relay node answering headers and proofs; records `getmerkleproof` params
    async fn serve_relay_node() -> (String, Arc<Mutex<Vec<Value>>>) {
        let header_proofs = Arc::new(Mutex::new(Vec::new()));
        let recorded = header_proofs.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let recorded = recorded.clone();
                async move {
                    let params = request["params"].clone();
                    let result = match request["method"].as_str() {
                        Some("getheaderbyheight") => header_json(params[0].as_u64().unwrap_or(0)),
                        Some("getcrossstatesproof") => {
                            json!({ "AuditPath": format!("ee{}", params[1].as_str().unwrap_or("")) })
                        }
                        Some("getmerkleproof") => {
                            recorded.lock().unwrap().push(params);
                            json!({ "AuditPath": "cc" })
                        }
                        _ => Value::Null,
                    };
                    Json(json!({ "desc": "SUCCESS", "error": 0, "result": result }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), header_proofs)
    }

    fn relay_block(height: u64) -> (BlockRef, RelayBlock) {
        let header: RelayHeader = serde_json::from_value(header_json(height)).unwrap();
        let events = vec![ExecuteNotify {
            tx_hash: "aa".repeat(32),
            state: 1,
            notify: vec![make_proof(9, "0901"), make_proof(SIDE_CHAIN, "0201")],
        }];
        let block = BlockRef {
            height,
            hash: normalize_tx_hash(&header.hash),
            parent_hash: None,
        };
        (block, RelayBlock { header, events })
    }

    #[test]
    fn test_proof_requests_filters_notifications() {
        let relay = client("http://127.0.0.1:9");
        let mut foreign = make_proof(SIDE_CHAIN, "0101");
        foreign.contract_address = "0x0900000000000000000000000000000000000000".to_string();
        let other_method = Notify {
            contract_address: format!("0x{}", NATIVE_CCM_ADDRESS.to_uppercase()),
            states: vec![json!("btcTxToRelay"), json!(1)],
        };

        let events = vec![
            ExecuteNotify {
                tx_hash: "aa".to_string(),
                state: 1,
                notify: vec![
                    foreign,
                    other_method,
                    make_proof(SIDE_CHAIN, "0201"),
                    make_proof(9, "0901"),
                ],
            },
            ExecuteNotify {
                tx_hash: "bb".to_string(),
                state: 0,
                notify: vec![make_proof(SIDE_CHAIN, "0202")],
            },
            ExecuteNotify {
                tx_hash: "cc".to_string(),
                state: 1,
                notify: vec![make_proof(SIDE_CHAIN, "0203")],
            },
        ];

        let requests = relay.proof_requests(&events).unwrap();
        assert_eq!(
            requests,
            vec![
                ProofRequest {
                    tx_hash: "aa".to_string(),
                    index: 2,
                    key: "0201".to_string(),
                },
                ProofRequest {
                    tx_hash: "cc".to_string(),
                    index: 0,
                    key: "0203".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_event_index_ignores_block_order() {
        let relay = client("http://127.0.0.1:9");
        let first = ExecuteNotify {
            tx_hash: "aa".to_string(),
            state: 1,
            notify: vec![make_proof(SIDE_CHAIN, "01")],
        };
        let second = ExecuteNotify {
            tx_hash: "bb".to_string(),
            state: 1,
            notify: vec![make_proof(9, "02"), make_proof(SIDE_CHAIN, "03")],
        };

        let forward = relay.proof_requests(&[first.clone(), second.clone()]).unwrap();
        let reversed = relay.proof_requests(&[second, first]).unwrap();
        let index_of = |requests: &[ProofRequest], tx: &str| {
            requests.iter().find(|r| r.tx_hash == tx).map(|r| r.index)
        };
        assert_eq!(index_of(&forward, "aa"), Some(0));
        assert_eq!(index_of(&forward, "bb"), Some(1));
        assert_eq!(index_of(&reversed, "aa"), index_of(&forward, "aa"));
        assert_eq!(index_of(&reversed, "bb"), index_of(&forward, "bb"));
    }

    #[test]
    fn test_anchor_height() {
        assert_eq!(anchor_height(11, None), None);
        assert_eq!(anchor_height(11, Some(10)), None);
        assert_eq!(anchor_height(10, Some(10)), Some(11));
        assert_eq!(anchor_height(4, Some(10)), Some(11));
    }

    #[tokio::test]
    async fn test_extract_within_trusted_epoch() {
        let (url, header_proofs) = serve_relay_node().await;
        let relay = client(&url).with_epoch_source(Arc::new(FixedEpoch(5)));

        let (block, data) = relay_block(10);
        let extraction = relay.extract(&block, &data).await.unwrap();

        assert_eq!(extraction.events.len(), 1);
        let event = &extraction.events[0];
        assert_eq!(event.source_height, 10);
        assert_eq!(event.event_index, 1);
        assert_eq!(event.payload, vec![0x02, 0x01]);
        assert_eq!(event.merkle_proof, vec![0xee, 0x02, 0x01]);

        // Signed header is the one at height + 1
        let header = event.header.as_ref().unwrap();
        assert_eq!(header.raw_header, vec![11]);
        assert_eq!(header.signatures, vec![111]);
        assert!(header.header_proof.is_empty());
        assert!(header.cur_raw_header.is_empty());
        assert!(header_proofs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extract_before_trusted_epoch_anchors_header() {
        let (url, header_proofs) = serve_relay_node().await;
        let relay = client(&url).with_epoch_source(Arc::new(FixedEpoch(20)));

        let (block, data) = relay_block(10);
        let extraction = relay.extract(&block, &data).await.unwrap();

        let header = extraction.events[0].header.as_ref().unwrap();
        assert_eq!(header.raw_header, vec![11]);
        assert_eq!(header.header_proof, vec![0xcc]);
        assert_eq!(header.cur_raw_header, vec![21]);
        assert_eq!(header.signatures, vec![121]);
        assert_eq!(*header_proofs.lock().unwrap(), vec![json!([11, 21])]);
    }

    #[tokio::test]
    async fn test_extract_skips_block_without_side_chain_messages() {
        let relay = client("http://127.0.0.1:9");
        let (block, mut data) = relay_block(10);
        data.events[0].notify.remove(1);

        let extraction = relay.extract(&block, &data).await.unwrap();
        assert!(extraction.events.is_empty());
    }

    #[test]
    fn test_parse_make_proof() {
        let states = vec![
            json!("makeProof"),
            json!(2),
            json!(7),
            json!("ab"),
            json!(100),
            json!("0102"),
        ];
        assert_eq!(parse_make_proof(&states).unwrap(), (7, "0102".to_string()));

        let states = vec![
            json!("makeProof"),
            json!("2"),
            json!("7"),
            json!("ab"),
            json!(100),
            json!("0102"),
        ];
        assert_eq!(parse_make_proof(&states).unwrap().0, 7);

        assert!(matches!(
            parse_make_proof(&[json!("makeProof")]),
            Err(ChainError::Malformed(_))
        ));
    }

    #[test]
    fn test_header_deserialization() {
        let header: RelayHeader = serde_json::from_value(json!({
            "ChainID": 0,
            "Hash": "aa",
            "PrevBlockHash": "bb",
            "Height": 5,
            "RawHeader": "0011",
            "SigData": ["01", "02"]
        }))
        .unwrap();
        assert_eq!(header.height, 5);
        assert_eq!(header.sig_data.len(), 2);
    }

    #[test]
    fn test_rpc_response_error_code() {
        let ok: RpcResponse<u64> =
            serde_json::from_value(json!({"desc": "SUCCESS", "error": 0, "result": 9})).unwrap();
        assert_eq!(ok.result, Some(9));

        let failed: RpcResponse<u64> =
            serde_json::from_value(json!({"desc": "INVALID PARAMS", "error": 42002, "result": null}))
                .unwrap();
        assert_eq!(failed.error, 42002);
        assert!(failed.result.is_none());
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("0x0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert!(matches!(decode_hex("zz"), Err(ChainError::Malformed(_))));
    }
}
