use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::retry::RetryConfig;
use crate::types::ChainId;

/// Native cross-chain manager contract of the relay chain
pub const NATIVE_CCM_ADDRESS: &str = "0300000000000000000000000000000000000000";

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub side: SideChainConfig,
    pub relay: RelayChainConfig,
    pub scan: ScanConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub shutdown_grace_secs: u64,
    pub halt_on_consistency_error: bool,
    /// Health and metrics listener, `None` disables the server
    pub api_addr: Option<SocketAddr>,
}

/// Checkpoint store configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Side chain (EVM) configuration
#[derive(Clone)]
pub struct SideChainConfig {
    pub rpc_url: String,
    /// Id of the side chain as registered on the relay chain
    pub chain_id: ChainId,
    pub eccm_address: Address,
    pub eccd_address: Address,
    pub lock_proxy_addresses: Vec<Address>,
    pub confirmation_depth: u64,
    pub start_height: Option<u64>,
    pub start_force_height: Option<u64>,
    pub keystore_dir: PathBuf,
    pub keystore_passwords: HashMap<Address, String>,
}

/// Custom Debug that redacts keystore passwords to prevent accidental log leakage.
impl fmt::Debug for SideChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("eccm_address", &self.eccm_address)
            .field("eccd_address", &self.eccd_address)
            .field("lock_proxy_addresses", &self.lock_proxy_addresses)
            .field("confirmation_depth", &self.confirmation_depth)
            .field("start_height", &self.start_height)
            .field("start_force_height", &self.start_force_height)
            .field("keystore_dir", &self.keystore_dir)
            .field("keystore_passwords", &"<redacted>")
            .finish()
    }
}

/// Relay chain configuration
#[derive(Clone)]
pub struct RelayChainConfig {
    pub rpc_url: String,
    pub ccm_address: String,
    pub confirmation_depth: u64,
    pub start_height: Option<u64>,
    pub start_force_height: Option<u64>,
    pub keystore_dir: PathBuf,
    pub keystore_passwords: HashMap<Address, String>,
}

/// Custom Debug that redacts keystore passwords to prevent accidental log leakage.
impl fmt::Debug for RelayChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("ccm_address", &self.ccm_address)
            .field("confirmation_depth", &self.confirmation_depth)
            .field("start_height", &self.start_height)
            .field("start_force_height", &self.start_force_height)
            .field("keystore_dir", &self.keystore_dir)
            .field("keystore_passwords", &"<redacted>")
            .finish()
    }
}

/// Monitor loop configuration, shared by both chains
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_blocks_per_cycle: u64,
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Commit scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    pub batch_limit: u32,
    pub max_parallel_submissions: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_max_attempts: u32,
    pub submit_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

/// Deposit reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    pub window_secs: u64,
    pub batch_limit: u32,
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Default functions
fn default_db_path() -> String {
    "relayer.db".to_string()
}

fn default_side_confirmation_depth() -> u64 {
    12
}

fn default_relay_confirmation_depth() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_scan_retry_delay() -> u64 {
    5000
}

fn default_max_blocks_per_cycle() -> u64 {
    100
}

fn default_commit_interval() -> u64 {
    10_000
}

fn default_commit_batch_limit() -> u32 {
    100
}

fn default_max_parallel_submissions() -> usize {
    4
}

fn default_retry_initial_backoff() -> u64 {
    2000
}

fn default_retry_max_backoff() -> u64 {
    60_000
}

fn default_retry_max_attempts() -> u32 {
    0
}

fn default_submit_timeout() -> u64 {
    60_000
}

fn default_reconcile_interval() -> u64 {
    60_000
}

fn default_reconcile_window() -> u64 {
    600
}

fn default_reconcile_batch_limit() -> u32 {
    200
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_api_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| eyre!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

fn optional<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| eyre!("{} has an invalid value: {}", name, raw)),
        _ => Ok(None),
    }
}

fn parse_address(name: &str, raw: &str) -> Result<Address> {
    raw.trim()
        .parse()
        .wrap_err_with(|| format!("{} must be a valid hex address", name))
}

/// Parse a comma separated address list
pub fn parse_address_list(name: &str, raw: &str) -> Result<Vec<Address>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_address(name, s))
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            path: env::var("RELAYER_DB_PATH").unwrap_or_else(|_| default_db_path()),
        };

        let side = SideChainConfig {
            rpc_url: required("SIDE_RPC_URL")?,
            chain_id: required("SIDE_CHAIN_ID")?
                .trim()
                .parse()
                .wrap_err("SIDE_CHAIN_ID must be a valid u64")?,
            eccm_address: parse_address("SIDE_ECCM_ADDRESS", &required("SIDE_ECCM_ADDRESS")?)?,
            eccd_address: parse_address("SIDE_ECCD_ADDRESS", &required("SIDE_ECCD_ADDRESS")?)?,
            lock_proxy_addresses: parse_address_list(
                "SIDE_LOCK_PROXY_ADDRESSES",
                &env::var("SIDE_LOCK_PROXY_ADDRESSES").unwrap_or_default(),
            )?,
            confirmation_depth: parse_or(
                "SIDE_CONFIRMATION_DEPTH",
                default_side_confirmation_depth(),
            )?,
            start_height: optional("SIDE_START_HEIGHT")?,
            start_force_height: optional("SIDE_START_FORCE_HEIGHT")?,
            keystore_dir: PathBuf::from(required("SIDE_KEYSTORE_DIR")?),
            keystore_passwords: crate::signer::parse_passwords(&required(
                "SIDE_KEYSTORE_PASSWORDS",
            )?)
            .wrap_err("SIDE_KEYSTORE_PASSWORDS is invalid")?,
        };

        let relay = RelayChainConfig {
            rpc_url: required("RELAY_RPC_URL")?,
            ccm_address: env::var("RELAY_CCM_ADDRESS")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| NATIVE_CCM_ADDRESS.to_string()),
            confirmation_depth: parse_or(
                "RELAY_CONFIRMATION_DEPTH",
                default_relay_confirmation_depth(),
            )?,
            start_height: optional("RELAY_START_HEIGHT")?,
            start_force_height: optional("RELAY_START_FORCE_HEIGHT")?,
            keystore_dir: PathBuf::from(required("RELAY_KEYSTORE_DIR")?),
            keystore_passwords: crate::signer::parse_passwords(&required(
                "RELAY_KEYSTORE_PASSWORDS",
            )?)
            .wrap_err("RELAY_KEYSTORE_PASSWORDS is invalid")?,
        };

        let scan = ScanConfig {
            poll_interval_ms: parse_or("POLL_INTERVAL_MS", default_poll_interval())?,
            retry_delay_ms: parse_or("SCAN_RETRY_DELAY_MS", default_scan_retry_delay())?,
            max_blocks_per_cycle: parse_or(
                "MAX_BLOCKS_PER_CYCLE",
                default_max_blocks_per_cycle(),
            )?,
        };

        let scheduler = SchedulerConfig {
            interval_ms: parse_or("COMMIT_INTERVAL_MS", default_commit_interval())?,
            batch_limit: parse_or("COMMIT_BATCH_LIMIT", default_commit_batch_limit())?,
            max_parallel_submissions: parse_or(
                "MAX_PARALLEL_SUBMISSIONS",
                default_max_parallel_submissions(),
            )?,
            retry_initial_backoff_ms: parse_or(
                "RETRY_INITIAL_BACKOFF_MS",
                default_retry_initial_backoff(),
            )?,
            retry_max_backoff_ms: parse_or("RETRY_MAX_BACKOFF_MS", default_retry_max_backoff())?,
            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", default_retry_max_attempts())?,
            submit_timeout_ms: parse_or("SUBMIT_TIMEOUT_MS", default_submit_timeout())?,
        };

        let reconciler = ReconcilerConfig {
            interval_ms: parse_or("RECONCILE_INTERVAL_MS", default_reconcile_interval())?,
            window_secs: parse_or("RECONCILE_WINDOW_SECS", default_reconcile_window())?,
            batch_limit: parse_or("RECONCILE_BATCH_LIMIT", default_reconcile_batch_limit())?,
        };

        let api_addr_raw = env::var("API_ADDR").unwrap_or_else(|_| default_api_addr());
        let api_addr = if api_addr_raw.trim().is_empty() {
            None
        } else {
            Some(
                api_addr_raw
                    .trim()
                    .parse()
                    .wrap_err("API_ADDR must be a socket address such as 0.0.0.0:9090")?,
            )
        };

        let config = Config {
            database,
            side,
            relay,
            scan,
            scheduler,
            reconciler,
            shutdown_grace_secs: parse_or("SHUTDOWN_GRACE_SECS", default_shutdown_grace())?,
            halt_on_consistency_error: parse_or("HALT_ON_CONSISTENCY_ERROR", true)?,
            api_addr,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(eyre!("database.path cannot be empty"));
        }

        if self.side.rpc_url.is_empty() {
            return Err(eyre!("side.rpc_url cannot be empty"));
        }

        if self.relay.rpc_url.is_empty() {
            return Err(eyre!("relay.rpc_url cannot be empty"));
        }

        if self.side.eccm_address == Address::ZERO || self.side.eccd_address == Address::ZERO {
            return Err(eyre!("side chain contract addresses cannot be zero"));
        }

        let ccm = self.relay.ccm_address.trim_start_matches("0x");
        if ccm.len() != 40 || hex::decode(ccm).is_err() {
            return Err(eyre!("relay.ccm_address must be 20 bytes of hex"));
        }

        for (name, start, force) in [
            ("side", self.side.start_height, self.side.start_force_height),
            ("relay", self.relay.start_height, self.relay.start_force_height),
        ] {
            if let (Some(start), Some(force)) = (start, force) {
                if start != force {
                    tracing::warn!(
                        chain = name,
                        start,
                        force,
                        "Both start and forced start height set; the forced height wins"
                    );
                }
            }
        }

        if self.side.keystore_passwords.is_empty() || self.relay.keystore_passwords.is_empty() {
            return Err(eyre!("keystore passwords must be configured for both chains"));
        }

        if self.scan.max_blocks_per_cycle == 0 {
            return Err(eyre!("scan.max_blocks_per_cycle must be at least 1"));
        }

        if self.scheduler.max_parallel_submissions == 0 {
            return Err(eyre!("scheduler.max_parallel_submissions must be at least 1"));
        }

        if self.scheduler.batch_limit == 0 {
            return Err(eyre!("scheduler.batch_limit must be at least 1"));
        }

        if self.reconciler.batch_limit == 0 {
            return Err(eyre!("reconciler.batch_limit must be at least 1"));
        }

        if self.scheduler.retry_initial_backoff_ms > self.scheduler.retry_max_backoff_ms {
            return Err(eyre!(
                "RETRY_INITIAL_BACKOFF_MS cannot exceed RETRY_MAX_BACKOFF_MS"
            ));
        }

        if self.scheduler.submit_timeout_ms == 0 {
            return Err(eyre!("scheduler.submit_timeout_ms must be positive"));
        }

        Ok(())
    }
}
