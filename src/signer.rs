//! Transaction signing
//!
//! Holds the unlocked relayer accounts of one chain. Accounts come from an
//! encrypted keystore directory (one JSON keystore file per account) and are
//! unlocked once at startup; any account that cannot be unlocked is fatal.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, PrimitiveSignature, B256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use tracing::{debug, info};

/// A signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: B256,
    /// EIP-2718 encoded envelope
    pub raw: Bytes,
}

/// Unlocked accounts of one chain
#[derive(Clone)]
pub struct Signer {
    accounts: HashMap<Address, PrivateKeySigner>,
    order: Vec<Address>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("accounts", &self.order)
            .finish()
    }
}

#[derive(Deserialize)]
struct KeystoreHeader {
    address: Option<String>,
    #[serde(alias = "Crypto")]
    crypto: Option<serde_json::Value>,
}

impl Signer {
    /// Unlock every keystore file in `dir`.
    ///
    /// `passwords` maps account addresses to keystore passwords. A keystore
    /// without a password, a wrong password or an empty directory is an error.
    pub fn unlock(dir: &Path, passwords: &HashMap<Address, String>) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .wrap_err_with(|| format!("Failed to read keystore directory {}", dir.display()))?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.wrap_err("Failed to read keystore entry")?.path();
            if !path.is_file() {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("Failed to read keystore {}", path.display()))?;
            let header: KeystoreHeader = match serde_json::from_str(&content) {
                Ok(header) => header,
                Err(_) => {
                    debug!(path = %path.display(), "Skipping non-keystore file");
                    continue;
                }
            };

            if header.crypto.is_none() {
                debug!(path = %path.display(), "Skipping non-keystore file");
                continue;
            }

            let key = match header.address.as_deref() {
                Some(declared) => unlock_declared(&path, declared, passwords)?,
                // Keystores written without the geth address field
                None => unlock_by_trial(&path, passwords)?,
            };
            let address = key.address();

            info!(address = %address, "Unlocked relayer account");
            keys.push(key);
        }

        Self::from_keys(keys).wrap_err_with(|| format!("No usable accounts in {}", dir.display()))
    }

    /// Build a signer from already decrypted keys
    pub fn from_keys(keys: Vec<PrivateKeySigner>) -> Result<Self> {
        if keys.is_empty() {
            return Err(eyre!("at least one account is required"));
        }

        let mut accounts = HashMap::new();
        let mut order = Vec::new();
        for key in keys {
            let address = key.address();
            if accounts.insert(address, key).is_none() {
                order.push(address);
            }
        }
        order.sort();

        Ok(Self { accounts, order })
    }

    /// Addresses of the unlocked accounts, in a stable order
    pub fn accounts(&self) -> &[Address] {
        &self.order
    }

    /// Sign a fully specified transaction with `identity`
    pub async fn sign(&self, tx: TransactionRequest, identity: Address) -> Result<SignedTransaction> {
        let key = self.key(identity)?;
        let wallet = EthereumWallet::from(key.clone());

        let envelope = tx
            .with_from(identity)
            .build(&wallet)
            .await
            .map_err(|e| eyre!("Failed to sign transaction: {}", e))?;

        Ok(SignedTransaction {
            hash: *envelope.tx_hash(),
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }

    /// Sign a 32-byte digest with `identity`
    pub fn sign_digest(&self, digest: &B256, identity: Address) -> Result<PrimitiveSignature> {
        self.key(identity)?
            .sign_hash_sync(digest)
            .map_err(|e| eyre!("Failed to sign digest: {}", e))
    }

    fn key(&self, identity: Address) -> Result<&PrivateKeySigner> {
        self.accounts
            .get(&identity)
            .ok_or_else(|| eyre!("Account {} is not unlocked", identity))
    }
}

fn unlock_declared(
    path: &Path,
    declared: &str,
    passwords: &HashMap<Address, String>,
) -> Result<PrivateKeySigner> {
    let address: Address = declared
        .parse()
        .or_else(|_| format!("0x{}", declared).parse())
        .wrap_err_with(|| format!("Invalid address in keystore {}", path.display()))?;

    let password = passwords
        .get(&address)
        .ok_or_else(|| eyre!("No password configured for account {}", address))?;

    let key = PrivateKeySigner::decrypt_keystore(path, password)
        .map_err(|e| eyre!("Failed to unlock account {}: {}", address, e))?;

    if key.address() != address {
        return Err(eyre!(
            "Keystore {} declares {} but holds the key of {}",
            path.display(),
            address,
            key.address()
        ));
    }
    Ok(key)
}

fn unlock_by_trial(path: &Path, passwords: &HashMap<Address, String>) -> Result<PrivateKeySigner> {
    for (address, password) in passwords {
        if let Ok(key) = PrivateKeySigner::decrypt_keystore(path, password) {
            if key.address() == *address {
                return Ok(key);
            }
        }
    }
    Err(eyre!(
        "No configured password unlocks keystore {}",
        path.display()
    ))
}

/// Parse `address:password` pairs separated by commas
pub fn parse_passwords(raw: &str) -> Result<HashMap<Address, String>> {
    let mut passwords = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (address, password) = pair
            .split_once(':')
            .ok_or_else(|| eyre!("Expected address:password, got an entry without ':'"))?;
        let address: Address = address
            .trim()
            .parse()
            .wrap_err_with(|| format!("Invalid account address {}", address.trim()))?;
        passwords.insert(address, password.to_string());
    }
    Ok(passwords)
}
