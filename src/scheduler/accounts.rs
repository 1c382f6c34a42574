//! Submitting accounts of one destination chain
//!
//! An account has at most one transaction in flight. Workers lease an idle
//! account and hand it back when the submission settles.

use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use eyre::{eyre, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct AccountPool {
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Address>>>,
    size: usize,
}

impl AccountPool {
    pub fn new(accounts: &[Address]) -> Result<Self> {
        if accounts.is_empty() {
            return Err(eyre!("account pool needs at least one account"));
        }
        let mut idle = accounts.to_vec();
        idle.sort();
        idle.dedup();
        // Leases pop from the back; keep the first account first in line
        idle.reverse();
        let size = idle.len();
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new(idle)),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of accounts without a transaction in flight
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for an idle account
    pub async fn lease(&self) -> Result<AccountLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| eyre!("account pool closed"))?;
        let address = self
            .idle
            .lock()
            .map_err(|_| eyre!("account pool poisoned"))?
            .pop()
            .ok_or_else(|| eyre!("permit granted without an idle account"))?;
        Ok(AccountLease {
            address,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

/// Exclusive use of one account, released on drop
#[derive(Debug)]
pub struct AccountLease {
    address: Address,
    idle: Arc<Mutex<Vec<Address>>>,
    // Dropped after the address is back in the idle list
    _permit: OwnedSemaphorePermit,
}

impl AccountLease {
    pub fn address(&self) -> Address {
        self.address
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(AccountPool::new(&[]).is_err());
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let pool = AccountPool::new(&[addr(1), addr(2)]).unwrap();
        assert_eq!(pool.size(), 2);

        let a = pool.lease().await.unwrap();
        let b = pool.lease().await.unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(pool.available(), 0);

        // A third lease waits until one is returned
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.lease()).await;
        assert!(blocked.is_err());

        let released = a.address();
        drop(a);
        let c = pool.lease().await.unwrap();
        assert_eq!(c.address(), released);
    }

    #[tokio::test]
    async fn test_duplicate_accounts_collapsed() {
        let pool = AccountPool::new(&[addr(3), addr(3)]).unwrap();
        assert_eq!(pool.size(), 1);
        let lease = pool.lease().await.unwrap();
        assert_eq!(lease.address(), addr(3));
    }
}
