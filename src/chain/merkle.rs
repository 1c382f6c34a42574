//! Relay-chain cross-states proofs
//!
//! An audit path starts with the proven value as var-bytes, followed by one
//! `(position, sibling hash)` pair per tree level. The value is the serialized
//! cross-chain message the side-chain manager executes.

use alloy::primitives::B256;

use super::ChainError;

/// Length of one audit path step: position byte plus sibling hash
const PATH_STEP: usize = 33;

/// Message proven by a cross-states proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleValue {
    /// Relay-chain transaction that carried the message
    pub tx_hash: Vec<u8>,
    /// Chain the message originates from
    pub from_chain_id: u64,
    pub param: MakeTxParam,
}

/// Cross-chain call as submitted on the origin chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeTxParam {
    pub tx_hash: Vec<u8>,
    pub cross_chain_id: Vec<u8>,
    pub from_contract: Vec<u8>,
    pub to_chain_id: u64,
    pub to_contract: Vec<u8>,
    pub method: String,
    pub args: Vec<u8>,
}

impl MerkleValue {
    /// Decode the value proven by `audit_path`
    pub fn from_audit_path(audit_path: &[u8]) -> Result<Self, ChainError> {
        let mut source = Source::new(audit_path);
        let value = source.var_bytes()?;
        if source.remaining() % PATH_STEP != 0 {
            return Err(ChainError::Malformed(format!(
                "audit path has {} trailing bytes",
                source.remaining() % PATH_STEP
            )));
        }
        Self::decode(value)
    }

    fn decode(value: &[u8]) -> Result<Self, ChainError> {
        let mut source = Source::new(value);
        let tx_hash = source.var_bytes()?.to_vec();
        let from_chain_id = source.u64()?;
        let param = MakeTxParam {
            tx_hash: source.var_bytes()?.to_vec(),
            cross_chain_id: source.var_bytes()?.to_vec(),
            from_contract: source.var_bytes()?.to_vec(),
            to_chain_id: source.u64()?,
            to_contract: source.var_bytes()?.to_vec(),
            method: String::from_utf8(source.var_bytes()?.to_vec())
                .map_err(|_| ChainError::Malformed("method name is not utf-8".into()))?,
            args: source.var_bytes()?.to_vec(),
        };
        Ok(Self {
            tx_hash,
            from_chain_id,
            param,
        })
    }

    /// Key the side-chain data contract records an executed message under
    pub fn executed_key(&self) -> Result<(u64, B256), ChainError> {
        let tx_hash = B256::try_from(self.tx_hash.as_slice()).map_err(|_| {
            ChainError::Malformed(format!(
                "cross-chain tx hash of {} bytes",
                self.tx_hash.len()
            ))
        })?;
        Ok((self.from_chain_id, tx_hash))
    }
}

/// Little-endian reader with var-length prefixes
struct Source<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Source<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChainError> {
        if self.remaining() < n {
            return Err(ChainError::Malformed(format!(
                "merkle value truncated at byte {}",
                self.pos
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u64(&mut self) -> Result<u64, ChainError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn var_uint(&mut self) -> Result<u64, ChainError> {
        let tag = self.take(1)?[0];
        let width = match tag {
            0xfd => 2,
            0xfe => 4,
            0xff => 8,
            _ => return Ok(tag as u64),
        };
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(self.take(width)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn var_bytes(&mut self) -> Result<&'a [u8], ChainError> {
        let len = self.var_uint()?;
        let len = usize::try_from(len)
            .map_err(|_| ChainError::Malformed(format!("length {} out of range", len)))?;
        self.take(len)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
        if bytes.len() < 0xfd {
            out.push(bytes.len() as u8);
        } else {
            out.push(0xfd);
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(bytes);
    }

    /// Audit path proving a message from `from_chain_id` carried by `tx_hash`
    pub(crate) fn audit_path(tx_hash: &[u8], from_chain_id: u64, args: &[u8]) -> Vec<u8> {
        let mut value = Vec::new();
        var_bytes(&mut value, tx_hash);
        value.extend_from_slice(&from_chain_id.to_le_bytes());
        var_bytes(&mut value, &[0x11; 32]);
        var_bytes(&mut value, &[0x01]);
        var_bytes(&mut value, &[0x22; 20]);
        value.extend_from_slice(&2u64.to_le_bytes());
        var_bytes(&mut value, &[0x33; 20]);
        var_bytes(&mut value, b"unlock");
        var_bytes(&mut value, args);

        let mut path = Vec::new();
        var_bytes(&mut path, &value);
        path.push(0);
        path.extend_from_slice(&[0x44; 32]);
        path
    }

    #[test]
    fn test_decode_merkle_value() {
        let path = audit_path(&[0xab; 32], 6, &[0x55; 300]);
        let value = MerkleValue::from_audit_path(&path).unwrap();

        assert_eq!(value.tx_hash, vec![0xab; 32]);
        assert_eq!(value.from_chain_id, 6);
        assert_eq!(value.param.to_chain_id, 2);
        assert_eq!(value.param.method, "unlock");
        assert_eq!(value.param.args.len(), 300);
        assert_eq!(value.executed_key().unwrap(), (6, B256::repeat_byte(0xab)));
    }

    #[test]
    fn test_rejects_broken_paths() {
        let path = audit_path(&[0xab; 32], 6, &[]);
        assert!(matches!(
            MerkleValue::from_audit_path(&path[..path.len() - 1]),
            Err(ChainError::Malformed(_))
        ));
        assert!(matches!(
            MerkleValue::from_audit_path(&[0x05, 0x01]),
            Err(ChainError::Malformed(_))
        ));

        // The data contract keys on a full 32-byte hash
        let short = MerkleValue::from_audit_path(&audit_path(&[0xab; 20], 6, &[])).unwrap();
        assert!(matches!(short.executed_key(), Err(ChainError::Malformed(_))));
    }
}
