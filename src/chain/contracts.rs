//! Side-chain bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate bindings for the cross-chain manager
//! (ECCM), its data contract (ECCD) and the lock proxies whose deposits the
//! reconciler tracks.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Cross-chain manager: emits outbound messages, verifies inbound proofs
    #[sol(rpc)]
    contract EthCrossChainManager {
        /// Verify a relay-chain header and state proof, then execute the message
        ///
        /// # Arguments
        /// * `proof` - Cross-states proof of the message on the relay chain
        /// * `rawHeader` - Relay-chain header whose state root commits to `proof`
        /// * `headerProof` - Proof of `rawHeader` against an already synced header
        /// * `curRawHeader` - Header `headerProof` is anchored in
        /// * `headerSig` - Consensus signatures over the signed header
        function verifyHeaderAndExecuteTx(
            bytes proof,
            bytes rawHeader,
            bytes headerProof,
            bytes curRawHeader,
            bytes headerSig
        ) external returns (bool);

        /// Emitted for every outbound cross-chain message
        event CrossChainEvent(
            address indexed sender,
            bytes txId,
            address proxyOrAssetContract,
            uint64 toChainId,
            bytes toContract,
            bytes rawdata
        );
    }
}

sol! {
    /// Cross-chain data contract: storage behind the manager
    #[sol(rpc)]
    contract EthCrossChainData {
        /// Whether the inbound transaction `fromChainTx` of `fromChainId` was executed
        function checkIfFromChainTxExist(uint64 fromChainId, bytes32 fromChainTx) external view returns (bool);

        /// Height of the relay-chain epoch the contract currently trusts
        function getCurEpochStartHeight() external view returns (uint32);
    }
}

sol! {
    /// Lock proxy: user-facing deposit entry point
    #[sol(rpc)]
    contract LockProxy {
        event LockEvent(
            address fromAssetHash,
            address fromAddress,
            uint64 toChainId,
            bytes toAssetHash,
            bytes toAddress,
            uint256 amount
        );
    }
}

/// Storage slot of the ECCD mapping that records outbound message hashes
pub const ECCD_TX_HASH_SLOT: u8 = 1;
