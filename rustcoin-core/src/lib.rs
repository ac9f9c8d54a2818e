//! Chain-and-pool engine for a proof-of-work cryptocurrency node
//!
//! The two load-bearing components live here: [`chain::BlockChain`] (block
//! ingestion, validation, chain selection, reorgs) and
//! [`mempool::TransactionStore`] (unconfirmed transactions with shared
//! verification and orphan promotion). Durable persistence sits behind the
//! [`storage::Storage`] trait.

use serde::{Deserialize, Serialize};

/// 256-bit hash type used throughout the chain
pub type Hash256 = [u8; 32];

/// All-zero hash, used as the null outpoint txid and the genesis parent
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Amount type with satoshi precision (1e-8)
pub type Amount = i64;

/// Block height type (-1 while unassigned)
pub type BlockHeight = i32;

/// Transaction outpoint reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Null outpoint, only valid in a coinbase input
    pub fn null() -> Self {
        Self {
            txid: ZERO_HASH,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == ZERO_HASH && self.vout == u32::MAX
    }
}

/// Error types for chain and pool operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("missing source transaction {}", hex::encode(.missing))]
    MissingSource { missing: Hash256 },

    #[error("invalid proof of work")]
    InvalidProofOfWork,

    #[error("merkle root mismatch")]
    InvalidMerkle,

    #[error("block timestamp too far in the future")]
    InvalidTimestamp,

    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    #[error("non-standard transaction: {0}")]
    NonStandard(String),

    #[error("outpoint already spent by a pooled transaction")]
    DoubleSpend,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal consistency violation: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::InvalidStructure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Utility functions
pub mod utils {
    use super::Hash256;
    use sha2::{Digest, Sha256};

    /// dSHA256, the universal digest of the protocol
    pub fn double_sha256(data: &[u8]) -> Hash256 {
        let first_hash = Sha256::digest(data);
        let second_hash = Sha256::digest(first_hash);
        second_hash.into()
    }

    /// Hex form of a hash in the conventional reversed (display) byte order
    pub fn hash_to_hex(hash: &Hash256) -> String {
        let mut reversed = *hash;
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn hex_to_hash(s: &str) -> super::Result<Hash256> {
        let bytes = hex::decode(s)
            .map_err(|e| super::CoreError::InvalidStructure(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(super::CoreError::InvalidStructure(format!(
                "expected 32 hash bytes, got {}",
                bytes.len()
            )));
        }
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        hash.reverse();
        Ok(hash)
    }
}

pub mod block;
pub mod chain;
pub mod codec;
pub mod genesis;
pub mod mempool;
pub mod pow;
pub mod script;
pub mod storage;
pub mod transaction;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_sha256_known_vector() {
        // dSHA256("hello") is a fixed, well-known digest
        let digest = utils::double_sha256(b"hello");
        assert_eq!(
            hex::encode(digest),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_outpoint_null() {
        let null = OutPoint::null();
        assert!(null.is_null());
        assert!(!OutPoint::new([1u8; 32], 0).is_null());
        assert!(!OutPoint::new(ZERO_HASH, 0).is_null());
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let hex = utils::hash_to_hex(&hash);
        assert!(hex.starts_with("01"));
        assert_eq!(utils::hex_to_hash(&hex).unwrap(), hash);
    }
}
