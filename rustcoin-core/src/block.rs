//! Block entities: header, full block, and the chain index record

use crate::codec::{read_hash, read_u32_le, read_varint, write_hash, write_u32_le, write_varint};
use crate::pow::{check_proof_of_work, decode_compact_bits};
use crate::transaction::Transaction;
use crate::{utils, BlockHeight, CoreError, Hash256, Result, ZERO_HASH};
use primitive_types::U256;
use std::io::{Cursor, Read, Write};

/// Accepted clock drift for block timestamps, in seconds
pub const MAX_TIMESTAMP_DRIFT: u32 = 2 * 3600;

/// Upper bound on transactions decoded from one block message
const MAX_BLOCK_TXS: u64 = 1_000_000;

/// Block header - 80 bytes on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn new(
        version: u32,
        prev_block_hash: Hash256,
        merkle_root: Hash256,
        timestamp: u32,
        bits: u32,
        nonce: u32,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        }
    }

    /// Block hash: dSHA256 over the 80 serialized header bytes
    pub fn hash(&self) -> Hash256 {
        utils::double_sha256(&self.serialize())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(80);
        self.encode(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        write_u32_le(w, self.version)?;
        write_hash(w, &self.prev_block_hash)?;
        write_hash(w, &self.merkle_root)?;
        write_u32_le(w, self.timestamp)?;
        write_u32_le(w, self.bits)?;
        write_u32_le(w, self.nonce)
    }

    pub fn decode<R: Read>(r: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            version: read_u32_le(r)?,
            prev_block_hash: read_hash(r)?,
            merkle_root: read_hash(r)?,
            timestamp: read_u32_le(r)?,
            bits: read_u32_le(r)?,
            nonce: read_u32_le(r)?,
        })
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash == ZERO_HASH
    }
}

/// Block: header plus ordered transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Merkle root over the transaction ids. Levels with an odd population
    /// duplicate their last hash before pairing.
    pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
        let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
        if hashes.is_empty() {
            return ZERO_HASH;
        }

        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity((hashes.len() + 1) / 2);
            for chunk in hashes.chunks(2) {
                let left = &chunk[0];
                let right = chunk.get(1).unwrap_or(&chunk[0]);
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(left);
                combined[32..].copy_from_slice(right);
                next_level.push(utils::double_sha256(&combined));
            }
            hashes = next_level;
        }

        hashes[0]
    }

    /// Consensus checks that run before a block may touch storage, in order:
    /// proof of work, timestamp bound, transaction list shape, merkle root.
    ///
    /// There is no separate hash-integrity check here: a block message
    /// carries no hash field, so the entity's identity is always the
    /// recomputed header hash and cannot disagree with itself. The node
    /// checks deliveries against the inventory hash they were requested by,
    /// the one place a peer actually claims a hash for a block.
    pub fn check(&self, now: u32) -> Result<()> {
        if !check_proof_of_work(&self.hash(), self.header.bits) {
            return Err(CoreError::InvalidProofOfWork);
        }

        if self.header.timestamp > now.saturating_add(MAX_TIMESTAMP_DRIFT) {
            return Err(CoreError::InvalidTimestamp);
        }

        if self.transactions.is_empty() {
            return Err(CoreError::InvalidStructure(
                "block has no transactions".to_string(),
            ));
        }
        if !self.transactions[0].is_coinbase() {
            return Err(CoreError::InvalidStructure(
                "first transaction is not coinbase".to_string(),
            ));
        }
        for (i, tx) in self.transactions.iter().enumerate().skip(1) {
            if tx.is_coinbase() {
                return Err(CoreError::InvalidStructure(format!(
                    "transaction {i} is coinbase"
                )));
            }
        }

        if Self::merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(CoreError::InvalidMerkle);
        }

        Ok(())
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        let mut size = 80;
        let mut count_buf = Vec::with_capacity(9);
        write_varint(&mut count_buf, self.transactions.len() as u64)
            .expect("writing to a Vec cannot fail");
        size += count_buf.len();
        size + self
            .transactions
            .iter()
            .map(|tx| tx.size())
            .sum::<usize>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.encode(&mut buf)
            .expect("writing to a Vec cannot fail");
        buf
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        self.header.encode(w)?;
        write_varint(w, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            tx.encode(w)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let header = BlockHeader::decode(r)?;
        let tx_count = read_varint(r)?;
        if tx_count > MAX_BLOCK_TXS {
            return Err(CoreError::InvalidStructure(format!(
                "block claims {tx_count} transactions"
            )));
        }
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(r)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Self::decode(&mut Cursor::new(data))
    }
}

/// Chain index record: a block's header plus everything the chain derives
/// about it. Never deleted once stored; `active` toggles on reorg.
#[derive(Debug, Clone)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: BlockHeight,
    pub size: u32,
    pub active: bool,
    pub chain_work: U256,
}

impl StoredBlock {
    pub fn from_block(block: &Block) -> Self {
        Self {
            header: block.header.clone(),
            hash: block.hash(),
            height: -1,
            size: block.size() as u32,
            active: false,
            chain_work: U256::zero(),
        }
    }

    /// Target decoded from the header's compact bits. Retarget-rule
    /// validation is a known gap: `bits` is accepted as received.
    pub fn target(&self) -> U256 {
        decode_compact_bits(self.header.bits)
    }
}
