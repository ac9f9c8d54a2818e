//! Durable storage boundary
//!
//! The chain treats storage as an opaque durable map: blocks by hash,
//! transactions by hash with their containing-block reference, plus the
//! secondary lookups the chain needs (children by parent hash, the active
//! chain by height). Keys are the raw 32-byte hashes.

use crate::block::StoredBlock;
use crate::transaction::Transaction;
use crate::{BlockHeight, CoreError, Hash256, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A transaction at rest, with its containing-block reference
#[derive(Debug, Clone)]
pub struct StoredTx {
    pub tx: Transaction,
    pub block_hash: Hash256,
    pub index: u32,
}

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Insert or update a block record (updates toggle `active`)
    async fn put_block(&self, block: &StoredBlock) -> Result<()>;

    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<StoredBlock>>;

    /// All known blocks whose parent is `prev`
    async fn blocks_by_prev(&self, prev: &Hash256) -> Result<Vec<StoredBlock>>;

    async fn knows_block(&self, hash: &Hash256) -> Result<bool>;

    async fn put_tx(&self, tx: &Transaction, block_hash: &Hash256, index: u32) -> Result<()>;

    async fn tx_by_hash(&self, hash: &Hash256) -> Result<Option<StoredTx>>;

    /// Transactions of a block in their in-block order
    async fn txs_by_block(&self, block_hash: &Hash256) -> Result<Vec<Transaction>>;

    /// The active-chain block at `height`, if the active chain reaches it
    async fn active_block_at_height(&self, height: BlockHeight) -> Result<Option<StoredBlock>>;

    /// The active block of greatest cumulative work, for tip rehydration
    async fn active_tip(&self) -> Result<Option<StoredBlock>>;
}

/// Open a storage backend from its configured URI.
pub fn open(uri: &str) -> Result<Arc<dyn Storage>> {
    match uri.split_once(':') {
        Some(("mem", _)) | None => Ok(Arc::new(MemoryStorage::new())),
        Some((scheme, _)) => Err(CoreError::Storage(format!(
            "unsupported storage scheme '{scheme}'"
        ))),
    }
}

#[derive(Default)]
struct MemoryInner {
    blocks: HashMap<Hash256, StoredBlock>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    active_by_height: HashMap<BlockHeight, Hash256>,
    txs: HashMap<Hash256, StoredTx>,
    txs_in_block: HashMap<Hash256, Vec<Hash256>>,
}

/// In-memory storage engine. Models the durable map exactly; a disk engine
/// implements the same trait behind a different URI scheme.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn put_block(&self, block: &StoredBlock) -> Result<()> {
        let mut inner = self.inner.write().await;

        if !inner.blocks.contains_key(&block.hash) {
            inner
                .by_prev
                .entry(block.header.prev_block_hash)
                .or_default()
                .push(block.hash);
        }

        if block.active {
            inner.active_by_height.insert(block.height, block.hash);
        } else if inner.active_by_height.get(&block.height) == Some(&block.hash) {
            inner.active_by_height.remove(&block.height);
        }

        inner.blocks.insert(block.hash, block.clone());
        Ok(())
    }

    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<StoredBlock>> {
        Ok(self.inner.read().await.blocks.get(hash).cloned())
    }

    async fn blocks_by_prev(&self, prev: &Hash256) -> Result<Vec<StoredBlock>> {
        let inner = self.inner.read().await;
        let hashes = match inner.by_prev.get(prev) {
            Some(hashes) => hashes,
            None => return Ok(Vec::new()),
        };
        Ok(hashes
            .iter()
            .filter_map(|h| inner.blocks.get(h).cloned())
            .collect())
    }

    async fn knows_block(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.inner.read().await.blocks.contains_key(hash))
    }

    async fn put_tx(&self, tx: &Transaction, block_hash: &Hash256, index: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        let txid = tx.txid();
        inner.txs.insert(
            txid,
            StoredTx {
                tx: tx.clone(),
                block_hash: *block_hash,
                index,
            },
        );
        let in_block = inner.txs_in_block.entry(*block_hash).or_default();
        if !in_block.contains(&txid) {
            in_block.push(txid);
        }
        Ok(())
    }

    async fn tx_by_hash(&self, hash: &Hash256) -> Result<Option<StoredTx>> {
        Ok(self.inner.read().await.txs.get(hash).cloned())
    }

    async fn txs_by_block(&self, block_hash: &Hash256) -> Result<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let hashes = match inner.txs_in_block.get(block_hash) {
            Some(hashes) => hashes,
            None => return Ok(Vec::new()),
        };
        let mut txs: Vec<&StoredTx> = hashes.iter().filter_map(|h| inner.txs.get(h)).collect();
        txs.sort_by_key(|stored| stored.index);
        Ok(txs.iter().map(|stored| stored.tx.clone()).collect())
    }

    async fn active_block_at_height(&self, height: BlockHeight) -> Result<Option<StoredBlock>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active_by_height
            .get(&height)
            .and_then(|h| inner.blocks.get(h))
            .cloned())
    }

    async fn active_tip(&self) -> Result<Option<StoredBlock>> {
        let inner = self.inner.read().await;
        Ok(inner
            .blocks
            .values()
            .filter(|b| b.active)
            .max_by_key(|b| b.chain_work)
            .cloned())
    }
}
