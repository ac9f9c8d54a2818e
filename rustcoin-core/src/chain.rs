//! Block chain engine: the authoritative block index and active tip
//!
//! All admissions funnel through [`BlockChain::add`], which validates,
//! assigns height and cumulative work, decides chain membership (extend,
//! reorganize, or park on a side chain), persists through the
//! [`Storage`](crate::storage::Storage) boundary, and emits typed events.
//! Blocks whose parent is unknown wait in an in-memory orphan pool and are
//! re-fed when the parent arrives.

use crate::block::{Block, BlockHeader, StoredBlock};
use crate::pow::work_from_bits;
use crate::storage::Storage;
use crate::transaction::Transaction;
use crate::{utils, BlockHeight, CoreError, Hash256, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Chain transitions observable by downstream components
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block passed validation and is about to persist
    BlockAdd { hash: Hash256, height: BlockHeight },
    /// A block and its transactions are durable on the chain
    BlockSave { hash: Hash256, height: BlockHeight },
    /// A block left the active chain in a reorganization
    BlockRevoke { hash: Hash256, height: BlockHeight },
    /// A transaction joined the active chain
    TxAdd {
        tx: Transaction,
        block_hash: Hash256,
        index: u32,
    },
    /// A transaction is durable with its containing-block reference
    TxSave {
        tx_hash: Hash256,
        block_hash: Hash256,
    },
    /// A transaction left the active chain in a reorganization
    TxRevoke { tx: Transaction, block_hash: Hash256 },
}

/// Outcome of one `add` call
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The block was already stored; nothing happened
    AlreadyKnown,
    /// Parent unknown; the block waits in the orphan pool
    PendingParent { missing: Hash256 },
    /// The block extended the active tip
    Extended { hash: Hash256, height: BlockHeight },
    /// The block's branch overtook the active chain
    Reorganized {
        hash: Hash256,
        height: BlockHeight,
        revoked: usize,
    },
    /// Stored as an inactive side-chain block
    SideChain { hash: Hash256 },
}

impl AddOutcome {
    /// Hash of a block that was newly connected to the stored chain
    fn connected_hash(&self) -> Option<Hash256> {
        match self {
            AddOutcome::Extended { hash, .. }
            | AddOutcome::Reorganized { hash, .. }
            | AddOutcome::SideChain { hash } => Some(*hash),
            _ => None,
        }
    }
}

/// Pre-persist hook; may enrich the record, and an error aborts admission
/// of that block
pub type BlockAddHook = Box<dyn Fn(&Block, &mut StoredBlock) -> Result<()> + Send + Sync>;

struct ChainInner {
    tip: Option<StoredBlock>,
    /// Orphan blocks keyed by the parent hash they wait for
    orphans: HashMap<Hash256, Vec<Block>>,
    /// Hashes of parked orphans, for inbound deduplication
    orphan_hashes: HashSet<Hash256>,
}

pub struct BlockChain {
    storage: Arc<dyn Storage>,
    genesis: Block,
    state: Mutex<ChainInner>,
    events: broadcast::Sender<ChainEvent>,
    hooks: std::sync::RwLock<Vec<BlockAddHook>>,
}

impl BlockChain {
    pub fn new(storage: Arc<dyn Storage>, genesis: Block) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            storage,
            genesis,
            state: Mutex::new(ChainInner {
                tip: None,
                orphans: HashMap::new(),
                orphan_hashes: HashSet::new(),
            }),
            events,
            hooks: std::sync::RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to chain events
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Register a pre-persist hook run at the `BlockAdd` point
    pub fn on_block_add(&self, hook: BlockAddHook) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }

    /// Ensure the genesis block is stored and rehydrate the active tip.
    pub async fn init(&self) -> Result<()> {
        let genesis_hash = self.genesis.hash();
        if !self.storage.knows_block(&genesis_hash).await? {
            let mut record = StoredBlock::from_block(&self.genesis);
            record.height = 0;
            record.active = true;
            record.chain_work = work_from_bits(self.genesis.header.bits);
            self.persist(&record, &self.genesis.transactions).await?;
            info!(
                "🌱 Stored genesis block {}",
                utils::hash_to_hex(&genesis_hash)
            );
        }

        let tip = self
            .storage
            .active_tip()
            .await?
            .ok_or_else(|| CoreError::Fatal("no active tip after genesis load".to_string()))?;
        info!(
            "⛓️  Chain initialized at height {} (tip {})",
            tip.height,
            utils::hash_to_hex(&tip.hash)
        );
        self.state.lock().await.tip = Some(tip);
        Ok(())
    }

    /// Current active tip
    pub async fn tip(&self) -> Option<StoredBlock> {
        self.state.lock().await.tip.clone()
    }

    /// Assemble a block entity from parsed header fields and transactions
    pub fn make_block(&self, header: BlockHeader, transactions: Vec<Transaction>) -> Block {
        Block::new(header, transactions)
    }

    pub async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<StoredBlock>> {
        self.storage.block_by_hash(hash).await
    }

    pub async fn active_block_at_height(&self, height: BlockHeight) -> Result<Option<StoredBlock>> {
        self.storage.active_block_at_height(height).await
    }

    /// Locator for our own active chain: the last blocks densely, then
    /// exponentially sparser back to genesis.
    pub async fn build_locator(&self) -> Result<Vec<Hash256>> {
        let tip = match self.tip().await {
            Some(tip) => tip,
            None => return Ok(vec![self.genesis.hash()]),
        };
        let mut hashes = Vec::new();
        let mut height = tip.height;
        let mut step: BlockHeight = 1;
        while height > 0 {
            if let Some(block) = self.storage.active_block_at_height(height).await? {
                hashes.push(block.hash);
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height = height.saturating_sub(step);
        }
        hashes.push(self.genesis.hash());
        Ok(hashes)
    }

    /// Resolve a block locator: the first entry present on the active chain
    /// wins, falling back to the genesis block.
    pub async fn block_by_locator(&self, locator: &[Hash256]) -> Result<StoredBlock> {
        for hash in locator {
            if let Some(block) = self.storage.block_by_hash(hash).await? {
                if block.active {
                    return Ok(block);
                }
            }
        }
        self.storage
            .block_by_hash(&self.genesis.hash())
            .await?
            .ok_or_else(|| CoreError::Fatal("genesis missing from storage".to_string()))
    }

    /// Active-chain hashes after `height`, at most `limit` of them
    pub async fn active_hashes_after(
        &self,
        height: BlockHeight,
        limit: usize,
    ) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        let mut next = height + 1;
        while hashes.len() < limit {
            match self.storage.active_block_at_height(next).await? {
                Some(block) => {
                    hashes.push(block.hash);
                    next += 1;
                }
                None => break,
            }
        }
        Ok(hashes)
    }

    /// Run a block through the add pipeline, then drain any orphans the
    /// admission unlocked, iteratively to fixpoint.
    pub async fn add(&self, block: Block) -> Result<AddOutcome> {
        let mut inner = self.state.lock().await;
        let outcome = self.admit(&mut inner, block).await?;

        let mut worklist: Vec<Hash256> = outcome.connected_hash().into_iter().collect();
        while let Some(parent_hash) = worklist.pop() {
            let children = inner.orphans.remove(&parent_hash).unwrap_or_default();
            for child in children {
                let child_hash = child.hash();
                inner.orphan_hashes.remove(&child_hash);
                match self.admit(&mut inner, child).await {
                    Ok(child_outcome) => {
                        if let Some(hash) = child_outcome.connected_hash() {
                            worklist.push(hash);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "orphan block {} rejected on promotion: {}",
                            utils::hash_to_hex(&child_hash),
                            e
                        );
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// One admission, without orphan draining.
    async fn admit(&self, inner: &mut ChainInner, block: Block) -> Result<AddOutcome> {
        let hash = block.hash();

        if self.storage.knows_block(&hash).await? {
            return Ok(AddOutcome::AlreadyKnown);
        }

        block.check(unix_time())?;

        let parent = match self
            .storage
            .block_by_hash(&block.header.prev_block_hash)
            .await?
        {
            Some(parent) => parent,
            None => {
                let missing = block.header.prev_block_hash;
                if inner.orphan_hashes.insert(hash) {
                    debug!(
                        "📦 Parking orphan block {} (waiting for {})",
                        utils::hash_to_hex(&hash),
                        utils::hash_to_hex(&missing)
                    );
                    inner.orphans.entry(missing).or_default().push(block);
                }
                return Ok(AddOutcome::PendingParent { missing });
            }
        };

        let mut record = StoredBlock::from_block(&block);
        record.height = parent.height + 1;
        record.chain_work = parent.chain_work + work_from_bits(block.header.bits);

        // Pre-persist hooks may enrich or abort; abort is fatal for the block
        {
            let hooks = self
                .hooks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for hook in hooks.iter() {
                hook(&block, &mut record)?;
            }
        }
        let _ = self.events.send(ChainEvent::BlockAdd {
            hash,
            height: record.height,
        });

        let tip = inner
            .tip
            .clone()
            .ok_or_else(|| CoreError::Fatal("chain not initialized".to_string()))?;

        if parent.hash == tip.hash {
            record.active = true;
            self.persist(&record, &block.transactions).await?;
            inner.tip = Some(record.clone());
            self.emit_connect_events(&record, &block.transactions);
            info!(
                "✅ Block {} extends the chain at height {}",
                utils::hash_to_hex(&hash),
                record.height
            );
            Ok(AddOutcome::Extended {
                hash,
                height: record.height,
            })
        } else if record.chain_work > tip.chain_work {
            let revoked = self
                .reorganize(inner, &tip, record.clone(), &block.transactions)
                .await?;
            info!(
                "🔀 Reorganized onto {} at height {} ({} blocks revoked)",
                utils::hash_to_hex(&hash),
                record.height,
                revoked
            );
            Ok(AddOutcome::Reorganized {
                hash,
                height: record.height,
                revoked,
            })
        } else {
            // Equal work retains the incumbent tip
            record.active = false;
            self.persist(&record, &block.transactions).await?;
            let _ = self.events.send(ChainEvent::BlockSave {
                hash,
                height: record.height,
            });
            debug!(
                "Stored side-chain block {} at height {}",
                utils::hash_to_hex(&hash),
                record.height
            );
            Ok(AddOutcome::SideChain { hash })
        }
    }

    /// Switch the active chain onto the branch ending in `new_tip`.
    ///
    /// Walks parent pointers from both tips to their lowest common ancestor,
    /// then revokes the abandoned branch and applies the adopted one. Every
    /// storage write completes before any post-persist event fires; on a
    /// write error the tip pointer is left untouched and nothing is emitted.
    async fn reorganize(
        &self,
        inner: &mut ChainInner,
        old_tip: &StoredBlock,
        new_tip: StoredBlock,
        new_tip_txs: &[Transaction],
    ) -> Result<usize> {
        let mut revoke: Vec<StoredBlock> = Vec::new();
        let mut adopt: Vec<StoredBlock> = Vec::new();

        let mut a = old_tip.clone();
        let mut b = new_tip.clone();
        while b.height > a.height {
            adopt.push(b.clone());
            b = self.stored_parent(&b).await?;
        }
        while a.height > b.height {
            revoke.push(a.clone());
            a = self.stored_parent(&a).await?;
        }
        while a.hash != b.hash {
            revoke.push(a.clone());
            adopt.push(b.clone());
            a = self.stored_parent(&a).await?;
            b = self.stored_parent(&b).await?;
        }
        // `a` is now the fork point; both lists exclude it
        adopt.reverse();

        // Gather transactions before mutating anything
        let mut revoke_txs: Vec<Vec<Transaction>> = Vec::with_capacity(revoke.len());
        for block in &revoke {
            revoke_txs.push(self.storage.txs_by_block(&block.hash).await?);
        }
        let mut adopt_txs: Vec<Vec<Transaction>> = Vec::with_capacity(adopt.len());
        for block in &adopt {
            if block.hash == new_tip.hash {
                adopt_txs.push(new_tip_txs.to_vec());
            } else {
                adopt_txs.push(self.storage.txs_by_block(&block.hash).await?);
            }
        }

        // All writes, then all events
        for block in &revoke {
            let mut revoked = block.clone();
            revoked.active = false;
            self.storage.put_block(&revoked).await?;
        }
        for block in &adopt {
            let mut adopted = block.clone();
            adopted.active = true;
            if adopted.hash == new_tip.hash {
                self.persist(&adopted, new_tip_txs).await?;
            } else {
                self.storage.put_block(&adopted).await?;
            }
        }

        inner.tip = Some(StoredBlock {
            active: true,
            ..new_tip.clone()
        });

        for (block, txs) in revoke.iter().zip(&revoke_txs) {
            for tx in txs {
                let _ = self.events.send(ChainEvent::TxRevoke {
                    tx: tx.clone(),
                    block_hash: block.hash,
                });
            }
            let _ = self.events.send(ChainEvent::BlockRevoke {
                hash: block.hash,
                height: block.height,
            });
        }
        for (block, txs) in adopt.iter().zip(&adopt_txs) {
            self.emit_connect_events(block, txs);
        }

        Ok(revoke.len())
    }

    async fn stored_parent(&self, block: &StoredBlock) -> Result<StoredBlock> {
        self.storage
            .block_by_hash(&block.header.prev_block_hash)
            .await?
            .ok_or_else(|| {
                CoreError::Fatal(format!(
                    "parent {} of stored block {} is missing",
                    utils::hash_to_hex(&block.header.prev_block_hash),
                    utils::hash_to_hex(&block.hash)
                ))
            })
    }

    /// Persist a block record and its transactions with block references
    async fn persist(&self, record: &StoredBlock, transactions: &[Transaction]) -> Result<()> {
        self.storage.put_block(record).await?;
        for (index, tx) in transactions.iter().enumerate() {
            self.storage.put_tx(tx, &record.hash, index as u32).await?;
        }
        Ok(())
    }

    /// Post-persist events for a block joining the active chain:
    /// per-transaction `TxAdd`/`TxSave` in block order, then `BlockSave`
    fn emit_connect_events(&self, record: &StoredBlock, transactions: &[Transaction]) {
        for (index, tx) in transactions.iter().enumerate() {
            let _ = self.events.send(ChainEvent::TxAdd {
                tx: tx.clone(),
                block_hash: record.hash,
                index: index as u32,
            });
            let _ = self.events.send(ChainEvent::TxSave {
                tx_hash: tx.txid(),
                block_hash: record.hash,
            });
        }
        let _ = self.events.send(ChainEvent::BlockSave {
            hash: record.hash,
            height: record.height,
        });
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::pow::check_proof_of_work;
    use crate::storage::MemoryStorage;
    use crate::transaction::{Transaction, TxOutput};

    /// Easy target every constructed header can be walked onto
    const TEST_BITS: u32 = 0x2100_FFFF;

    fn test_genesis() -> Block {
        build_block(crate::ZERO_HASH, 0x11)
    }

    fn build_block(prev: Hash256, salt: u8) -> Block {
        let coinbase = Transaction::coinbase(
            vec![salt],
            TxOutput::new(50_0000_0000, vec![0x41, salt, 0xAC]),
        );
        let transactions = vec![coinbase];
        let merkle_root = Block::merkle_root(&transactions);
        let mut header = BlockHeader::new(1, prev, merkle_root, 1_300_000_000, TEST_BITS, 0);
        while !check_proof_of_work(&header.hash(), header.bits) {
            header.nonce += 1;
        }
        Block::new(header, transactions)
    }

    async fn chain_with_genesis() -> (Arc<BlockChain>, Block) {
        let genesis = test_genesis();
        let chain = Arc::new(BlockChain::new(
            Arc::new(MemoryStorage::new()),
            genesis.clone(),
        ));
        chain.init().await.unwrap();
        (chain, genesis)
    }

    #[tokio::test]
    async fn test_init_stores_genesis_and_tip() {
        let (chain, genesis) = chain_with_genesis().await;
        let tip = chain.tip().await.unwrap();
        assert_eq!(tip.hash, genesis.hash());
        assert_eq!(tip.height, 0);
        assert!(tip.active);

        // init is idempotent
        chain.init().await.unwrap();
        assert_eq!(chain.tip().await.unwrap().hash, genesis.hash());
    }

    #[tokio::test]
    async fn test_extend_assigns_height_and_work() {
        let (chain, genesis) = chain_with_genesis().await;
        let b1 = build_block(genesis.hash(), 0x22);

        let outcome = chain.add(b1.clone()).await.unwrap();
        assert!(matches!(outcome, AddOutcome::Extended { height: 1, .. }));

        let tip = chain.tip().await.unwrap();
        assert_eq!(tip.hash, b1.hash());
        let genesis_work = work_from_bits(genesis.header.bits);
        assert_eq!(tip.chain_work, genesis_work + work_from_bits(b1.header.bits));
    }

    #[tokio::test]
    async fn test_duplicate_add_is_noop() {
        let (chain, genesis) = chain_with_genesis().await;
        let b1 = build_block(genesis.hash(), 0x22);

        chain.add(b1.clone()).await.unwrap();
        let outcome = chain.add(b1).await.unwrap();
        assert!(matches!(outcome, AddOutcome::AlreadyKnown));
    }

    #[tokio::test]
    async fn test_unknown_parent_parks_orphan() {
        let (chain, genesis) = chain_with_genesis().await;
        let b1 = build_block(genesis.hash(), 0x22);
        let b2 = build_block(b1.hash(), 0x33);

        let outcome = chain.add(b2.clone()).await.unwrap();
        assert!(matches!(outcome, AddOutcome::PendingParent { .. }));
        assert_eq!(chain.tip().await.unwrap().height, 0);

        // Parent arrival drains the orphan
        chain.add(b1).await.unwrap();
        let tip = chain.tip().await.unwrap();
        assert_eq!(tip.hash, b2.hash());
        assert_eq!(tip.height, 2);
    }

    #[tokio::test]
    async fn test_equal_work_keeps_incumbent() {
        let (chain, genesis) = chain_with_genesis().await;
        let b1a = build_block(genesis.hash(), 0x22);
        let b1b = build_block(genesis.hash(), 0x44);

        chain.add(b1a.clone()).await.unwrap();
        let outcome = chain.add(b1b).await.unwrap();
        assert!(matches!(outcome, AddOutcome::SideChain { .. }));
        assert_eq!(chain.tip().await.unwrap().hash, b1a.hash());
    }

    #[tokio::test]
    async fn test_block_add_hook_can_abort() {
        let (chain, genesis) = chain_with_genesis().await;
        chain.on_block_add(Box::new(|_, record: &mut StoredBlock| {
            if record.height >= 1 {
                Err(CoreError::Fatal("listener vetoed".to_string()))
            } else {
                Ok(())
            }
        }));

        let b1 = build_block(genesis.hash(), 0x22);
        let hash = b1.hash();
        assert!(chain.add(b1).await.is_err());
        assert!(!chain.storage.knows_block(&hash).await.unwrap());
        assert_eq!(chain.tip().await.unwrap().height, 0);
    }

    #[tokio::test]
    async fn test_locator_resolution() {
        let (chain, genesis) = chain_with_genesis().await;
        let b1 = build_block(genesis.hash(), 0x22);
        let b2 = build_block(b1.hash(), 0x33);
        chain.add(b1.clone()).await.unwrap();
        chain.add(b2.clone()).await.unwrap();

        // First active hit wins
        let found = chain
            .block_by_locator(&[[9u8; 32], b1.hash(), b2.hash()])
            .await
            .unwrap();
        assert_eq!(found.hash, b1.hash());

        // Nothing known resolves to genesis
        let fallback = chain.block_by_locator(&[[9u8; 32]]).await.unwrap();
        assert_eq!(fallback.hash, genesis.hash());

        let after = chain.active_hashes_after(0, 500).await.unwrap();
        assert_eq!(after, vec![b1.hash(), b2.hash()]);
    }
}
