//! Node state machine and inbound message dispatch
//!
//! The node sequences startup — chain initialization, then network connect,
//! then block download — and routes every parsed peer message to the chain
//! or the pool. States only move forward; a node that has left `Init` can
//! never re-enter it.

use crate::config::NodeConfig;
use crate::rpc;
use anyhow::{bail, Context, Result};
use rustcoin_core::chain::{AddOutcome, BlockChain};
use rustcoin_core::mempool::{PoolEvent, TransactionStore};
use rustcoin_core::transaction::Transaction;
use rustcoin_core::{utils, CoreError, Hash256};
use rustcoin_network::peer::Connection;
use rustcoin_network::protocol::{InvItem, InvType, Message, GETBLOCKS_LIMIT};
use rustcoin_network::sender::TransactionSender;
use rustcoin_network::{NetEvent, PeerManager};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Upper bound on tracked outstanding block requests
const MAX_TRACKED_BLOCK_REQUESTS: usize = 50_000;

/// Node lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Init,
    NetConnect,
    BlockDownload,
    Active,
}

pub struct Node {
    config: NodeConfig,
    chain: Arc<BlockChain>,
    pool: Arc<TransactionStore>,
    peers: Arc<PeerManager>,
    sender: Arc<TransactionSender>,
    state: RwLock<NodeState>,
    /// Block hashes with a getdata in flight. A delivered block is claimed
    /// under the hash it was requested by; clearing the entry requires the
    /// recomputed hash to match that claim.
    requested_blocks: Mutex<HashSet<Hash256>>,
    rpc_server: std::sync::Mutex<Option<jsonrpc_http_server::Server>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        chain: Arc<BlockChain>,
        pool: Arc<TransactionStore>,
        peers: Arc<PeerManager>,
        sender: Arc<TransactionSender>,
    ) -> Self {
        Self {
            config,
            chain,
            pool,
            peers,
            sender,
            state: RwLock::new(NodeState::Uninitialized),
            requested_blocks: Mutex::new(HashSet::new()),
            rpc_server: std::sync::Mutex::new(None),
        }
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    /// True once the network side is enabled
    pub async fn running(&self) -> bool {
        matches!(
            self.state().await,
            NodeState::NetConnect | NodeState::BlockDownload | NodeState::Active
        )
    }

    pub fn chain(&self) -> &Arc<BlockChain> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TransactionStore> {
        &self.pool
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    /// Drive the node through its lifecycle and then process peer messages
    /// until the event stream ends.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != NodeState::Uninitialized {
                bail!("node already started; re-entry into init is forbidden");
            }
            *state = NodeState::Init;
        }

        info!("🚀 Node entering init");
        self.chain.init().await.context("chain initialization")?;

        *self.state.write().await = NodeState::NetConnect;
        info!("📡 Node entering netConnect");

        // Chain confirmations drive pool eviction
        tokio::spawn(Arc::clone(&self.pool).run_chain_events(self.chain.subscribe()));
        // Pool cancellations release the rebroadcaster
        tokio::spawn(Self::run_pool_events(
            self.pool.subscribe(),
            Arc::clone(&self.sender),
        ));
        Arc::clone(&self.sender).start(Arc::clone(&self.peers));

        if self.config.rpc.enabled {
            let server = rpc::start(&self.config.rpc, Arc::clone(self))
                .context("starting JSON-RPC server")?;
            *self.rpc_server.lock().unwrap_or_else(|p| p.into_inner()) = Some(server);
        }

        let mut events = self
            .peers
            .take_events()
            .await
            .context("peer event stream already taken")?;
        self.peers.start().await?;

        while let Some(event) = events.recv().await {
            match event {
                NetEvent::NetConnected => {
                    *self.state.write().await = NodeState::BlockDownload;
                    info!("⬇️  First peer ready; entering blockDownload");
                    self.request_blocks().await;
                }
                NetEvent::Message { conn, message } => {
                    self.handle_message(conn, message).await;
                }
                NetEvent::Disconnected { conn_id, reason } => {
                    debug!("peer {} disconnected: {}", conn_id, reason);
                }
            }
        }

        info!("peer event stream ended; node stopping");
        Ok(())
    }

    /// Ask every peer for the blocks after our best chain.
    async fn request_blocks(&self) {
        let locator = match self.chain.build_locator().await {
            Ok(locator) => locator,
            Err(e) => {
                warn!("could not build block locator: {}", e);
                return;
            }
        };
        for conn in self.peers.active_connections().await {
            if let Err(e) = conn.send_getblocks(locator.clone()) {
                debug!("getblocks to {} failed: {}", conn.id, e);
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, conn: Arc<Connection>, message: Message) {
        match message {
            Message::Inv(items) => self.handle_inv(conn, items).await,
            Message::Block(block) => self.handle_block(block).await,
            Message::Tx(tx) => self.handle_tx(tx).await,
            Message::GetData(items) => self.handle_getdata(conn, items).await,
            Message::GetBlocks { locator, .. } => self.handle_getblocks(conn, locator).await,
            other => debug!("ignoring '{}' message", other.command()),
        }
    }

    /// Partition an inventory announcement by type and fetch everything we
    /// do not have, preserving the announcement order.
    async fn handle_inv(&self, conn: Arc<Connection>, items: Vec<InvItem>) {
        let mut unknown = Vec::new();
        for item in items {
            let known = match item.inv_type {
                InvType::Tx => self.pool.is_known(&item.hash).await,
                InvType::Block => match self.chain.block_by_hash(&item.hash).await {
                    Ok(found) => found.is_some(),
                    Err(e) => {
                        warn!("storage lookup during inv failed: {}", e);
                        true
                    }
                },
            };
            if !known {
                unknown.push(item);
            }
        }

        if !unknown.is_empty() {
            self.note_block_requests(&unknown).await;
            debug!(
                "requesting {} unknown inventory items from {}",
                unknown.len(),
                conn.id
            );
            let _ = conn.send_getdata(unknown);
        }
    }

    /// Record the block hashes a getdata is about to claim
    async fn note_block_requests(&self, items: &[InvItem]) {
        let mut requested = self.requested_blocks.lock().await;
        for item in items {
            if item.inv_type == InvType::Block && requested.len() < MAX_TRACKED_BLOCK_REQUESTS {
                requested.insert(item.hash);
            }
        }
    }

    /// Hash-integrity check, then chain admission. A block message carries
    /// no hash of its own; the claimed hash is the inventory hash the block
    /// was requested by, so a delivery whose recomputed hash matches no
    /// pending request either lied about its content or arrived unsolicited
    /// (a push of a fresh block). Only a matching delivery clears its
    /// request; a mismatched one leaves the claim pending and the block is
    /// judged purely by its recomputed identity.
    async fn handle_block(&self, block: rustcoin_core::block::Block) {
        let hash = block.hash();
        if !self.requested_blocks.lock().await.remove(&hash) {
            debug!(
                "block {} matches no pending request; treating as unsolicited",
                utils::hash_to_hex(&hash)
            );
        }
        match self.chain.add(block).await {
            Ok(AddOutcome::PendingParent { missing }) => {
                debug!(
                    "block {} parked; parent {} unknown",
                    utils::hash_to_hex(&hash),
                    utils::hash_to_hex(&missing)
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!("rejected block {}: {}", utils::hash_to_hex(&hash), e);
            }
        }
    }

    async fn handle_tx(&self, tx: Transaction) {
        let hash = tx.txid();
        if self.pool.is_known(&hash).await {
            return;
        }
        match self.pool.add(tx).await {
            Ok(_) => {}
            Err(CoreError::MissingSource { missing }) => {
                info!(
                    "transaction {} orphaned; missing source {}",
                    utils::hash_to_hex(&hash),
                    utils::hash_to_hex(&missing)
                );
            }
            Err(e) => {
                warn!("rejected transaction {}: {}", utils::hash_to_hex(&hash), e);
            }
        }
    }

    async fn handle_getdata(&self, conn: Arc<Connection>, items: Vec<InvItem>) {
        for item in items {
            match item.inv_type {
                InvType::Tx => {
                    if let Some(tx) = self.pool.get(&item.hash).await {
                        let _ = conn.send_tx(tx);
                    }
                }
                InvType::Block => {
                    // Serving blocks from storage is not implemented yet
                    debug!(
                        "getdata for block {} not served",
                        utils::hash_to_hex(&item.hash)
                    );
                }
            }
        }
    }

    /// Answer a locator with an inv of the next active-chain blocks.
    async fn handle_getblocks(&self, conn: Arc<Connection>, locator: Vec<Hash256>) {
        let fork = match self.chain.block_by_locator(&locator).await {
            Ok(fork) => fork,
            Err(e) => {
                warn!("locator resolution failed: {}", e);
                return;
            }
        };
        match self
            .chain
            .active_hashes_after(fork.height, GETBLOCKS_LIMIT)
            .await
        {
            Ok(hashes) if !hashes.is_empty() => {
                let items: Vec<InvItem> = hashes.into_iter().map(InvItem::block).collect();
                let _ = conn.send_inv(items);
            }
            Ok(_) => {}
            Err(e) => warn!("active chain walk failed: {}", e),
        }
    }

    /// Fan an inventory announcement to every active connection.
    pub async fn send_inv(&self, items: Vec<InvItem>) -> usize {
        self.peers.broadcast(Message::Inv(items)).await
    }

    /// Submit a local transaction: pool admission, rebroadcast registration,
    /// then an inv to the network.
    pub async fn send_tx(&self, tx: Transaction) -> std::result::Result<Hash256, CoreError> {
        let hash = tx.txid();
        self.pool.add(tx.clone()).await?;
        self.sender.register(tx).await;
        let reached = self.send_inv(vec![InvItem::tx(hash)]).await;
        info!(
            "📤 Announced local transaction {} to {} peers",
            utils::hash_to_hex(&hash),
            reached
        );
        Ok(hash)
    }

    async fn run_pool_events(
        mut events: broadcast::Receiver<PoolEvent>,
        sender: Arc<TransactionSender>,
    ) {
        loop {
            match events.recv().await {
                Ok(PoolEvent::TxCancel { tx_hash, .. }) => {
                    sender.unregister(&tx_hash).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("rebroadcaster fell {skipped} pool events behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustcoin_core::block::{Block, BlockHeader};
    use rustcoin_core::genesis::mainnet_genesis;
    use rustcoin_core::pow::check_proof_of_work;
    use rustcoin_core::script::StructuralVerifier;
    use rustcoin_core::storage::MemoryStorage;
    use rustcoin_core::transaction::TxOutput;
    use rustcoin_core::ZERO_HASH;
    use rustcoin_network::NetworkConfig;

    fn easy_block(prev: Hash256, salt: u8) -> Block {
        let coinbase = Transaction::coinbase(
            vec![salt],
            TxOutput::new(50_0000_0000, vec![0x41, salt, 0xAC]),
        );
        let transactions = vec![coinbase];
        let merkle_root = Block::merkle_root(&transactions);
        let mut header = BlockHeader::new(1, prev, merkle_root, 1_300_000_000, 0x2100_FFFF, 0);
        while !check_proof_of_work(&header.hash(), header.bits) {
            header.nonce += 1;
        }
        Block::new(header, transactions)
    }

    fn test_node_with(genesis: Block) -> Arc<Node> {
        let storage = Arc::new(MemoryStorage::new());
        let chain = Arc::new(BlockChain::new(storage.clone(), genesis));
        let pool = Arc::new(TransactionStore::new(
            storage,
            Arc::new(StructuralVerifier),
            false,
        ));
        let peers = Arc::new(PeerManager::new(NetworkConfig::default()));
        let sender = Arc::new(TransactionSender::default());
        let mut config = NodeConfig::default();
        config.rpc.enabled = false;
        Arc::new(Node::new(config, chain, pool, peers, sender))
    }

    fn test_node() -> Arc<Node> {
        test_node_with(mainnet_genesis())
    }

    #[tokio::test]
    async fn test_initial_state() {
        let node = test_node();
        assert_eq!(node.state().await, NodeState::Uninitialized);
        assert!(!node.running().await);
    }

    #[tokio::test]
    async fn test_start_forbids_reentry() {
        let node = test_node();
        // Claim the event stream so the first start stops at netConnect
        // instead of looping over peer events
        drop(node.peers().take_events().await.unwrap());
        assert!(node.start().await.is_err());
        assert_eq!(node.state().await, NodeState::NetConnect);

        // However far the first call got, a second start must refuse
        let err = node.start().await.unwrap_err();
        assert!(err.to_string().contains("re-entry"));
    }

    #[tokio::test]
    async fn test_block_delivery_must_match_its_request() {
        let genesis = easy_block(ZERO_HASH, 0xA0);
        let node = test_node_with(genesis.clone());
        node.chain().init().await.unwrap();

        let b1 = easy_block(genesis.hash(), 0xA1);
        node.note_block_requests(&[InvItem::block(b1.hash())]).await;
        assert_eq!(node.requested_blocks.lock().await.len(), 1);

        // A delivery whose content matches a different hash leaves the
        // claim pending
        let imposter = easy_block([0xEE; 32], 0xB1);
        node.handle_block(imposter).await;
        assert!(node.requested_blocks.lock().await.contains(&b1.hash()));

        // The matching delivery clears it and connects
        node.handle_block(b1.clone()).await;
        assert!(node.requested_blocks.lock().await.is_empty());
        assert_eq!(node.chain().tip().await.unwrap().hash, b1.hash());
    }
}
