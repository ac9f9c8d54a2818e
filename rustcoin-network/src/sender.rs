//! Transaction rebroadcaster
//!
//! Accepted-but-unconfirmed transactions are re-announced on an interval
//! until something removes them: confirmation, conflict eviction, or an
//! explicit unregister. Peers that missed the first inv pick the
//! transaction up on a later round.

use crate::protocol::InvItem;
use crate::PeerManager;
use rustcoin_core::transaction::Transaction;
use rustcoin_core::{utils, Hash256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default re-announcement interval
const REBROADCAST_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
struct PendingTx {
    tx: Transaction,
    announcements: u32,
}

/// Re-announces pooled transactions until they confirm
pub struct TransactionSender {
    pending: RwLock<HashMap<Hash256, PendingTx>>,
    interval: Duration,
}

impl Default for TransactionSender {
    fn default() -> Self {
        Self::new(REBROADCAST_INTERVAL)
    }
}

impl TransactionSender {
    pub fn new(interval: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Track a transaction for periodic re-announcement
    pub async fn register(&self, tx: Transaction) {
        let hash = tx.txid();
        self.pending.write().await.insert(
            hash,
            PendingTx {
                tx,
                announcements: 1,
            },
        );
        debug!(
            "rebroadcaster tracking transaction {}",
            utils::hash_to_hex(&hash)
        );
    }

    /// Stop tracking a transaction (confirmed or cancelled)
    pub async fn unregister(&self, hash: &Hash256) -> bool {
        self.pending.write().await.remove(hash).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn pending_transaction(&self, hash: &Hash256) -> Option<Transaction> {
        self.pending
            .read()
            .await
            .get(hash)
            .map(|pending| pending.tx.clone())
    }

    /// Announce everything still pending to every active connection.
    pub async fn rebroadcast_round(&self, peers: &PeerManager) -> usize {
        let items: Vec<InvItem> = {
            let mut pending = self.pending.write().await;
            for entry in pending.values_mut() {
                entry.announcements += 1;
            }
            pending.keys().map(|hash| InvItem::tx(*hash)).collect()
        };
        if items.is_empty() {
            return 0;
        }

        let reached = peers
            .broadcast(crate::protocol::Message::Inv(items.clone()))
            .await;
        info!(
            "🔁 Re-announced {} pending transactions to {} peers",
            items.len(),
            reached
        );
        reached
    }

    /// Run the rebroadcast loop until the peer manager goes away.
    pub fn start(self: Arc<Self>, peers: Arc<PeerManager>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so registration wins
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.rebroadcast_round(&peers).await;
            }
        });
    }
}
