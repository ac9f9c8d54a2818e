//! Memory pool of unconfirmed transactions
//!
//! Every transaction hash maps to one of three states: *verifying* (a
//! verification is in flight and later submitters wait on its outcome),
//! *accepted* (validated, relayable), or *orphan* (an input references an
//! unknown source transaction). Concurrent submissions of the same hash
//! share exactly one verification; orphans are promoted automatically when
//! the transaction they wait for appears.

use crate::chain::ChainEvent;
use crate::script::{self, ScriptVerifier};
use crate::storage::Storage;
use crate::transaction::{Transaction, TxOutput};
use crate::{utils, CoreError, Hash256, OutPoint, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Pool transitions observable by downstream components
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A transaction entered the pool
    TxNotify { tx: Transaction },
    /// A transaction left the pool (confirmed, conflicted, or removed)
    TxCancel { tx: Transaction, tx_hash: Hash256 },
}

type VerifyOutcome = Result<Transaction>;

enum PoolEntry {
    Verifying {
        waiters: Vec<oneshot::Sender<VerifyOutcome>>,
        first_seen: DateTime<Utc>,
    },
    Accepted {
        tx: Transaction,
        first_seen: DateTime<Utc>,
        addresses: Vec<String>,
    },
    Orphan {
        tx: Transaction,
        missing: Hash256,
        first_seen: DateTime<Utc>,
    },
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<Hash256, PoolEntry>,
    /// Accepted spender of each outpoint, for conflict detection
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// Orphan hashes keyed by the source txid they wait for
    orphans_by_missing: HashMap<Hash256, Vec<Hash256>>,
    /// Accepted pool txids per derived address (live accounting)
    by_address: HashMap<String, Vec<Hash256>>,
    /// Removals requested while a verification was in flight
    pending_removal: HashSet<Hash256>,
}

pub struct TransactionStore {
    inner: RwLock<PoolInner>,
    storage: Arc<dyn Storage>,
    verifier: Arc<dyn ScriptVerifier>,
    live_accounting: bool,
    events: broadcast::Sender<PoolEvent>,
    address_events: Mutex<HashMap<String, broadcast::Sender<PoolEvent>>>,
}

impl TransactionStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        verifier: Arc<dyn ScriptVerifier>,
        live_accounting: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(PoolInner::default()),
            storage,
            verifier,
            live_accounting,
            events,
            address_events: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Subscribe to events for one address. Only populated when live
    /// accounting is configured.
    pub async fn subscribe_address(&self, address: &str) -> broadcast::Receiver<PoolEvent> {
        let mut map = self.address_events.lock().await;
        map.entry(address.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Submit a transaction.
    ///
    /// Returns `Ok(true)` when this call ran the verification and the
    /// transaction was accepted, `Ok(false)` when it was already accepted or
    /// this call joined another submission's in-flight verification. A
    /// failed verification reaches every waiting submitter as the same
    /// error; a missing source parks the transaction as an orphan and fails
    /// the submitters now, since the source may never arrive.
    pub async fn add(&self, tx: Transaction) -> Result<bool> {
        let hash = tx.txid();

        if tx.is_coinbase() {
            return Err(CoreError::InvalidStructure(
                "coinbase outside a block".to_string(),
            ));
        }
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(CoreError::InvalidStructure(
                "transaction without inputs or outputs".to_string(),
            ));
        }
        script::check_standard(&tx)?;

        enum Begin {
            Join(oneshot::Receiver<VerifyOutcome>),
            AlreadyAccepted,
            Fresh,
        }

        let begin = {
            let mut inner = self.inner.write().await;
            match inner.entries.get_mut(&hash) {
                Some(PoolEntry::Verifying { waiters, .. }) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Begin::Join(receiver)
                }
                Some(PoolEntry::Accepted { .. }) => Begin::AlreadyAccepted,
                Some(PoolEntry::Orphan { first_seen, .. }) => {
                    // A resubmitted orphan gets a fresh resolution attempt,
                    // keeping its original arrival time
                    let first_seen = *first_seen;
                    self.detach_orphan(&mut inner, &hash);
                    inner.entries.insert(
                        hash,
                        PoolEntry::Verifying {
                            waiters: Vec::new(),
                            first_seen,
                        },
                    );
                    Begin::Fresh
                }
                None => {
                    inner.entries.insert(
                        hash,
                        PoolEntry::Verifying {
                            waiters: Vec::new(),
                            first_seen: Utc::now(),
                        },
                    );
                    Begin::Fresh
                }
            }
        };

        match begin {
            Begin::AlreadyAccepted => Ok(false),
            Begin::Join(receiver) => {
                let outcome = receiver.await.map_err(|_| {
                    CoreError::Fatal("in-flight verification dropped its waiters".to_string())
                })?;
                outcome.map(|_| false)
            }
            Begin::Fresh => {
                self.verify_one(tx, hash).await?;
                self.promote_waiting(hash).await;
                Ok(true)
            }
        }
    }

    /// Look up an accepted transaction; joins an in-flight verification of
    /// the same hash rather than answering early.
    pub async fn get(&self, hash: &Hash256) -> Option<Transaction> {
        let receiver = {
            let mut inner = self.inner.write().await;
            match inner.entries.get_mut(hash) {
                Some(PoolEntry::Accepted { tx, .. }) => return Some(tx.clone()),
                Some(PoolEntry::Verifying { waiters, .. }) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Some(receiver)
                }
                _ => None,
            }
        };
        match receiver {
            Some(receiver) => receiver.await.ok().and_then(|outcome| outcome.ok()),
            None => None,
        }
    }

    /// True for any hash the pool has seen in any state; callers testing an
    /// inventory announcement want this superset.
    pub async fn is_known(&self, hash: &Hash256) -> bool {
        self.inner.read().await.entries.contains_key(hash)
    }

    /// When a transaction first entered the pool. Stamped as the entry is
    /// marked verifying, before any resolution work runs, and carried
    /// through the orphan and accepted states.
    pub async fn first_seen(&self, hash: &Hash256) -> Option<DateTime<Utc>> {
        match self.inner.read().await.entries.get(hash) {
            Some(PoolEntry::Verifying { first_seen, .. })
            | Some(PoolEntry::Accepted { first_seen, .. })
            | Some(PoolEntry::Orphan { first_seen, .. }) => Some(*first_seen),
            None => None,
        }
    }

    /// Number of accepted transactions
    pub async fn len(&self) -> usize {
        self.inner
            .read()
            .await
            .entries
            .values()
            .filter(|e| matches!(e, PoolEntry::Accepted { .. }))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hashes of all accepted transactions
    pub async fn accepted_hashes(&self) -> Vec<Hash256> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .filter_map(|(hash, entry)| {
                matches!(entry, PoolEntry::Accepted { .. }).then_some(*hash)
            })
            .collect()
    }

    /// Remove a transaction from the pool. An accepted transaction leaves
    /// immediately with a `TxCancel`; a verifying one is removed after its
    /// verification completes (only a successful one leaves an entry to
    /// remove); orphans are dropped quietly.
    pub async fn remove(&self, hash: &Hash256) -> Option<Transaction> {
        let dropped = {
            let mut inner = self.inner.write().await;
            match inner.entries.get(hash) {
                Some(PoolEntry::Verifying { .. }) => {
                    inner.pending_removal.insert(*hash);
                    None
                }
                Some(PoolEntry::Accepted { .. }) => {
                    let (tx, addresses) = match inner.entries.remove(hash) {
                        Some(PoolEntry::Accepted { tx, addresses, .. }) => (tx, addresses),
                        _ => unreachable!("entry checked above"),
                    };
                    for input in &tx.inputs {
                        if inner.by_outpoint.get(&input.prev_output) == Some(hash) {
                            inner.by_outpoint.remove(&input.prev_output);
                        }
                    }
                    for address in &addresses {
                        if let Some(hashes) = inner.by_address.get_mut(address) {
                            hashes.retain(|h| h != hash);
                            if hashes.is_empty() {
                                inner.by_address.remove(address);
                            }
                        }
                    }
                    Some((tx, addresses))
                }
                Some(PoolEntry::Orphan { .. }) => {
                    self.detach_orphan(&mut inner, hash);
                    inner.entries.remove(hash);
                    None
                }
                None => None,
            }
        };

        if let Some((tx, addresses)) = dropped {
            let event = PoolEvent::TxCancel {
                tx: tx.clone(),
                tx_hash: *hash,
            };
            let _ = self.events.send(event.clone());
            for address in &addresses {
                self.emit_address(address, event.clone()).await;
            }
            debug!("Removed transaction {} from pool", utils::hash_to_hex(hash));
            Some(tx)
        } else {
            None
        }
    }

    /// Invoked for every `TxAdd` the chain emits: the confirmed transaction
    /// leaves the pool, and any pool transaction spending one of the same
    /// outpoints is evicted together with its in-pool descendants.
    pub async fn handle_tx_add(&self, confirmed: &Transaction) {
        let hash = confirmed.txid();
        self.remove(&hash).await;

        let mut evict: Vec<Hash256> = {
            let inner = self.inner.read().await;
            confirmed
                .inputs
                .iter()
                .filter(|input| !input.is_coinbase())
                .filter_map(|input| inner.by_outpoint.get(&input.prev_output).copied())
                .filter(|spender| *spender != hash)
                .collect()
        };

        while let Some(conflict) = evict.pop() {
            let descendants: Vec<Hash256> = {
                let inner = self.inner.read().await;
                inner
                    .by_outpoint
                    .iter()
                    .filter(|(outpoint, _)| outpoint.txid == conflict)
                    .map(|(_, spender)| *spender)
                    .collect()
            };
            if self.remove(&conflict).await.is_some() {
                warn!(
                    "💥 Evicted pool transaction {} conflicting with confirmed {}",
                    utils::hash_to_hex(&conflict),
                    utils::hash_to_hex(&hash)
                );
            }
            evict.extend(descendants);
        }
    }

    /// Pump chain events into the pool until the chain shuts down.
    pub async fn run_chain_events(self: Arc<Self>, mut events: broadcast::Receiver<ChainEvent>) {
        loop {
            match events.recv().await {
                Ok(ChainEvent::TxAdd { tx, .. }) => self.handle_tx_add(&tx).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("pool fell {skipped} chain events behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Run one verification for `hash`, transition the entry, and settle all
    /// waiters with the shared outcome.
    async fn verify_one(&self, tx: Transaction, hash: Hash256) -> Result<()> {
        match self.verify(&tx).await {
            Ok(prev_outputs) => {
                let addresses = if self.live_accounting {
                    derive_addresses(&tx, &prev_outputs)
                } else {
                    Vec::new()
                };

                let (waiters, removal_pending) = {
                    let mut inner = self.inner.write().await;
                    let (waiters, first_seen) = take_verifying(&mut inner, &hash);
                    inner.entries.insert(
                        hash,
                        PoolEntry::Accepted {
                            tx: tx.clone(),
                            first_seen,
                            addresses: addresses.clone(),
                        },
                    );
                    for input in &tx.inputs {
                        inner.by_outpoint.insert(input.prev_output, hash);
                    }
                    for address in &addresses {
                        inner.by_address.entry(address.clone()).or_default().push(hash);
                    }
                    (waiters, inner.pending_removal.remove(&hash))
                };

                for waiter in waiters {
                    let _ = waiter.send(Ok(tx.clone()));
                }
                let event = PoolEvent::TxNotify { tx: tx.clone() };
                let _ = self.events.send(event.clone());
                for address in &addresses {
                    self.emit_address(address, event.clone()).await;
                }
                info!("💰 Accepted transaction {}", utils::hash_to_hex(&hash));

                if removal_pending {
                    self.remove(&hash).await;
                }
                Ok(())
            }
            Err(CoreError::MissingSource { missing }) => {
                let waiters = {
                    let mut inner = self.inner.write().await;
                    let (waiters, first_seen) = take_verifying(&mut inner, &hash);
                    inner.entries.insert(
                        hash,
                        PoolEntry::Orphan {
                            tx: tx.clone(),
                            missing,
                            first_seen,
                        },
                    );
                    inner
                        .orphans_by_missing
                        .entry(missing)
                        .or_default()
                        .push(hash);
                    inner.pending_removal.remove(&hash);
                    waiters
                };
                let err = CoreError::MissingSource { missing };
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                debug!(
                    "👻 Orphan transaction {} waits for {}",
                    utils::hash_to_hex(&hash),
                    utils::hash_to_hex(&missing)
                );
                Err(err)
            }
            Err(err) => {
                let waiters = {
                    let mut inner = self.inner.write().await;
                    let (waiters, _) = take_verifying(&mut inner, &hash);
                    inner.entries.remove(&hash);
                    inner.pending_removal.remove(&hash);
                    waiters
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                debug!(
                    "Rejected transaction {}: {}",
                    utils::hash_to_hex(&hash),
                    err
                );
                Err(err)
            }
        }
    }

    /// Resolve inputs against the pool and storage, check pool conflicts,
    /// and run script verification. Returns the resolved previous outputs.
    async fn verify(&self, tx: &Transaction) -> Result<Vec<TxOutput>> {
        let mut seen_outpoints = HashSet::new();
        for input in &tx.inputs {
            if !seen_outpoints.insert(input.prev_output) {
                return Err(CoreError::DoubleSpend);
            }
        }

        let mut prev_outputs = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            let outpoint = input.prev_output;
            let pooled = {
                let inner = self.inner.read().await;
                match inner.entries.get(&outpoint.txid) {
                    Some(PoolEntry::Accepted { tx, .. }) => Some(tx.clone()),
                    _ => None,
                }
            };
            let source = match pooled {
                Some(tx) => tx,
                None => self
                    .storage
                    .tx_by_hash(&outpoint.txid)
                    .await?
                    .map(|stored| stored.tx)
                    .ok_or(CoreError::MissingSource {
                        missing: outpoint.txid,
                    })?,
            };
            let prev_output = source
                .outputs
                .get(outpoint.vout as usize)
                .cloned()
                .ok_or_else(|| {
                    CoreError::InvalidStructure(format!(
                        "outpoint {}:{} out of range",
                        utils::hash_to_hex(&outpoint.txid),
                        outpoint.vout
                    ))
                })?;
            prev_outputs.push(prev_output);
        }

        {
            let inner = self.inner.read().await;
            for input in &tx.inputs {
                if inner.by_outpoint.contains_key(&input.prev_output) {
                    return Err(CoreError::DoubleSpend);
                }
            }
        }

        for (index, prev_output) in prev_outputs.iter().enumerate() {
            self.verifier.verify_input(tx, index, prev_output).await?;
        }

        Ok(prev_outputs)
    }

    /// Promote orphans unblocked by newly accepted transactions, chasing the
    /// chain of descendants to fixpoint.
    async fn promote_waiting(&self, root: Hash256) {
        let mut parents = vec![root];
        while let Some(parent) = parents.pop() {
            let waiting = {
                self.inner
                    .write()
                    .await
                    .orphans_by_missing
                    .remove(&parent)
                    .unwrap_or_default()
            };
            for orphan_hash in waiting {
                let orphan_tx = {
                    let mut inner = self.inner.write().await;
                    match inner.entries.get(&orphan_hash) {
                        Some(PoolEntry::Orphan { tx, first_seen, .. }) => {
                            let tx = tx.clone();
                            let first_seen = *first_seen;
                            inner.entries.insert(
                                orphan_hash,
                                PoolEntry::Verifying {
                                    waiters: Vec::new(),
                                    first_seen,
                                },
                            );
                            Some(tx)
                        }
                        _ => None,
                    }
                };
                if let Some(tx) = orphan_tx {
                    match self.verify_one(tx, orphan_hash).await {
                        Ok(()) => parents.push(orphan_hash),
                        Err(e) => debug!(
                            "orphan {} not promotable yet: {}",
                            utils::hash_to_hex(&orphan_hash),
                            e
                        ),
                    }
                }
            }
        }
    }

    /// Drop an orphan's reverse-index entry. The caller owns the entry map.
    fn detach_orphan(&self, inner: &mut PoolInner, hash: &Hash256) {
        if let Some(PoolEntry::Orphan { missing, .. }) = inner.entries.get(hash) {
            let missing = *missing;
            if let Some(waiting) = inner.orphans_by_missing.get_mut(&missing) {
                waiting.retain(|h| h != hash);
                if waiting.is_empty() {
                    inner.orphans_by_missing.remove(&missing);
                }
            }
        }
    }

    async fn emit_address(&self, address: &str, event: PoolEvent) {
        if let Some(sender) = self.address_events.lock().await.get(address) {
            let _ = sender.send(event);
        }
    }
}

/// Drain a verifying entry's waiter queue and read its arrival time
fn take_verifying(
    inner: &mut PoolInner,
    hash: &Hash256,
) -> (Vec<oneshot::Sender<VerifyOutcome>>, DateTime<Utc>) {
    match inner.entries.get_mut(hash) {
        Some(PoolEntry::Verifying {
            waiters,
            first_seen,
        }) => (std::mem::take(waiters), *first_seen),
        _ => (Vec::new(), Utc::now()),
    }
}

/// Addresses touched by a transaction: every recognized output template,
/// plus the owners of the outputs it spends.
fn derive_addresses(tx: &Transaction, prev_outputs: &[TxOutput]) -> Vec<String> {
    let mut addresses = Vec::new();
    let scripts = tx
        .outputs
        .iter()
        .map(|o| &o.script_pubkey)
        .chain(prev_outputs.iter().map(|o| &o.script_pubkey));
    for script_bytes in scripts {
        if let Some(address) = script::address_from_script(script_bytes) {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{p2pkh_script, StructuralVerifier};
    use crate::storage::MemoryStorage;
    use crate::transaction::TxInput;

    fn spend(source: &Transaction, vout: u32, value: i64, key: u8) -> Transaction {
        Transaction::new(
            1,
            vec![TxInput::new(
                OutPoint::new(source.txid(), vout),
                vec![0x01, key],
            )],
            vec![TxOutput::new(value, p2pkh_script(&[key; 20]))],
        )
    }

    async fn store_with_funding() -> (Arc<TransactionStore>, Transaction) {
        let storage = Arc::new(MemoryStorage::new());
        // A confirmed transaction whose outputs the pool can spend
        let funding = Transaction::new(
            1,
            vec![TxInput::new(OutPoint::new([0xAA; 32], 0), vec![0x01, 0x01])],
            vec![
                TxOutput::new(30_0000_0000, p2pkh_script(&[1u8; 20])),
                TxOutput::new(20_0000_0000, p2pkh_script(&[2u8; 20])),
            ],
        );
        storage.put_tx(&funding, &[0xBB; 32], 1).await.unwrap();
        let store = Arc::new(TransactionStore::new(
            storage,
            Arc::new(StructuralVerifier),
            true,
        ));
        (store, funding)
    }

    #[tokio::test]
    async fn test_accept_and_lookup() {
        let (store, funding) = store_with_funding().await;
        let tx = spend(&funding, 0, 29_0000_0000, 0x10);
        let hash = tx.txid();

        let mut events = store.subscribe();
        assert!(store.add(tx.clone()).await.unwrap());
        assert!(store.is_known(&hash).await);
        assert_eq!(store.get(&hash).await.unwrap().txid(), hash);
        assert_eq!(store.len().await, 1);
        assert!(store.first_seen(&hash).await.is_some());
        assert!(matches!(
            events.try_recv().unwrap(),
            PoolEvent::TxNotify { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_add_reports_not_new() {
        let (store, funding) = store_with_funding().await;
        let tx = spend(&funding, 0, 29_0000_0000, 0x10);

        assert!(store.add(tx.clone()).await.unwrap());
        assert!(!store.add(tx).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_share_one_verification() {
        let (store, funding) = store_with_funding().await;
        let tx = spend(&funding, 0, 29_0000_0000, 0x10);

        let mut events = store.subscribe();
        let a = tokio::spawn({
            let store = store.clone();
            let tx = tx.clone();
            async move { store.add(tx).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            let tx = tx.clone();
            async move { store.add(tx).await }
        });

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        // Exactly one ran the verification, both succeeded
        assert!(first ^ second);

        assert!(matches!(
            events.try_recv().unwrap(),
            PoolEvent::TxNotify { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_coinbase_and_nonstandard() {
        let (store, funding) = store_with_funding().await;

        let coinbase = Transaction::coinbase(vec![0x01], TxOutput::new(50, vec![0xAC]));
        assert!(matches!(
            store.add(coinbase).await,
            Err(CoreError::InvalidStructure(_))
        ));

        let mut nonstandard = spend(&funding, 0, 1000, 0x10);
        nonstandard.outputs[0].script_pubkey = vec![0x6a];
        assert!(matches!(
            store.add(nonstandard).await,
            Err(CoreError::NonStandard(_))
        ));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_orphan_then_promotion() {
        let (store, funding) = store_with_funding().await;
        let parent = spend(&funding, 1, 19_0000_0000, 0x20);
        let child = spend(&parent, 0, 18_0000_0000, 0x30);
        let parent_hash = parent.txid();
        let child_hash = child.txid();

        let mut events = store.subscribe();
        let err = store.add(child.clone()).await.unwrap_err();
        assert!(
            matches!(err, CoreError::MissingSource { missing } if missing == parent_hash)
        );
        assert!(store.is_known(&child_hash).await);
        assert!(store.get(&child_hash).await.is_none());
        let child_seen = store.first_seen(&child_hash).await.unwrap();

        // The parent's acceptance promotes the orphan
        assert!(store.add(parent).await.unwrap());
        assert!(store.get(&child_hash).await.is_some());
        assert_eq!(store.len().await, 2);

        // The child keeps its submission-time stamp across the orphan
        // detour; promotion does not re-stamp it
        assert_eq!(store.first_seen(&child_hash).await.unwrap(), child_seen);
        assert!(child_seen <= store.first_seen(&parent_hash).await.unwrap());

        // One notify per transaction, parent first
        let first = events.try_recv().unwrap();
        let second = events.try_recv().unwrap();
        match (first, second) {
            (PoolEvent::TxNotify { tx: a }, PoolEvent::TxNotify { tx: b }) => {
                assert_eq!(a.txid(), parent_hash);
                assert_eq!(b.txid(), child_hash);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pool_double_spend_rejected() {
        let (store, funding) = store_with_funding().await;
        let first = spend(&funding, 0, 29_0000_0000, 0x10);
        let conflicting = spend(&funding, 0, 28_0000_0000, 0x11);

        assert!(store.add(first).await.unwrap());
        assert!(matches!(
            store.add(conflicting).await,
            Err(CoreError::DoubleSpend)
        ));
    }

    #[tokio::test]
    async fn test_confirmation_evicts_tx_and_conflicts() {
        let (store, funding) = store_with_funding().await;
        let pooled = spend(&funding, 0, 29_0000_0000, 0x10);
        let dependent = spend(&pooled, 0, 28_0000_0000, 0x11);
        store.add(pooled.clone()).await.unwrap();
        store.add(dependent.clone()).await.unwrap();

        // A different transaction spending the same funding output confirms
        let confirmed = spend(&funding, 0, 27_0000_0000, 0x12);
        let mut events = store.subscribe();
        store.handle_tx_add(&confirmed).await;

        // The conflicting pool tx and its descendant are both gone
        assert!(!store.is_known(&pooled.txid()).await);
        assert!(!store.is_known(&dependent.txid()).await);
        assert_eq!(store.len().await, 0);

        let cancelled: Vec<Hash256> = std::iter::from_fn(|| match events.try_recv() {
            Ok(PoolEvent::TxCancel { tx_hash, .. }) => Some(tx_hash),
            _ => None,
        })
        .collect();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&pooled.txid()));
        assert!(cancelled.contains(&dependent.txid()));
    }

    #[tokio::test]
    async fn test_confirmed_pool_tx_leaves_with_cancel() {
        let (store, funding) = store_with_funding().await;
        let tx = spend(&funding, 0, 29_0000_0000, 0x10);
        store.add(tx.clone()).await.unwrap();

        let mut events = store.subscribe();
        store.handle_tx_add(&tx).await;
        assert!(!store.is_known(&tx.txid()).await);
        assert!(matches!(
            events.try_recv().unwrap(),
            PoolEvent::TxCancel { tx_hash, .. } if tx_hash == tx.txid()
        ));
    }

    #[tokio::test]
    async fn test_address_events_for_live_accounting() {
        let (store, funding) = store_with_funding().await;
        let tx = spend(&funding, 0, 29_0000_0000, 0x10);
        let recipient = script::address_from_script(&tx.outputs[0].script_pubkey).unwrap();

        let mut addr_events = store.subscribe_address(&recipient).await;
        store.add(tx.clone()).await.unwrap();
        assert!(matches!(
            addr_events.try_recv().unwrap(),
            PoolEvent::TxNotify { .. }
        ));

        store.remove(&tx.txid()).await;
        assert!(matches!(
            addr_events.try_recv().unwrap(),
            PoolEvent::TxCancel { .. }
        ));
    }
}
