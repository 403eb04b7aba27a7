//! Per-connection status cache.
//!
//! Every map sits behind its own lock; operations touch one map at a time,
//! so concurrent wallets never contend on a global lock. Ordering across
//! maps is the reconciler's job.

use std::collections::{HashMap, HashSet};

use bitcoin::{block, Txid};
use parking_lot::RwLock;

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::wallet::DerivationNode;
use crate::sync::types::{BlockTransaction, StatusString};

#[derive(Debug, Default)]
pub struct StatusCache {
    /// Status history per subscribed hash for this session, latest last.
    subscribed: RwLock<HashMap<ScriptHash, Vec<Option<StatusString>>>>,

    /// Status at the time history was last fetched (or locally computed).
    retrieved: RwLock<HashMap<ScriptHash, Option<StatusString>>>,

    /// Deeply confirmed transactions, shared across wallets.
    transactions: RwLock<HashMap<Txid, BlockTransaction>>,

    headers: RwLock<HashMap<u32, block::Header>>,

    /// Hashes whose local history contains unordered same-height entries.
    ambiguous: RwLock<HashSet<ScriptHash>>,

    /// Transactions broadcast through this engine, until confirmed.
    broadcasted: RwLock<HashMap<Txid, BlockTransaction>>,

    /// Decoy subscriptions with the height they were made at.
    decoys: RwLock<HashMap<ScriptHash, u32>>,

    /// Expected echo status for hashes touched by a rebroadcast.
    rebroadcast_echo: RwLock<HashMap<ScriptHash, StatusString>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops everything. Used when switching to a different server.
    pub fn clear(&self) {
        self.subscribed.write().clear();
        self.retrieved.write().clear();
        self.transactions.write().clear();
        self.headers.write().clear();
        self.ambiguous.write().clear();
        self.broadcasted.write().clear();
        self.decoys.write().clear();
        self.rebroadcast_echo.write().clear();
    }

    /// Forgets subscriptions only. Used when a fresh session starts on the same server.
    pub fn clear_subscriptions(&self) {
        self.subscribed.write().clear();
    }

    // =====================================================================
    // Subscriptions
    // =====================================================================

    pub fn is_subscribed(&self, hash: &ScriptHash) -> bool {
        self.subscribed.read().contains_key(hash)
    }

    /// Latest status reported for `hash` this session.
    pub fn subscribed_status(&self, hash: &ScriptHash) -> Option<StatusString> {
        self.subscribed
            .read()
            .get(hash)
            .and_then(|history| history.last().cloned().flatten())
    }

    pub fn subscription_history(&self, hash: &ScriptHash) -> Vec<Option<StatusString>> {
        self.subscribed.read().get(hash).cloned().unwrap_or_default()
    }

    pub fn record_subscribed(&self, hash: ScriptHash, status: Option<StatusString>) {
        self.subscribed.write().entry(hash).or_default().push(status);
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.read().len()
    }

    // =====================================================================
    // Retrieved statuses
    // =====================================================================

    pub fn retrieved_status(&self, hash: &ScriptHash) -> Option<StatusString> {
        self.retrieved.read().get(hash).cloned().flatten()
    }

    pub fn set_retrieved(&self, hash: ScriptHash, status: Option<StatusString>) {
        self.retrieved.write().insert(hash, status);
    }

    /// Records `status` unless a non-empty status is already known.
    pub fn seed_retrieved(&self, hash: ScriptHash, status: Option<StatusString>) {
        let mut retrieved = self.retrieved.write();
        let entry = retrieved.entry(hash).or_insert(None);
        if entry.is_none() {
            *entry = status;
        }
    }

    pub fn forget_retrieved(&self, hash: &ScriptHash) {
        self.retrieved.write().remove(hash);
        self.ambiguous.write().remove(hash);
    }

    // =====================================================================
    // Local status computation
    // =====================================================================

    /// Status computed from `node`'s known outputs. Records the hash as
    /// ambiguous when same-height ordering could not be established.
    pub fn local_status(&self, node: &DerivationNode) -> Option<StatusString> {
        let history = node.local_history();
        if history.ambiguous {
            self.mark_ambiguous(node.script_hash());
        }
        history.status()
    }

    pub fn mark_ambiguous(&self, hash: ScriptHash) {
        self.ambiguous.write().insert(hash);
    }

    pub fn is_ambiguous(&self, hash: &ScriptHash) -> bool {
        self.ambiguous.read().contains(hash)
    }

    // =====================================================================
    // Transactions and headers
    // =====================================================================

    pub fn cached_transaction(&self, txid: &Txid) -> Option<BlockTransaction> {
        self.transactions.read().get(txid).cloned()
    }

    pub fn cache_transaction(&self, btx: BlockTransaction) {
        self.transactions.write().insert(btx.txid, btx);
    }

    pub fn header(&self, height: u32) -> Option<block::Header> {
        self.headers.read().get(&height).copied()
    }

    pub fn insert_header(&self, height: u32, header: block::Header) {
        self.headers.write().insert(height, header);
    }

    // =====================================================================
    // Broadcast tracking
    // =====================================================================

    pub fn record_broadcast(&self, btx: BlockTransaction) {
        self.broadcasted.write().insert(btx.txid, btx);
    }

    pub fn broadcast(&self, txid: &Txid) -> Option<BlockTransaction> {
        self.broadcasted.read().get(txid).cloned()
    }

    pub fn broadcasts(&self) -> Vec<BlockTransaction> {
        self.broadcasted.read().values().cloned().collect()
    }

    pub fn remove_broadcasts<'a>(&self, txids: impl IntoIterator<Item = &'a Txid>) {
        let mut broadcasted = self.broadcasted.write();
        for txid in txids {
            broadcasted.remove(txid);
        }
    }

    // =====================================================================
    // Decoys
    // =====================================================================

    pub fn record_decoy(&self, hash: ScriptHash, height: u32) {
        self.decoys.write().insert(hash, height);
    }

    pub fn decoys(&self) -> Vec<(ScriptHash, u32)> {
        self.decoys.read().iter().map(|(h, height)| (*h, *height)).collect()
    }

    pub fn remove_decoys(&self, hashes: &[ScriptHash]) {
        let mut decoys = self.decoys.write();
        let mut echo = self.rebroadcast_echo.write();
        for hash in hashes {
            decoys.remove(hash);
            echo.remove(hash);
        }
    }

    pub fn expect_rebroadcast_echo(&self, hash: ScriptHash, status: StatusString) {
        self.rebroadcast_echo.write().insert(hash, status);
    }

    pub fn take_rebroadcast_echo(&self, hash: &ScriptHash) -> Option<StatusString> {
        self.rebroadcast_echo.write().remove(hash)
    }
}
