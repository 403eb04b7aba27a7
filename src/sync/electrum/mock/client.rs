use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bitcoin::{block, Transaction, Txid};
use parking_lot::{Mutex, MutexGuard};

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::status::status_of;
use crate::sync::electrum::api::{ElectrumTransport, UNFETCHABLE_PLACEHOLDER};
use crate::sync::engine::capability::CapabilityProfile;
use crate::sync::error::TransportError;
use crate::sync::testutil::{header_at, raw_hex};
use crate::sync::types::{
    BlockSummary, HeaderTip, Notification, ServerVersion, StatusString, TxReference,
};

/// In-memory Electrum server for tests.
///
/// Holds a tiny chain: transactions added with [`confirm`](Self::confirm) or
/// [`add_mempool`](Self::add_mempool) show up in the history of every script
/// they pay to or spend from, and statuses are computed the way a real
/// server does.
pub struct MockElectrumTransport {
    state: Mutex<MockState>,
}

pub struct MockState {
    pub server_version: ServerVersion,
    pub banner: String,
    pub tip_height: u32,
    pub histories: HashMap<ScriptHash, Vec<TxReference>>,
    pub transactions: HashMap<Txid, Transaction>,
    pub unfetchable: HashSet<Txid>,
    pub headers: BTreeMap<u32, block::Header>,
    pub fee_estimates: BTreeMap<u16, f64>,
    pub histogram: Vec<(f64, u64)>,
    pub relay_fee: Option<f64>,
    pub block_stats: BTreeMap<u32, BlockSummary>,
    /// Returned instead of the real txid when set.
    pub broadcast_reply: Option<String>,
    pub broadcasts: Vec<String>,
    /// Extra transaction sent back with every `transactions` call.
    pub unrequested: Option<Transaction>,
    /// Txid answered with the placeholder on every `transactions` call.
    pub unrequested_placeholder: Option<Txid>,
    pub failing: HashSet<&'static str>,
    /// `(method, number of keys)` for every call.
    pub calls: Vec<(&'static str, usize)>,
    pub subscribed: Vec<ScriptHash>,
    pub unsubscribed: Vec<ScriptHash>,
    pub notifications: VecDeque<Notification>,
    pub profile: Option<CapabilityProfile>,
}

impl MockElectrumTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                server_version: ServerVersion {
                    server_software: "Fulcrum 1.9.1".into(),
                    protocol_version: "1.4.2".into(),
                },
                banner: "Welcome to the mock".into(),
                tip_height: 100,
                histories: HashMap::new(),
                transactions: HashMap::new(),
                unfetchable: HashSet::new(),
                headers: BTreeMap::new(),
                fee_estimates: BTreeMap::new(),
                histogram: Vec::new(),
                relay_fee: Some(0.00001),
                block_stats: BTreeMap::new(),
                broadcast_reply: None,
                broadcasts: Vec::new(),
                unrequested: None,
                unrequested_placeholder: None,
                failing: HashSet::new(),
                calls: Vec::new(),
                subscribed: Vec::new(),
                unsubscribed: Vec::new(),
                notifications: VecDeque::new(),
                profile: None,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    pub fn set_tip(&self, height: u32) {
        let mut s = self.state.lock();
        s.tip_height = height;
        s.headers.entry(height).or_insert_with(|| header_at(height));
    }

    /// Adds `tx` to the chain at `height` (> 0).
    pub fn confirm(&self, tx: &Transaction, height: u32) {
        self.state.lock().headers.entry(height).or_insert_with(|| header_at(height));
        self.insert(tx, height as i32, None);
    }

    /// Adds `tx` to the mempool with the given height (0 or -1) and fee.
    pub fn add_mempool(&self, tx: &Transaction, height: i32, fee: u64) {
        self.insert(tx, height, Some(fee));
    }

    /// Removes `txid` from every history, as after a replacement.
    pub fn evict(&self, txid: &Txid) {
        let mut s = self.state.lock();
        s.transactions.remove(txid);
        for history in s.histories.values_mut() {
            history.retain(|r| r.txid != *txid);
        }
        s.histories.retain(|_, h| !h.is_empty());
    }

    fn insert(&self, tx: &Transaction, height: i32, fee: Option<u64>) {
        let mut s = self.state.lock();
        let txid = tx.compute_txid();
        let reference = TxReference::new(txid, height).with_fee(fee);

        let mut touched: Vec<ScriptHash> = tx
            .output
            .iter()
            .map(|o| ScriptHash::from_script(&o.script_pubkey))
            .collect();
        for input in &tx.input {
            if let Some(prev) = s
                .transactions
                .get(&input.previous_output.txid)
                .and_then(|p| p.output.get(input.previous_output.vout as usize))
            {
                touched.push(ScriptHash::from_script(&prev.script_pubkey));
            }
        }

        for hash in touched {
            let history = s.histories.entry(hash).or_default();
            history.retain(|r| r.txid != txid);
            history.push(reference);
        }
        s.transactions.insert(txid, tx.clone());
    }

    pub fn history(&self, hash: &ScriptHash) -> Vec<TxReference> {
        let mut history = self.state.lock().histories.get(hash).cloned().unwrap_or_default();
        history.sort_by_key(|r| r.comparison_height());
        history
    }

    pub fn status(&self, hash: &ScriptHash) -> Option<StatusString> {
        status_of(&self.history(hash))
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|(m, _)| *m == method).count()
    }

    pub fn keys_requested(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn fail(&self, method: &'static str) {
        self.state.lock().failing.insert(method);
    }

    pub fn push_notification(&self, n: Notification) {
        self.state.lock().notifications.push_back(n);
    }

    fn enter(&self, method: &'static str, keys: usize) -> Result<MutexGuard<'_, MockState>, TransportError> {
        let mut s = self.state.lock();
        s.calls.push((method, keys));
        if s.failing.contains(method) {
            return Err(TransportError::Rpc {
                method: method.to_string(),
                message: "mock failure".into(),
            });
        }
        Ok(s)
    }
}

impl ElectrumTransport for MockElectrumTransport {
    fn configure(&self, profile: &CapabilityProfile) {
        self.state.lock().profile = Some(*profile);
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.enter("server.ping", 0).map(|_| ())
    }

    fn server_version(&self, _client_name: &str, _versions: &[String]) -> Result<ServerVersion, TransportError> {
        Ok(self.enter("server.version", 0)?.server_version.clone())
    }

    fn banner(&self) -> Result<String, TransportError> {
        Ok(self.enter("server.banner", 0)?.banner.clone())
    }

    fn subscribe_block_headers(&self) -> Result<HeaderTip, TransportError> {
        let mut s = self.enter("blockchain.headers.subscribe", 0)?;
        let height = s.tip_height;
        let header = *s.headers.entry(height).or_insert_with(|| header_at(height));
        Ok(HeaderTip { height, header })
    }

    fn subscribe_script_hashes(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Option<StatusString>>, TransportError> {
        self.enter("blockchain.scripthash.subscribe", hashes.len())?
            .subscribed
            .extend_from_slice(hashes);
        Ok(hashes.iter().map(|h| (*h, self.status(h))).collect())
    }

    fn unsubscribe_script_hashes(&self, hashes: &[ScriptHash]) -> Result<(), TransportError> {
        self.enter("blockchain.scripthash.unsubscribe", hashes.len())?
            .unsubscribed
            .extend_from_slice(hashes);
        Ok(())
    }

    fn script_hash_history(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Vec<TxReference>>, TransportError> {
        drop(self.enter("blockchain.scripthash.get_history", hashes.len())?);
        Ok(hashes.iter().map(|h| (*h, self.history(h))).collect())
    }

    fn transactions(&self, txids: &[Txid]) -> Result<BTreeMap<Txid, String>, TransportError> {
        let s = self.enter("blockchain.transaction.get", txids.len())?;
        let mut out = BTreeMap::new();
        for txid in txids {
            if s.unfetchable.contains(txid) {
                out.insert(*txid, UNFETCHABLE_PLACEHOLDER.to_string());
            } else if let Some(tx) = s.transactions.get(txid) {
                out.insert(*txid, raw_hex(tx));
            }
        }
        if let Some(extra) = &s.unrequested {
            out.insert(extra.compute_txid(), raw_hex(extra));
        }
        if let Some(txid) = s.unrequested_placeholder {
            out.insert(txid, UNFETCHABLE_PLACEHOLDER.to_string());
        }
        Ok(out)
    }

    fn block_headers(&self, heights: &[u32]) -> Result<BTreeMap<u32, String>, TransportError> {
        let s = self.enter("blockchain.block.header", heights.len())?;
        Ok(heights
            .iter()
            .filter_map(|h| {
                s.headers
                    .get(h)
                    .map(|header| (*h, hex::encode(bitcoin::consensus::serialize(header))))
            })
            .collect())
    }

    fn fee_estimates(&self, targets: &[u16]) -> Result<BTreeMap<u16, f64>, TransportError> {
        let s = self.enter("blockchain.estimatefee", targets.len())?;
        Ok(targets
            .iter()
            .map(|t| (*t, s.fee_estimates.get(t).copied().unwrap_or(-1.0)))
            .collect())
    }

    fn fee_histogram(&self) -> Result<Vec<(f64, u64)>, TransportError> {
        Ok(self.enter("mempool.get_fee_histogram", 0)?.histogram.clone())
    }

    fn relay_fee(&self) -> Result<Option<f64>, TransportError> {
        Ok(self.enter("blockchain.relayfee", 0)?.relay_fee)
    }

    fn broadcast(&self, raw_tx: &str) -> Result<String, TransportError> {
        let mut s = self.enter("blockchain.transaction.broadcast", 1)?;
        s.broadcasts.push(raw_tx.to_string());
        if let Some(reply) = &s.broadcast_reply {
            return Ok(reply.clone());
        }
        let bytes = hex::decode(raw_tx).map_err(|e| TransportError::protocol("broadcast", e))?;
        let tx: Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| TransportError::protocol("broadcast", e))?;
        Ok(tx.compute_txid().to_string())
    }

    fn block_stats(&self, heights: &[u32]) -> Result<BTreeMap<u32, BlockSummary>, TransportError> {
        let s = self.enter("blockchain.block.stats", heights.len())?;
        Ok(heights
            .iter()
            .filter_map(|h| s.block_stats.get(h).map(|b| (*h, b.clone())))
            .collect())
    }

    fn drain_notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.drain(..).collect()
    }
}
