//! Gap-limit aware history fetch loop.
//!
//! A run subscribes the wallet's nodes, fetches the history of those whose
//! status moved, hydrates the referenced transactions and derives more nodes
//! until every purpose keeps `gap_limit` unused addresses past the highest
//! used one. Before asking the server for a history, two guesses are tried
//! from local data:
//!
//! * a transaction we broadcast touches the address, and appending it to the
//!   known history reproduces the subscribed status;
//! * promoting every unconfirmed entry to the tip height reproduces it.
//!
//! Everything a run learns is kept in [`HistoryRun`]. The wallet itself only
//! gains derived nodes; transactions and outputs are committed by the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitcoin::Txid;

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::status::status_of;
use crate::sync::domain::wallet::{KeyPurpose, NodeKey, WalletState};
use crate::sync::engine::utxo_graph::TransactionView;
use crate::sync::engine::SyncEngine;
use crate::sync::error::{Result, TransportError};
use crate::sync::runtime::cancel::CancelToken;
use crate::sync::types::{HydratedTransaction, ReferenceSet, StatusString, TxReference};

/// Work area of one reconciliation.
#[derive(Debug, Default)]
pub struct HistoryRun {
    /// Nodes whose history was fetched or derived this run.
    pub references: BTreeMap<NodeKey, ReferenceSet>,
    /// Transactions hydrated this run, not yet in the wallet.
    pub transactions: HashMap<Txid, HydratedTransaction>,
}

impl HistoryRun {
    /// Referenced txids the wallet does not hold yet.
    pub fn new_transactions(&self, wallet: &WalletState) -> BTreeSet<Txid> {
        self.references
            .values()
            .flat_map(|set| set.iter())
            .map(|r| r.txid)
            .filter(|txid| wallet.transaction(txid).is_none())
            .collect()
    }

    fn keys_of(&self, purpose: KeyPurpose) -> Vec<NodeKey> {
        self.references.keys().filter(|k| k.purpose == purpose).copied().collect()
    }
}

pub struct HistoryReconciler<'a> {
    engine: &'a SyncEngine,
    cancel: &'a CancelToken,
}

impl<'a> HistoryReconciler<'a> {
    pub(crate) fn new(engine: &'a SyncEngine, cancel: &'a CancelToken) -> Self {
        Self { engine, cancel }
    }

    // =====================================================================
    // Entry points
    // =====================================================================

    /// Reconciles every purpose of `wallet`.
    ///
    /// Watched nodes that were neither fetched nor fetched before end up
    /// with an empty reference set.
    pub fn reconcile_wallet(&self, wallet: &mut WalletState) -> Result<HistoryRun> {
        let mut run = HistoryRun::default();
        for purpose in KeyPurpose::ALL {
            self.cancel.check()?;
            self.purpose_history(wallet, purpose, &mut run)?;
        }
        log::debug!("[RECONCILE] {} fetched history for {} nodes", wallet.id(), run.references.len());
        Ok(run)
    }

    /// Reconciles `nodes` plus every node holding unconfirmed outputs, then
    /// any further wallet node touched by newly found transactions.
    pub fn reconcile(&self, wallet: &mut WalletState, nodes: &[NodeKey]) -> Result<HistoryRun> {
        let mut run = HistoryRun::default();

        let mut targets: BTreeSet<NodeKey> = nodes.iter().copied().collect();
        targets.extend(wallet.mempool_nodes());
        let target_list: Vec<NodeKey> = targets.iter().copied().collect();

        self.subscribe(wallet, &target_list, &mut run, 0)?;
        let marked: Vec<NodeKey> = run.references.keys().copied().collect();
        self.fetch_references(wallet, &marked, &mut run, 0)?;
        let new_references = run.new_transactions(wallet);
        self.hydrate(wallet, &mut run)?;

        let purposes: BTreeSet<KeyPurpose> = nodes.iter().map(|k| k.purpose).collect();
        for purpose in purposes {
            self.extend_to_gap_limit(wallet, purpose, &mut run)?;
        }

        if new_references.is_empty() {
            return Ok(run);
        }

        self.cancel.check()?;
        log::debug!("[RECONCILE] {} found {} new transactions", wallet.id(), new_references.len());
        let additional = self.additional_nodes(wallet, &run, &new_references, &targets);
        if !additional.is_empty() {
            log::debug!("[RECONCILE] {} found {} additional nodes", wallet.id(), additional.len());
            self.subscribe(wallet, &additional, &mut run, 0)?;
            self.fetch_references(wallet, &additional, &mut run, 0)?;
            self.hydrate(wallet, &mut run)?;
        }

        Ok(run)
    }

    // =====================================================================
    // Steps
    // =====================================================================

    fn purpose_history(&self, wallet: &mut WalletState, purpose: KeyPurpose, run: &mut HistoryRun) -> Result<()> {
        let nodes = wallet.address_nodes(purpose);
        self.subscribe(wallet, &nodes, run, 0)?;
        let marked = run.keys_of(purpose);
        self.fetch_references(wallet, &marked, run, 0)?;
        self.hydrate(wallet, run)?;
        self.extend_to_gap_limit(wallet, purpose, run)?;

        let cache = self.engine.cache();
        for key in wallet.address_nodes(purpose) {
            if run.references.contains_key(&key) {
                continue;
            }
            let Some(node) = wallet.node(key) else { continue };
            if cache.retrieved_status(&node.script_hash()).is_none() {
                run.references.insert(key, ReferenceSet::new());
            }
        }
        Ok(())
    }

    /// Subscribes `nodes` and marks the ones needing a history fetch.
    fn subscribe(&self, wallet: &WalletState, nodes: &[NodeKey], run: &mut HistoryRun, start_index: u32) -> Result<()> {
        let states = self.engine.subscriptions().subscribe_nodes(wallet, nodes, start_index)?;
        for (key, state) in states {
            if state.needs_fetch() {
                run.references.entry(key).or_default();
            }
        }
        Ok(())
    }

    /// Fetches the references of `nodes` with index at least `start_index`
    /// and merges them into the run.
    pub fn fetch_references(
        &self,
        wallet: &WalletState,
        nodes: &[NodeKey],
        run: &mut HistoryRun,
        start_index: u32,
    ) -> Result<()> {
        let mut derived: BTreeMap<NodeKey, Vec<TxReference>> = BTreeMap::new();
        let mut remote: BTreeMap<ScriptHash, Vec<NodeKey>> = BTreeMap::new();

        for key in nodes.iter().filter(|k| k.index >= start_index) {
            let Some(node) = wallet.node(*key) else { continue };
            let hash = node.script_hash();
            match self.guess_references(wallet, run, *key, hash) {
                Some(refs) => {
                    log::trace!("[RECONCILE] {} status reproduced locally", key);
                    derived.insert(*key, refs);
                }
                None => remote.entry(hash).or_default().push(*key),
            }
        }

        if !remote.is_empty() {
            log::debug!("[RECONCILE] {} fetching history for {} script hashes", wallet.id(), remote.len());
            let hashes: Vec<ScriptHash> = remote.keys().copied().collect();
            let mut histories = self.engine.transport().script_hash_history(&hashes)?;
            for (hash, keys) in remote {
                let refs = histories.remove(&hash).ok_or_else(|| {
                    TransportError::protocol("blockchain.scripthash.get_history", format!("no history for {}", hash))
                })?;
                for key in keys {
                    derived.insert(key, refs.clone());
                }
            }
        }

        for (key, refs) in derived {
            let fetched: ReferenceSet = refs.into_iter().collect();
            run.references.entry(key).or_default().merge_all(fetched.iter().copied());
        }
        Ok(())
    }

    /// Tries to reproduce the latest subscribed status from local data.
    fn guess_references(&self, wallet: &WalletState, run: &HistoryRun, key: NodeKey, hash: ScriptHash) -> Option<Vec<TxReference>> {
        let cache = self.engine.cache();
        let history = cache.subscription_history(&hash);
        let latest: &Option<StatusString> = history.last()?;
        let node = wallet.node(key)?;
        let local = node.local_history().references;

        let view = TransactionView::new(&run.transactions, wallet);
        for broadcast in cache.broadcasts() {
            let tx = &broadcast.tx;
            let touches = tx.output.iter().any(|o| ScriptHash::from_script(&o.script_pubkey) == hash)
                || tx
                    .input
                    .iter()
                    .filter_map(|i| view.prev_output(i))
                    .any(|o| ScriptHash::from_script(&o.script_pubkey) == hash);
            if !touches {
                continue;
            }

            let mut refs = local.clone();
            refs.push(TxReference::new(broadcast.txid, 0).with_fee(Some(broadcast.fee.unwrap_or(0))));
            if status_of(&refs).as_ref() == latest.as_ref() {
                return Some(refs);
            }
        }

        let tip = self.engine.current_height()?;
        if local.iter().any(|r| !r.is_confirmed()) {
            let promoted: Vec<TxReference> = local
                .iter()
                .map(|r| {
                    if !r.is_confirmed() {
                        TxReference::new(r.txid, tip as i32)
                    } else {
                        *r
                    }
                })
                .collect();
            if status_of(&promoted).as_ref() == latest.as_ref() {
                return Some(promoted);
            }
        }
        None
    }

    fn hydrate(&self, wallet: &WalletState, run: &mut HistoryRun) -> Result<()> {
        self.engine
            .hydrator()
            .hydrate_referenced(wallet, &run.references, &mut run.transactions)?;
        Ok(())
    }

    /// Derives, subscribes and fetches nodes until `purpose` has
    /// `gap_limit` nodes past the highest used or fetched index.
    fn extend_to_gap_limit(&self, wallet: &mut WalletState, purpose: KeyPurpose, run: &mut HistoryRun) -> Result<()> {
        let mut size = wallet.nodes(purpose).len() as u32;
        let mut target = gap_limit_size(wallet, purpose, run);
        while size < target {
            self.cancel.check()?;
            log::debug!("[RECONCILE] {} extending m/{} from {} to {} nodes", wallet.id(), purpose, size, target);

            wallet.fill_to_index(purpose, target - 1)?;
            let nodes = wallet.address_nodes(purpose);
            self.subscribe(wallet, &nodes, run, size)?;
            let marked = run.keys_of(purpose);
            self.fetch_references(wallet, &marked, run, size)?;
            self.hydrate(wallet, run)?;

            size = wallet.nodes(purpose).len() as u32;
            target = gap_limit_size(wallet, purpose, run);
        }
        Ok(())
    }

    /// Wallet nodes outside `targets` paid to or spent from by `txids`.
    fn additional_nodes(
        &self,
        wallet: &WalletState,
        run: &HistoryRun,
        txids: &BTreeSet<Txid>,
        targets: &BTreeSet<NodeKey>,
    ) -> Vec<NodeKey> {
        let index = wallet.script_hash_index();
        let view = TransactionView::new(&run.transactions, wallet);
        let mut found = BTreeSet::new();

        for txid in txids {
            let Some(btx) = view.get(txid) else { continue };
            let scripts = btx
                .tx
                .output
                .iter()
                .chain(btx.tx.input.iter().filter_map(|i| view.prev_output(i)))
                .map(|o| ScriptHash::from_script(&o.script_pubkey));
            for hash in scripts {
                if let Some(key) = index.get(&hash) {
                    if !targets.contains(key) {
                        found.insert(*key);
                    }
                }
            }
        }
        found.into_iter().collect()
    }
}

/// Node count `purpose` needs: highest fetched or used index plus the gap
/// limit plus one, or just the gap limit for an unused chain.
pub fn gap_limit_size(wallet: &WalletState, purpose: KeyPurpose, run: &HistoryRun) -> u32 {
    let fetched = run.references.keys().filter(|k| k.purpose == purpose).map(|k| k.index).max();
    let used = wallet.highest_used_index(purpose);
    match fetched.max(used) {
        Some(index) => index + wallet.gap_limit() + 1,
        None => wallet.gap_limit(),
    }
}
