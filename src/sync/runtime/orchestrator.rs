//! Per-wallet sync orchestration.
//!
//! Syncs of one wallet are serialised. Results are staged and written to the
//! wallet only after the full-history-changed check passes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bitcoin::Txid;
use parking_lot::Mutex;

use crate::sync::domain::wallet::{NodeKey, WalletId, WalletState};
use crate::sync::engine::reconciler::HistoryRun;
use crate::sync::engine::utxo_graph::{TransactionView, UtxoGraphBuilder};
use crate::sync::engine::SyncEngine;
use crate::sync::error::{Error, Result};
use crate::sync::runtime::cancel::CancelToken;
use crate::sync::types::{HydratedTransaction, NodeOutputs, StatusString};

/// What a successful sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Nodes whose server status moved since their history was last fetched.
    pub updated_nodes: Vec<NodeKey>,
    /// Transactions the wallet did not hold before this sync.
    pub new_transactions: BTreeSet<Txid>,
}

#[derive(Debug, Default)]
struct WalletLock {
    /// Engine epoch the retrieved statuses were seeded in.
    initialized_epoch: Option<u64>,
}

/// **WalletHistoryService**
///
/// The imperative shell around [`SyncEngine`]. It serialises syncs per wallet,
/// runs the reconciler, rebuilds outputs from the staged results and only
/// then writes to the [`WalletState`]. Any error leaves the wallet untouched.
pub struct WalletHistoryService {
    engine: Arc<SyncEngine>,
    locks: Mutex<HashMap<WalletId, Arc<Mutex<WalletLock>>>>,
}

impl WalletHistoryService {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Full sync of every purpose of `wallet`.
    ///
    /// Fails with [`Error::FullHistoryChanged`] when a wallet with history
    /// sees every used node change at once; the caller should then
    /// [`clear_wallet_history`](Self::clear_wallet_history) and sync a fresh
    /// wallet.
    pub fn sync_wallet(&self, wallet: &mut WalletState, cancel: &CancelToken) -> Result<SyncOutcome> {
        self.sync(wallet, None, cancel)
    }

    /// Sync limited to `nodes`, plus nodes holding unconfirmed outputs and
    /// nodes touched by newly found transactions.
    pub fn sync_nodes(
        &self,
        wallet: &mut WalletState,
        nodes: &[NodeKey],
        cancel: &CancelToken,
    ) -> Result<SyncOutcome> {
        if nodes.is_empty() {
            return Ok(SyncOutcome::default());
        }
        self.sync(wallet, Some(nodes), cancel)
    }

    /// Forgets every retrieved status of `wallet`, so the next sync starts over.
    pub fn clear_wallet_history(&self, wallet: &WalletState) {
        let cache = self.engine.cache();
        for node in wallet.all_nodes() {
            cache.forget_retrieved(&node.script_hash());
        }
        self.lock_for(wallet.id()).lock().initialized_epoch = None;
        log::info!("[ENGINE] {} history cleared", wallet.id());
    }

    fn lock_for(&self, id: WalletId) -> Arc<Mutex<WalletLock>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    fn sync(&self, wallet: &mut WalletState, nodes: Option<&[NodeKey]>, cancel: &CancelToken) -> Result<SyncOutcome> {
        let lock = self.lock_for(wallet.id());
        let mut guard = lock.lock();

        let epoch = self.engine.epoch();
        if guard.initialized_epoch != Some(epoch) {
            self.seed_retrieved(wallet);
            guard.initialized_epoch = Some(epoch);
        }

        let cache = self.engine.cache();
        let had_history = wallet.all_nodes().any(|n| cache.local_status(n).is_some());

        let reconciler = self.engine.reconciler(cancel);
        let run = match nodes {
            None => reconciler.reconcile_wallet(wallet)?,
            Some(nodes) => reconciler.reconcile(wallet, nodes)?,
        };
        let staged_outputs = rebuild_outputs(wallet, &run)?;

        let considered: Vec<NodeKey> = match nodes {
            None => wallet.all_nodes().map(|n| n.key()).collect(),
            Some(nodes) => nodes.to_vec(),
        };
        let statuses = self.subscribed_statuses(wallet, &considered);
        let updated_nodes: Vec<NodeKey> = statuses
            .iter()
            .filter(|(key, status)| {
                wallet
                    .node(**key)
                    .is_some_and(|n| **status != cache.retrieved_status(&n.script_hash()))
            })
            .map(|(key, _)| *key)
            .collect();

        if nodes.is_none() && had_history {
            self.check_full_history_change(wallet, &updated_nodes, &staged_outputs)?;
        }

        // Nothing failed: commit.
        let new_transactions = run.new_transactions(wallet);
        wallet.apply_transactions(
            run.transactions
                .into_values()
                .filter_map(|h| match h {
                    HydratedTransaction::Fetched(btx) => Some(btx),
                    HydratedTransaction::Unfetchable => None,
                }),
        );
        let mut changed = 0;
        for (key, outputs) in staged_outputs {
            if wallet.update_outputs(key, outputs) {
                changed += 1;
            }
        }
        for (key, status) in statuses {
            if let Some(node) = wallet.node(key) {
                cache.set_retrieved(node.script_hash(), status);
            }
        }

        if let Some(nodes) = nodes {
            for key in nodes {
                let Some(node) = wallet.node(*key) else { continue };
                if node.is_used() && cache.retrieved_status(&node.script_hash()).is_none() {
                    log::debug!("[ENGINE] {} clearing outputs of {}", wallet.id(), key);
                    wallet.clear_outputs(*key);
                }
            }
        }

        if let Some(height) = self.engine.current_height() {
            wallet.set_stored_block_height(height);
        }
        if !new_transactions.is_empty() && !self.engine.using_proxy() {
            self.engine.decoys().after_wallet_activity();
        }

        log::info!(
            "[ENGINE] {} synced: {} nodes updated, {} outputs changed, {} new transactions",
            wallet.id(),
            updated_nodes.len(),
            changed,
            new_transactions.len()
        );
        Ok(SyncOutcome {
            updated_nodes,
            new_transactions,
        })
    }

    /// Seeds retrieved statuses from what the wallet already knows, so
    /// unchanged nodes are not fetched again after a restart.
    fn seed_retrieved(&self, wallet: &WalletState) {
        let cache = self.engine.cache();
        for node in wallet.all_nodes() {
            let status = cache.local_status(node);
            cache.seed_retrieved(node.script_hash(), status);
        }
        log::debug!("[ENGINE] {} seeded retrieved statuses", wallet.id());
    }

    /// Latest subscribed status of the subscribed nodes among `keys`.
    fn subscribed_statuses(&self, wallet: &WalletState, keys: &[NodeKey]) -> BTreeMap<NodeKey, Option<StatusString>> {
        let cache = self.engine.cache();
        keys.iter()
            .filter_map(|key| {
                let hash = wallet.node(*key)?.script_hash();
                cache
                    .is_subscribed(&hash)
                    .then(|| (*key, cache.subscribed_status(&hash)))
            })
            .collect()
    }

    fn check_full_history_change(
        &self,
        wallet: &WalletState,
        updated: &[NodeKey],
        staged: &BTreeMap<NodeKey, NodeOutputs>,
    ) -> Result<()> {
        if updated.is_empty() {
            return Ok(());
        }

        let used: BTreeSet<NodeKey> = wallet
            .all_nodes()
            .filter(|n| match staged.get(&n.key()) {
                Some(outputs) => !outputs.is_empty(),
                None => n.is_used(),
            })
            .map(|n| n.key())
            .collect();
        let updated: BTreeSet<NodeKey> = updated.iter().copied().collect();
        if updated != used {
            return Ok(());
        }

        let cache = self.engine.cache();
        let all_ambiguous = updated
            .iter()
            .filter_map(|k| wallet.node(*k))
            .all(|n| cache.is_ambiguous(&n.script_hash()));
        if all_ambiguous {
            return Ok(());
        }

        log::info!("[ENGINE] {} every used node changed history, full resync required", wallet.id());
        Err(Error::FullHistoryChanged)
    }
}

fn rebuild_outputs(wallet: &WalletState, run: &HistoryRun) -> Result<BTreeMap<NodeKey, NodeOutputs>> {
    let builder = UtxoGraphBuilder::new(TransactionView::new(&run.transactions, wallet));
    let mut staged = BTreeMap::new();
    for (key, references) in &run.references {
        let node = wallet
            .node(*key)
            .ok_or_else(|| Error::Wallet(format!("{} has no node {}", wallet.id(), key)))?;
        staged.insert(*key, builder.rebuild(node, references)?);
    }
    Ok(staged)
}
