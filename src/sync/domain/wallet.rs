//! Wallet model consumed by the engine.
//!
//! A wallet is two chains of address nodes (receive and change), the
//! transactions relevant to them, and the settings that drive address
//! generation. The engine extends the chains and replaces node outputs; it
//! never changes how a node's script is derived.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bitcoin::{Network, ScriptBuf, TxIn, TxOut, Txid};

use crate::sync::domain::derivation::ScriptDeriver;
use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::status::{local_history, LocalHistory};
use crate::sync::error::Result;
use crate::sync::types::{BlockTransaction, NodeOutputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPurpose {
    Receive,
    Change,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 2] = [KeyPurpose::Receive, KeyPurpose::Change];

    pub fn path_index(self) -> u32 {
        match self {
            KeyPurpose::Receive => 0,
            KeyPurpose::Change => 1,
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path_index())
    }
}

/// Position of an address node in the wallet tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub purpose: KeyPurpose,
    pub index: u32,
}

impl NodeKey {
    pub fn new(purpose: KeyPurpose, index: u32) -> Self {
        Self { purpose, index }
    }

    pub fn receive(index: u32) -> Self {
        Self::new(KeyPurpose::Receive, index)
    }

    pub fn change(index: u32) -> Self {
        Self::new(KeyPurpose::Change, index)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m/{}/{}", self.purpose, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationNode {
    key: NodeKey,
    script: ScriptBuf,
    script_hash: ScriptHash,
    outputs: NodeOutputs,
}

impl DerivationNode {
    pub fn new(key: NodeKey, script: ScriptBuf) -> Self {
        let script_hash = ScriptHash::from_script(&script);
        Self {
            key,
            script,
            script_hash,
            outputs: NodeOutputs::new(),
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn index(&self) -> u32 {
        self.key.index
    }

    pub fn script(&self) -> &ScriptBuf {
        &self.script
    }

    pub fn script_hash(&self) -> ScriptHash {
        self.script_hash
    }

    pub fn outputs(&self) -> &NodeOutputs {
        &self.outputs
    }

    pub fn is_used(&self) -> bool {
        !self.outputs.is_empty()
    }

    pub fn local_history(&self) -> LocalHistory {
        local_history(&self.outputs)
    }
}

/// A spent output of a related wallet, used as a label source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSpend {
    pub spent_by: Txid,
    pub label: String,
}

/// How labels flow into newly discovered outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LabelPolicy {
    #[default]
    None,
    /// Copy the label of this wallet's own output spent by the transaction
    /// that created the new output.
    CopyFromSpent,
    /// Label with `From <label>` when a parent wallet output was spent by the
    /// transaction that created the new output.
    PrefixFromParent(Vec<LabeledSpend>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletId(pub u64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wallet#{}", self.0)
    }
}

pub struct WalletState {
    id: WalletId,
    network: Network,
    gap_limit: u32,
    watch_last: Option<u32>,
    stored_block_height: Option<u32>,
    deriver: Arc<dyn ScriptDeriver>,
    nodes: BTreeMap<KeyPurpose, Vec<DerivationNode>>,
    transactions: HashMap<Txid, BlockTransaction>,
    label_policy: LabelPolicy,
}

impl fmt::Debug for WalletState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletState")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("gap_limit", &self.gap_limit)
            .field("receive_nodes", &self.nodes(KeyPurpose::Receive).len())
            .field("change_nodes", &self.nodes(KeyPurpose::Change).len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

impl WalletState {
    pub fn new(id: WalletId, network: Network, gap_limit: u32, deriver: Arc<dyn ScriptDeriver>) -> Self {
        Self {
            id,
            network,
            gap_limit,
            watch_last: None,
            stored_block_height: None,
            deriver,
            nodes: KeyPurpose::ALL.iter().map(|p| (*p, Vec::new())).collect(),
            transactions: HashMap::new(),
            label_policy: LabelPolicy::None,
        }
    }

    /// Only watch the last `watch_last` addresses before the highest used one.
    pub fn with_watch_last(mut self, watch_last: u32) -> Self {
        self.watch_last = Some(watch_last);
        self
    }

    pub fn with_label_policy(mut self, policy: LabelPolicy) -> Self {
        self.label_policy = policy;
        self
    }

    pub fn id(&self) -> WalletId {
        self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    pub fn stored_block_height(&self) -> Option<u32> {
        self.stored_block_height
    }

    pub fn set_stored_block_height(&mut self, height: u32) {
        self.stored_block_height = Some(height);
    }

    // =====================================================================
    // Address nodes
    // =====================================================================

    pub fn nodes(&self, purpose: KeyPurpose) -> &[DerivationNode] {
        self.nodes.get(&purpose).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &DerivationNode> {
        self.nodes.values().flatten()
    }

    pub fn node(&self, key: NodeKey) -> Option<&DerivationNode> {
        self.nodes(key.purpose).get(key.index as usize)
    }

    /// Derives nodes so that `index` exists for `purpose`. Returns the keys created.
    pub fn fill_to_index(&mut self, purpose: KeyPurpose, index: u32) -> Result<Vec<NodeKey>> {
        let deriver = self.deriver.clone();
        let chain = self.nodes.entry(purpose).or_default();
        let mut created = Vec::new();
        while chain.len() as u64 <= index as u64 {
            let key = NodeKey::new(purpose, chain.len() as u32);
            let script = deriver.derive(purpose, key.index)?;
            chain.push(DerivationNode::new(key, script));
            created.push(key);
        }
        if !created.is_empty() {
            log::trace!("[WALLET] {} derived {} nodes up to m/{}/{}", self.id, created.len(), purpose, index);
        }
        Ok(created)
    }

    pub fn highest_used_index(&self, purpose: KeyPurpose) -> Option<u32> {
        self.nodes(purpose).iter().filter(|n| n.is_used()).map(|n| n.index()).max()
    }

    /// Nodes to watch for `purpose`, honouring the watch window.
    pub fn address_nodes(&self, purpose: KeyPurpose) -> Vec<NodeKey> {
        let all = self.nodes(purpose).iter().map(|n| n.key());
        let window = match self.watch_last {
            Some(w) if w >= self.gap_limit
                && self.stored_block_height.unwrap_or(0) > 0
                && !self.transactions.is_empty() => w,
            _ => return all.collect(),
        };

        let highest = self.highest_used_index(purpose).unwrap_or(0) as i64;
        let start = highest - window as i64;
        all.filter(|k| k.index as i64 >= start).collect()
    }

    /// Nodes holding an output that, or whose spender, is not yet confirmed.
    pub fn mempool_nodes(&self) -> Vec<NodeKey> {
        self.all_nodes()
            .filter(|n| n.outputs().has_unconfirmed())
            .map(|n| n.key())
            .collect()
    }

    pub fn script_hash_index(&self) -> HashMap<ScriptHash, NodeKey> {
        self.all_nodes().map(|n| (n.script_hash(), n.key())).collect()
    }

    // =====================================================================
    // Transactions
    // =====================================================================

    pub fn transactions(&self) -> &HashMap<Txid, BlockTransaction> {
        &self.transactions
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&BlockTransaction> {
        self.transactions.get(txid)
    }

    pub fn has_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    /// Previous output of `input`, if the funding transaction is known.
    pub fn prev_output(&self, input: &TxIn) -> Option<&TxOut> {
        self.transactions
            .get(&input.previous_output.txid)
            .and_then(|btx| btx.tx.output.get(input.previous_output.vout as usize))
    }

    pub fn apply_transactions(&mut self, txs: impl IntoIterator<Item = BlockTransaction>) {
        for btx in txs {
            self.transactions.insert(btx.txid, btx);
        }
    }

    // =====================================================================
    // Outputs
    // =====================================================================

    /// Replaces a node's outputs, carrying labels over and applying the label policy.
    ///
    /// Returns `false` when the node history did not change.
    pub fn update_outputs(&mut self, key: NodeKey, mut outputs: NodeOutputs) -> bool {
        let Some(existing) = self.node(key).map(|n| n.outputs().clone()) else {
            log::warn!("[WALLET] {} update for unknown node {}", self.id, key);
            return false;
        };

        for output in existing.outputs() {
            if let (Some(label), Some(new)) = (&output.label, outputs.get_mut(&output.outpoint)) {
                if new.label.is_none() {
                    new.label = Some(label.clone());
                }
            }
        }

        if existing.same_history(&outputs) {
            return false;
        }

        self.propagate_labels(&mut outputs);
        if let Some(node) = self.nodes.get_mut(&key.purpose).and_then(|c| c.get_mut(key.index as usize)) {
            node.outputs = outputs;
        }
        true
    }

    pub fn clear_outputs(&mut self, key: NodeKey) {
        if let Some(node) = self.nodes.get_mut(&key.purpose).and_then(|c| c.get_mut(key.index as usize)) {
            node.outputs = NodeOutputs::new();
        }
    }

    /// Labels of this wallet's spent outputs, keyed by spending txid.
    pub fn labeled_spends(&self) -> Vec<LabeledSpend> {
        self.all_nodes()
            .flat_map(|n| n.outputs().spends())
            .filter_map(|(o, input)| {
                o.label.as_ref().map(|label| LabeledSpend {
                    spent_by: input.txid,
                    label: label.clone(),
                })
            })
            .collect()
    }

    fn propagate_labels(&self, outputs: &mut NodeOutputs) {
        let (sources, prefix) = match &self.label_policy {
            LabelPolicy::None => return,
            LabelPolicy::CopyFromSpent => (self.labeled_spends(), ""),
            LabelPolicy::PrefixFromParent(parent) => (parent.clone(), "From "),
        };

        let outpoints: Vec<_> = outputs.outputs().map(|o| o.outpoint).collect();
        for outpoint in outpoints {
            let Some(source) = sources.iter().find(|s| s.spent_by == outpoint.txid) else {
                continue;
            };
            if let Some(output) = outputs.get_mut(&outpoint) {
                if output.label.is_none() {
                    output.label = Some(format!("{}{}", prefix, source.label));
                }
            }
        }
    }
}
