//! Value types shared by the engine, the transport and the wallet model.

use std::cmp::Ordering;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use bitcoin::{block, Amount, OutPoint, Transaction, Txid};

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::error::ConsistencyFault;

// =====================================================================
// History references
// =====================================================================

/// A transaction appearing in a script hash's history.
///
/// Height follows the Electrum convention: `> 0` confirmed at that height,
/// `0` unconfirmed with confirmed inputs, `< 0` unconfirmed with an
/// unconfirmed ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxReference {
    pub txid: Txid,
    pub height: i32,
    pub fee: Option<u64>,
}

impl TxReference {
    pub fn new(txid: Txid, height: i32) -> Self {
        Self {
            txid,
            height,
            fee: None,
        }
    }

    pub fn with_fee(mut self, fee: Option<u64>) -> Self {
        self.fee = fee;
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }

    /// Height used for ordering: mempool entries sort after every block,
    /// `-1` before `0`.
    pub fn comparison_height(&self) -> i64 {
        comparison_height(self.height)
    }
}

pub(crate) fn comparison_height(height: i32) -> i64 {
    if height > 0 {
        height as i64
    } else {
        i32::MAX as i64 + height as i64
    }
}

impl Ord for TxReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparison_height()
            .cmp(&other.comparison_height())
            .then_with(|| self.txid.cmp(&other.txid))
            .then_with(|| self.fee.cmp(&other.fee))
    }
}

impl PartialOrd for TxReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The accumulated references of one address, at most one per txid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet(BTreeMap<Txid, TxReference>);

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference. When the txid is already present the higher height wins.
    pub fn merge(&mut self, reference: TxReference) {
        match self.0.entry(reference.txid) {
            btree_map::Entry::Vacant(e) => {
                e.insert(reference);
            }
            btree_map::Entry::Occupied(mut e) => {
                if e.get().height < reference.height {
                    e.insert(reference);
                }
            }
        }
    }

    pub fn merge_all(&mut self, other: impl IntoIterator<Item = TxReference>) {
        for reference in other {
            self.merge(reference);
        }
    }

    pub fn get(&self, txid: &Txid) -> Option<&TxReference> {
        self.0.get(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.0.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TxReference> {
        self.0.values()
    }

    /// References in history order (height, then txid).
    pub fn sorted(&self) -> Vec<TxReference> {
        let mut refs: Vec<TxReference> = self.0.values().copied().collect();
        refs.sort();
        refs
    }
}

impl FromIterator<TxReference> for ReferenceSet {
    fn from_iter<I: IntoIterator<Item = TxReference>>(iter: I) -> Self {
        let mut set = ReferenceSet::new();
        set.merge_all(iter);
        set
    }
}

/// Fingerprint of a script hash's history as reported by `blockchain.scripthash.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusString(String);

impl StatusString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatusString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================================================================
// Hydrated transactions
// =====================================================================

/// A transaction body together with where it sits in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub txid: Txid,
    pub height: i32,
    /// Block timestamp, `None` while unconfirmed.
    pub block_time: Option<u32>,
    pub fee: Option<u64>,
    pub tx: Transaction,
}

impl BlockTransaction {
    pub fn unconfirmed(tx: Transaction, fee: Option<u64>) -> Self {
        Self {
            txid: tx.compute_txid(),
            height: 0,
            block_time: None,
            fee,
            tx,
        }
    }

    pub fn reference(&self) -> TxReference {
        TxReference::new(self.txid, self.height).with_fee(self.fee)
    }
}

/// Result of resolving a [`TxReference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydratedTransaction {
    Fetched(BlockTransaction),
    /// The server could not supply the raw bytes or the block header.
    Unfetchable,
}

impl HydratedTransaction {
    pub fn as_fetched(&self) -> Option<&BlockTransaction> {
        match self {
            HydratedTransaction::Fetched(btx) => Some(btx),
            HydratedTransaction::Unfetchable => None,
        }
    }

    pub fn is_unfetchable(&self) -> bool {
        matches!(self, HydratedTransaction::Unfetchable)
    }
}

// =====================================================================
// Owned outputs and the spend link table
// =====================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedOutput {
    pub outpoint: OutPoint,
    pub height: i32,
    pub block_time: Option<u32>,
    pub fee: Option<u64>,
    pub value: Amount,
    pub label: Option<String>,
}

impl OwnedOutput {
    pub fn reference(&self) -> TxReference {
        TxReference::new(self.outpoint.txid, self.height).with_fee(self.fee)
    }

    fn same_record(&self, other: &OwnedOutput) -> bool {
        self.outpoint == other.outpoint
            && self.height == other.height
            && self.block_time == other.block_time
            && self.fee == other.fee
            && self.value == other.value
    }
}

/// The input that spends an [`OwnedOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingInput {
    pub txid: Txid,
    pub vin: u32,
    pub height: i32,
    pub block_time: Option<u32>,
    pub fee: Option<u64>,
    pub value: Amount,
}

impl SpendingInput {
    pub fn reference(&self) -> TxReference {
        TxReference::new(self.txid, self.height).with_fee(self.fee)
    }
}

/// Outputs owned by one address plus the link table from outpoint to spender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeOutputs {
    received: BTreeMap<OutPoint, OwnedOutput>,
    spent_by: BTreeMap<OutPoint, SpendingInput>,
}

impl NodeOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, output: OwnedOutput) {
        self.received.insert(output.outpoint, output);
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&OwnedOutput> {
        self.received.get(outpoint)
    }

    pub fn get_mut(&mut self, outpoint: &OutPoint) -> Option<&mut OwnedOutput> {
        self.received.get_mut(outpoint)
    }

    /// Records `input` as the spender of `outpoint`.
    ///
    /// The output must have been received, and may only ever have one spender.
    pub fn link(&mut self, outpoint: OutPoint, input: SpendingInput) -> Result<(), ConsistencyFault> {
        if !self.received.contains_key(&outpoint) {
            return Err(ConsistencyFault::SpentWithoutReceipt(outpoint));
        }
        match self.spent_by.entry(outpoint) {
            btree_map::Entry::Vacant(e) => {
                e.insert(input);
                Ok(())
            }
            btree_map::Entry::Occupied(e) => {
                let existing = e.get();
                if existing.txid == input.txid && existing.vin == input.vin {
                    Ok(())
                } else {
                    Err(ConsistencyFault::DoubleSpend {
                        outpoint,
                        first: existing.txid,
                        second: input.txid,
                    })
                }
            }
        }
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<&SpendingInput> {
        self.spent_by.get(outpoint)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OwnedOutput> {
        self.received.values()
    }

    pub fn unspent(&self) -> impl Iterator<Item = &OwnedOutput> {
        self.received
            .values()
            .filter(move |o| !self.spent_by.contains_key(&o.outpoint))
    }

    pub fn spends(&self) -> impl Iterator<Item = (&OwnedOutput, &SpendingInput)> {
        self.spent_by
            .iter()
            .filter_map(move |(op, input)| self.received.get(op).map(|o| (o, input)))
    }

    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    pub fn len(&self) -> usize {
        self.received.len()
    }

    pub fn balance(&self) -> Amount {
        self.unspent().map(|o| o.value).sum()
    }

    /// `true` when an output or its spender is not yet confirmed.
    pub fn has_unconfirmed(&self) -> bool {
        self.received.values().any(|o| o.height <= 0) || self.spent_by.values().any(|i| i.height <= 0)
    }

    /// Compares history while ignoring labels.
    pub fn same_history(&self, other: &NodeOutputs) -> bool {
        self.spent_by == other.spent_by
            && self.received.len() == other.received.len()
            && self
                .received
                .values()
                .zip(other.received.values())
                .all(|(a, b)| a.same_record(b))
    }
}

// =====================================================================
// Chain, fee and server metadata
// =====================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    pub height: u32,
    pub timestamp: u32,
    pub median_fee: Option<f64>,
    pub transaction_count: Option<u32>,
    pub weight: Option<u64>,
}

impl BlockSummary {
    pub fn from_header(height: u32, header: &block::Header) -> Self {
        Self {
            height,
            timestamp: header.time,
            median_fee: None,
            transaction_count: None,
            weight: None,
        }
    }
}

/// One bucket of the mempool fee histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MempoolRateSize {
    /// sat/vB
    pub fee_rate: f64,
    pub vsize: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub server_software: String,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTip {
    pub height: u32,
    pub header: block::Header,
}

/// Pushed by the server between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ScriptHashStatus {
        hash: ScriptHash,
        status: Option<StatusString>,
    },
    NewTip(HeaderTip),
}

/// Fee data gathered on connect and on each keepalive refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeRatesUpdate {
    /// target blocks -> sat/vB
    pub target_block_fee_rates: BTreeMap<u16, f64>,
    pub mempool_rate_sizes: Vec<MempoolRateSize>,
    pub next_block_median_fee_rate: Option<f64>,
}

/// Everything learned while bringing up a connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub server_version: ServerVersion,
    pub banner: String,
    pub tip: HeaderTip,
    pub fee_rates: FeeRatesUpdate,
    pub minimum_relay_fee: f64,
}
