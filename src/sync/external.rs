//! Optional non-Electrum data sources.
//!
//! Fee and block data can be overlaid from an outside service, and
//! broadcasts can be fanned out to several endpoints when traffic goes
//! through a proxy. These are pluggable; the engine works without them.

use std::collections::BTreeMap;

use bitcoin::{Network, Transaction, Txid};

use crate::sync::types::{BlockSummary, TxReference};

/// External fee and mempool data.
///
/// Every call is best effort: the engine logs and ignores failures.
pub trait FeeRateSource: Send + Sync {
    fn name(&self) -> &str;

    fn supports_network(&self, network: Network) -> bool;

    /// Overlay for target fee rates in sat/vB. `current` holds the rates
    /// computed so far.
    fn block_target_fee_rates(
        &self,
        current: &BTreeMap<u16, f64>,
    ) -> anyhow::Result<BTreeMap<u16, f64>>;

    fn next_block_median_fee_rate(&self) -> anyhow::Result<Option<f64>>;

    fn recent_block_summaries(&self) -> anyhow::Result<Vec<BlockSummary>>;

    /// Recently seen mempool transactions, newest first.
    fn recent_mempool_transactions(&self) -> anyhow::Result<Vec<TxReference>>;
}

/// An endpoint that can relay a transaction to the network.
pub trait BroadcastSource: Send + Sync {
    fn name(&self) -> &str;

    fn supports_network(&self, network: Network) -> bool;

    fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid>;
}
