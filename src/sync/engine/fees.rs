//! Fee estimation and transaction broadcast.
//!
//! Server estimates arrive in BTC/kB and are converted to sat/vB. An
//! external [`FeeRateSource`](crate::sync::external::FeeRateSource) for the
//! active network overlays them; its failures are logged and ignored.
//! Broadcasts over a proxy go to several independent sources before the
//! connected server is used.

use std::collections::BTreeMap;

use bitcoin::{Network, Transaction, Txid};
use rand::Rng;

use crate::sync::engine::SyncEngine;
use crate::sync::error::{ConsistencyFault, Error, Result, TransportError};
use crate::sync::types::{BlockSummary, BlockTransaction, FeeRatesUpdate, MempoolRateSize};

/// sat/vB assumed when the server does not report a relay fee.
pub const DEFAULT_MIN_RELAY_FEE: f64 = 1.0;

/// Successful external broadcasts required on mainnet.
pub const MINIMUM_BROADCASTS: usize = 2;

const SATS_PER_BTC: f64 = 100_000_000.0;

/// BTC/kB to sat/vB. Negative estimates ("no estimate") become 1 sat/vB.
pub fn btc_per_kb_to_sat_per_vb(btc_per_kb: f64) -> f64 {
    let mut sats_per_kb = (btc_per_kb * SATS_PER_BTC) as i64;
    if sats_per_kb < 0 {
        sats_per_kb = 1000;
    }
    sats_per_kb as f64 / 1000.0
}

pub struct FeeEstimator<'a> {
    engine: &'a SyncEngine,
}

impl<'a> FeeEstimator<'a> {
    pub(crate) fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// Server estimates for the configured targets. An RPC error yields the
    /// fallback rate for every target; connection failures propagate.
    pub fn server_fee_rates(&self) -> Result<BTreeMap<u16, f64>> {
        let config = self.engine.config();
        match self.engine.transport().fee_estimates(&config.target_blocks) {
            Ok(estimates) => Ok(estimates
                .into_iter()
                .map(|(target, btc_per_kb)| (target, btc_per_kb_to_sat_per_vb(btc_per_kb)))
                .collect()),
            Err(e @ TransportError::Rpc { .. }) => {
                log::warn!("[FEES] {}, using fallback rate {}", e, config.fallback_fee_rate);
                Ok(config
                    .target_blocks
                    .iter()
                    .map(|t| (*t, config.fallback_fee_rate))
                    .collect())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Target-block rates in sat/vB: server estimates overlaid with the
    /// external source when one serves the active network.
    pub fn target_block_fee_rates(&self) -> Result<BTreeMap<u16, f64>> {
        let mut rates = self.server_fee_rates()?;
        if let Some(source) = self.engine.fee_source() {
            match source.block_target_fee_rates(&rates) {
                Ok(external) => rates.extend(external),
                Err(e) => log::warn!("[FEES] {} fee rates unavailable: {}", source.name(), e),
            }
        }
        Ok(rates)
    }

    /// sat/vB; [`DEFAULT_MIN_RELAY_FEE`] when the server has none.
    pub fn minimum_relay_fee(&self) -> Result<f64> {
        Ok(match self.engine.transport().relay_fee()? {
            Some(btc_per_kb) => ((btc_per_kb * SATS_PER_BTC) as i64) as f64 / 1000.0,
            None => DEFAULT_MIN_RELAY_FEE,
        })
    }

    /// Mempool histogram ordered by fee rate.
    pub fn mempool_rate_sizes(&self) -> Result<Vec<MempoolRateSize>> {
        let mut sizes: Vec<MempoolRateSize> = self
            .engine
            .transport()
            .fee_histogram()?
            .into_iter()
            .map(|(fee_rate, vsize)| MempoolRateSize { fee_rate, vsize })
            .collect();
        sizes.sort_by(|a, b| a.fee_rate.total_cmp(&b.fee_rate));
        Ok(sizes)
    }

    /// External source only; `None` on any failure.
    pub fn next_block_median_fee_rate(&self) -> Option<f64> {
        let source = self.engine.fee_source()?;
        source.next_block_median_fee_rate().unwrap_or_else(|e| {
            log::debug!("[FEES] {} next block median unavailable: {}", source.name(), e);
            None
        })
    }

    /// Everything the keepalive refresh publishes, with target rates
    /// floored at `minimum_relay_fee`.
    pub fn fee_rates_update(&self, minimum_relay_fee: f64) -> Result<FeeRatesUpdate> {
        let target_block_fee_rates = self
            .target_block_fee_rates()?
            .into_iter()
            .map(|(target, rate)| (target, rate.max(minimum_relay_fee)))
            .collect();
        Ok(FeeRatesUpdate {
            target_block_fee_rates,
            mempool_rate_sizes: self.mempool_rate_sizes()?,
            next_block_median_fee_rate: self.next_block_median_fee_rate(),
        })
    }

    /// Summaries of the two most recent blocks.
    ///
    /// Server block stats when supported, else the external source, else
    /// timestamps from the block headers.
    pub fn recent_block_summaries(&self) -> Result<BTreeMap<u32, BlockSummary>> {
        let Some(current) = self.engine.current_height() else {
            return Ok(BTreeMap::new());
        };
        let heights: Vec<u32> = [current.saturating_sub(1), current]
            .into_iter()
            .filter(|h| *h > 0)
            .collect();

        if self.engine.profile().supports_block_stats {
            return Ok(self.engine.transport().block_stats(&heights)?);
        }

        if let Some(source) = self.engine.fee_source() {
            match source.recent_block_summaries() {
                Ok(summaries) => return Ok(summaries.into_iter().map(|s| (s.height, s)).collect()),
                Err(e) => log::debug!("[FEES] {} block summaries unavailable: {}", source.name(), e),
            }
        }

        let headers = self
            .engine
            .hydrator()
            .block_headers(&heights.iter().copied().collect())?;
        Ok(headers
            .iter()
            .map(|(height, header)| (*height, BlockSummary::from_header(*height, header)))
            .collect())
    }

    /// A couple of transactions recently seen in the mempool, from the
    /// external source: the newest and one random pick from the newer half.
    /// Empty on any failure.
    pub fn recent_mempool_transactions(&self) -> Vec<BlockTransaction> {
        let Some(source) = self.engine.fee_source() else {
            return Vec::new();
        };
        let recent = match source.recent_mempool_transactions() {
            Ok(recent) if !recent.is_empty() => recent,
            Ok(_) => return Vec::new(),
            Err(e) => {
                log::debug!("[FEES] {} recent transactions unavailable: {}", source.name(), e);
                return Vec::new();
            }
        };

        let mut picks = vec![recent[0]];
        if recent.len() > 1 {
            let half = recent.len() / 2;
            let index = if half == 1 {
                1
            } else {
                self.engine.with_rng_mut(|rng| rng.gen_range(0..half)) + 1
            };
            if recent[index].txid != recent[0].txid {
                picks.push(recent[index]);
            }
        }

        let txids: Vec<Txid> = picks.iter().map(|r| r.txid).collect();
        let fetched = match self.engine.hydrator().fetch_transactions(&txids) {
            Ok(fetched) => fetched,
            Err(e) => {
                log::debug!("[FEES] Could not fetch recent transactions: {}", e);
                return Vec::new();
            }
        };

        picks
            .into_iter()
            .filter_map(|reference| {
                let tx = fetched.get(&reference.txid)?.clone()?;
                Some(BlockTransaction {
                    txid: reference.txid,
                    height: reference.height,
                    block_time: None,
                    fee: reference.fee,
                    tx,
                })
            })
            .collect()
    }
}

pub struct Broadcaster<'a> {
    engine: &'a SyncEngine,
}

impl<'a> Broadcaster<'a> {
    pub(crate) fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// Broadcasts `tx` and remembers it until it confirms, so a matching
    /// status change can be explained without fetching history.
    pub fn broadcast(&self, tx: &Transaction, fee: Option<u64>) -> Result<Txid> {
        let txid = self.broadcast_privately(tx)?;
        self.engine
            .cache()
            .record_broadcast(BlockTransaction::unconfirmed(tx.clone(), fee));
        log::info!("[BROADCAST] Broadcast {}", txid);
        Ok(txid)
    }

    /// Over a proxy, tries the external sources in random order first.
    ///
    /// On mainnet it keeps going until [`MINIMUM_BROADCASTS`] sources have
    /// accepted the transaction or sources run out. Source failures are swallowed; the connected server
    /// is used when no source succeeded.
    pub fn broadcast_privately(&self, tx: &Transaction) -> Result<Txid> {
        if self.engine.using_proxy() {
            let mainnet = self.engine.config().network == Network::Bitcoin;
            let mut sources = self.engine.broadcast_sources();
            let mut txid = None;
            let mut successes = 0;

            while !sources.is_empty() {
                let index = self.engine.with_rng_mut(|rng| rng.gen_range(0..sources.len()));
                let source = sources.remove(index);
                match source.broadcast(tx) {
                    Ok(id) => {
                        log::debug!("[BROADCAST] {} accepted {}", source.name(), id);
                        txid = Some(id);
                        successes += 1;
                        if !mainnet || successes >= MINIMUM_BROADCASTS || sources.is_empty() {
                            return Ok(id);
                        }
                    }
                    Err(e) => log::warn!("[BROADCAST] {} failed: {}", source.name(), e),
                }
            }

            if let Some(id) = txid {
                return Ok(id);
            }
        }

        self.broadcast_to_server(tx)
    }

    /// Broadcasts over the connected server and checks the returned txid.
    pub fn broadcast_to_server(&self, tx: &Transaction) -> Result<Txid> {
        let raw = hex::encode(bitcoin::consensus::serialize(tx));
        let received = self.engine.transport().broadcast(&raw)?;
        let expected = tx.compute_txid();
        match received.trim().parse::<Txid>() {
            Ok(txid) if txid == expected => Ok(txid),
            _ => Err(Error::Consistency(ConsistencyFault::BroadcastTxidMismatch {
                expected,
                received,
            })),
        }
    }
}
