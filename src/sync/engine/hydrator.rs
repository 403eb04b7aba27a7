//! Resolves transaction references into transaction bodies.
//!
//! Bodies already known (wallet, staged, cached or broadcast through us)
//! are reused; the rest are fetched in one call. Confirmed references also
//! need their block header for the timestamp. A reference the server cannot
//! serve becomes [`HydratedTransaction::Unfetchable`]; any other gap fails
//! the whole call.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitcoin::{block, Transaction, Txid};

use crate::sync::domain::wallet::{NodeKey, WalletState};
use crate::sync::electrum::api::UNFETCHABLE_PLACEHOLDER;
use crate::sync::engine::utxo_graph::{Resolved, TransactionView};
use crate::sync::engine::SyncEngine;
use crate::sync::error::{ConsistencyFault, Result, TransportError};
use crate::sync::types::{BlockTransaction, HydratedTransaction, ReferenceSet, TxReference};

pub struct TransactionHydrator<'a> {
    engine: &'a SyncEngine,
}

impl<'a> TransactionHydrator<'a> {
    pub(crate) fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// Hydrates every reference in `references` that is not already visible
    /// at the same height, adding the results to `staged`.
    ///
    /// Returns the number of transactions hydrated.
    pub fn hydrate_referenced(
        &self,
        wallet: &WalletState,
        references: &BTreeMap<NodeKey, ReferenceSet>,
        staged: &mut HashMap<Txid, HydratedTransaction>,
    ) -> Result<usize> {
        let cache = self.engine.cache();
        let all: ReferenceSet = references.values().flat_map(|set| set.iter().copied()).collect();

        let mut needed = BTreeMap::new();
        let mut bodies = HashMap::new();
        let mut from_cache = Vec::new();
        {
            let view = TransactionView::new(staged, wallet);
            for reference in all.iter() {
                match view.resolve(&reference.txid) {
                    Some(Resolved::Known(btx)) if btx.height == reference.height => continue,
                    Some(Resolved::Known(btx)) => {
                        bodies.insert(reference.txid, btx.tx.clone());
                    }
                    Some(Resolved::Unfetchable) => {}
                    None => {
                        if let Some(cached) = cache.cached_transaction(&reference.txid) {
                            if cached.height == reference.height {
                                from_cache.push(cached);
                                continue;
                            }
                            bodies.insert(reference.txid, cached.tx);
                        } else if let Some(broadcast) = cache.broadcast(&reference.txid) {
                            bodies.insert(reference.txid, broadcast.tx);
                        }
                    }
                }
                needed.insert(reference.txid, *reference);
            }
        }

        let mut hydrated = from_cache.len();
        for btx in from_cache {
            staged.insert(btx.txid, HydratedTransaction::Fetched(btx));
        }
        if needed.is_empty() {
            return Ok(hydrated);
        }

        log::debug!("[HYDRATE] {} hydrating {} transactions", wallet.id(), needed.len());
        let result = self.hydrate(&needed, bodies)?;
        hydrated += result.len();

        let confirmed: Vec<Txid> = result
            .values()
            .filter_map(HydratedTransaction::as_fetched)
            .filter(|btx| btx.height > 0)
            .map(|btx| btx.txid)
            .collect();
        cache.remove_broadcasts(&confirmed);

        let threshold = self.engine.config().cache_confirmations;
        if let Some(tip) = self.engine.current_height() {
            for btx in result.values().filter_map(HydratedTransaction::as_fetched) {
                if btx.height > 0 && tip + 1 >= btx.height as u32 + threshold {
                    cache.cache_transaction(btx.clone());
                }
            }
        }

        staged.extend(result);
        Ok(hydrated)
    }

    /// Resolves `references` (keyed by txid). `bodies` holds transactions
    /// already known locally; everything else is fetched.
    pub fn hydrate(
        &self,
        references: &BTreeMap<Txid, TxReference>,
        mut bodies: HashMap<Txid, Transaction>,
    ) -> Result<HashMap<Txid, HydratedTransaction>> {
        let heights: BTreeSet<u32> = references
            .values()
            .filter(|r| r.height > 0)
            .map(|r| r.height as u32)
            .collect();
        let headers = self.block_headers(&heights)?;

        let mut result = HashMap::with_capacity(references.len());
        let missing: Vec<Txid> = references.keys().filter(|t| !bodies.contains_key(*t)).copied().collect();
        if !missing.is_empty() {
            let raw = self.engine.transport().transactions(&missing)?;
            for (txid, hex) in raw {
                if !references.contains_key(&txid) {
                    return Err(ConsistencyFault::UnrequestedTransaction(txid).into());
                }
                if hex == UNFETCHABLE_PLACEHOLDER {
                    log::warn!("[HYDRATE] Server could not supply {}", txid);
                    result.insert(txid, HydratedTransaction::Unfetchable);
                    continue;
                }

                let tx = match parse_transaction(&hex) {
                    Ok(tx) if tx.compute_txid() == txid => tx,
                    Ok(tx) => {
                        log::error!("[HYDRATE] Requested {} but received {}", txid, tx.compute_txid());
                        continue;
                    }
                    Err(e) => {
                        log::error!("[HYDRATE] Could not parse tx {}: {}", txid, e);
                        continue;
                    }
                };
                bodies.insert(txid, tx);
            }
        }

        for (txid, reference) in references {
            if result.contains_key(txid) {
                continue;
            }
            let Some(tx) = bodies.remove(txid) else {
                continue;
            };

            let block_time = if reference.height > 0 {
                match headers.get(&(reference.height as u32)) {
                    Some(header) => Some(header.time),
                    None => {
                        log::warn!("[HYDRATE] No header at {} for {}", reference.height, txid);
                        result.insert(*txid, HydratedTransaction::Unfetchable);
                        continue;
                    }
                }
            } else {
                None
            };

            result.insert(
                *txid,
                HydratedTransaction::Fetched(BlockTransaction {
                    txid: *txid,
                    height: reference.height,
                    block_time,
                    fee: reference.fee,
                    tx,
                }),
            );
        }

        let unresolved: Vec<Txid> = references.keys().filter(|t| !result.contains_key(*t)).copied().collect();
        if !unresolved.is_empty() {
            return Err(ConsistencyFault::UnresolvedReferences(unresolved).into());
        }
        Ok(result)
    }

    /// Headers at `heights`, from the session cache where possible. Heights
    /// the server does not know are left out.
    pub fn block_headers(&self, heights: &BTreeSet<u32>) -> Result<BTreeMap<u32, block::Header>> {
        let cache = self.engine.cache();
        let mut headers = BTreeMap::new();
        let mut missing = Vec::new();
        for height in heights {
            match cache.header(*height) {
                Some(header) => {
                    headers.insert(*height, header);
                }
                None => missing.push(*height),
            }
        }
        if missing.is_empty() {
            return Ok(headers);
        }

        let raw = self.engine.transport().block_headers(&missing)?;
        for (height, hex) in raw {
            let bytes = hex::decode(&hex).map_err(|e| TransportError::protocol("blockchain.block.header", e))?;
            let header: block::Header = bitcoin::consensus::deserialize(&bytes)
                .map_err(|e| TransportError::protocol("blockchain.block.header", e))?;
            cache.insert_header(height, header);
            headers.insert(height, header);
        }

        let unknown = heights.len() - headers.len();
        if unknown > 0 {
            log::warn!("[HYDRATE] Could not retrieve {} block headers", unknown);
        }
        Ok(headers)
    }

    /// Raw transactions by txid without height information. `None` marks a
    /// transaction the server could not supply; unparsable ones are left out.
    pub fn fetch_transactions(&self, txids: &[Txid]) -> Result<BTreeMap<Txid, Option<Transaction>>> {
        let raw = self.engine.transport().transactions(txids)?;
        let mut out = BTreeMap::new();
        for (txid, hex) in raw {
            if hex == UNFETCHABLE_PLACEHOLDER {
                out.insert(txid, None);
                continue;
            }
            match parse_transaction(&hex) {
                Ok(tx) => {
                    out.insert(txid, Some(tx));
                }
                Err(e) => log::error!("[HYDRATE] Could not parse tx {}: {}", txid, e),
            }
        }
        Ok(out)
    }
}

fn parse_transaction(hex: &str) -> std::result::Result<Transaction, String> {
    let bytes = hex::decode(hex).map_err(|e| e.to_string())?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| e.to_string())
}
