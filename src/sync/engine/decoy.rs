//! Decoy subscriptions and rebroadcasts.
//!
//! Without a proxy the server sees exactly which addresses a wallet
//! watches. To blur that picture the engine also subscribes script hashes
//! it does not care about: outputs of random mempool transactions and
//! purely random hashes. Occasionally one of those mempool transactions is
//! rebroadcast, and when the server echoes the expected status back a few
//! more random hashes are subscribed.
//!
//! Decoys never enter the subscription map the wallets reconcile against,
//! and every failure here is logged and dropped.

use std::time::Duration;

use bitcoin::Txid;
use rand::Rng;

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::status::status_of;
use crate::sync::engine::SyncEngine;
use crate::sync::types::{BlockTransaction, StatusString, TxReference};

/// Upper bound of the random delay before a rebroadcast.
pub const MAX_REBROADCAST_DELAY_SECS: u64 = 600;

const OUTPUT_STOP_PROBABILITY: f64 = 0.1;
const REBROADCAST_PROBABILITY: f64 = 0.5;

/// A rebroadcast to run after `delay`, off the notification path.
#[derive(Debug, Clone)]
pub struct RebroadcastPlan {
    pub delay: Duration,
    pub candidates: Vec<BlockTransaction>,
}

pub struct DecoyScheduler<'a> {
    engine: &'a SyncEngine,
}

impl<'a> DecoyScheduler<'a> {
    pub(crate) fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// Rotates decoys on a new block: expires old ones, subscribes output
    /// hashes of recent mempool transactions plus a few random hashes, and
    /// plans a rebroadcast of one of those transactions.
    pub fn on_new_block(&self, height: u32) -> Option<RebroadcastPlan> {
        self.expire(height);

        let recent = self.engine.fees().recent_mempool_transactions();
        let cache = self.engine.cache();
        let hashes = self.engine.with_rng_mut(|rng| {
            let mut hashes = Vec::new();
            for btx in &recent {
                for output in &btx.tx.output {
                    let hash = ScriptHash::from_script(&output.script_pubkey);
                    if !cache.is_subscribed(&hash) {
                        hashes.push(hash);
                    }
                    if rng.gen_bool(OUTPUT_STOP_PROBABILITY) {
                        break;
                    }
                }
            }
            if !hashes.is_empty() {
                hashes.extend(random_hashes(rng, 1..=8));
            }
            hashes
        });

        if !hashes.is_empty() {
            self.subscribe(&hashes, height);
        }

        if recent.is_empty() {
            return None;
        }
        let delay = self
            .engine
            .with_rng_mut(|rng| Duration::from_secs(rng.gen_range(0..=MAX_REBROADCAST_DELAY_SECS)));
        log::debug!("[DECOY] Rebroadcast of {} candidates planned in {:?}", recent.len(), delay);
        Some(RebroadcastPlan {
            delay,
            candidates: recent,
        })
    }

    /// With even odds, rebroadcasts one candidate over the connected server
    /// and remembers the status its first output should echo.
    pub fn execute_rebroadcast(&self, plan: &RebroadcastPlan) -> Option<Txid> {
        if plan.candidates.is_empty() {
            return None;
        }
        let chosen = self.engine.with_rng_mut(|rng| {
            rng.gen_bool(REBROADCAST_PROBABILITY)
                .then(|| plan.candidates[rng.gen_range(0..plan.candidates.len())].clone())
        })?;

        let first = chosen.tx.output.first()?;
        let hash = ScriptHash::from_script(&first.script_pubkey);
        let reference = TxReference::new(chosen.txid, 0).with_fee(Some(chosen.fee.unwrap_or(0)));
        if let Some(status) = status_of(&[reference]) {
            self.engine.cache().expect_rebroadcast_echo(hash, status);
        }

        match self.engine.broadcaster().broadcast_to_server(&chosen.tx) {
            Ok(txid) => {
                log::debug!("[DECOY] Rebroadcast {}", txid);
                Some(txid)
            }
            Err(e) => {
                log::debug!("[DECOY] Rebroadcast of {} failed: {}", chosen.txid, e);
                None
            }
        }
    }

    /// Subscribes one or two random hashes when `hash` echoes the status
    /// expected from a rebroadcast.
    pub fn on_status_notification(&self, hash: &ScriptHash, status: Option<&StatusString>) {
        let Some(expected) = self.engine.cache().take_rebroadcast_echo(hash) else {
            return;
        };
        if status == Some(&expected) {
            let hashes = self.engine.with_rng_mut(|rng| random_hashes(rng, 1..=2));
            self.subscribe(&hashes, self.engine.current_height().unwrap_or(0));
        }
    }

    /// Subscribes a handful of random hashes after the wallet saw new transactions.
    pub fn after_wallet_activity(&self) {
        let hashes = self.engine.with_rng_mut(|rng| random_hashes(rng, 1..=8));
        self.subscribe(&hashes, self.engine.current_height().unwrap_or(0));
    }

    fn expire(&self, height: u32) {
        let cache = self.engine.cache();
        let max_age = self.engine.config().decoy_max_age_blocks;
        let expired: Vec<ScriptHash> = cache
            .decoys()
            .into_iter()
            .filter(|(_, at)| at.saturating_add(max_age) <= height)
            .map(|(hash, _)| hash)
            .collect();
        if expired.is_empty() {
            return;
        }

        let stale: Vec<ScriptHash> = expired.iter().filter(|h| !cache.is_subscribed(h)).copied().collect();
        match self.engine.subscriptions().unsubscribe_hashes(&stale) {
            Ok(true) => log::debug!("[DECOY] Unsubscribed {} expired decoys", stale.len()),
            Ok(false) => {}
            Err(e) => log::debug!("[DECOY] Could not unsubscribe decoys: {}", e),
        }
        cache.remove_decoys(&expired);
    }

    fn subscribe(&self, hashes: &[ScriptHash], height: u32) {
        match self.engine.subscriptions().subscribe_untracked(hashes) {
            Ok(sent) => {
                log::debug!("[DECOY] Subscribed {} decoys", sent.len());
                for hash in sent {
                    self.engine.cache().record_decoy(hash, height);
                }
            }
            Err(e) => log::debug!("[DECOY] Could not subscribe decoys: {}", e),
        }
    }
}

fn random_hashes(rng: &mut impl Rng, count: std::ops::RangeInclusive<usize>) -> Vec<ScriptHash> {
    let n = rng.gen_range(count);
    (0..n).map(|_| ScriptHash::random(rng)).collect()
}
