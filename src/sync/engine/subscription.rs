//! Script hash subscriptions.
//!
//! A node needs its history fetched when the server's status for it differs
//! from the status we last fetched, or from what its known outputs imply.
//! Hashes are subscribed at most once per session; later status changes
//! arrive as notifications and are appended to the status history.

use std::collections::{BTreeMap, HashSet};

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::wallet::{NodeKey, WalletState};
use crate::sync::engine::SyncEngine;
use crate::sync::error::Result;
use crate::sync::types::StatusString;

/// Outcome of subscribing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// History is unchanged since it was last fetched.
    Current(Option<StatusString>),
    /// History must be fetched.
    NeedsFetch,
}

impl SubscriptionState {
    pub fn needs_fetch(&self) -> bool {
        matches!(self, SubscriptionState::NeedsFetch)
    }
}

pub struct SubscriptionManager<'a> {
    engine: &'a SyncEngine,
}

impl<'a> SubscriptionManager<'a> {
    pub(crate) fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// Subscribes `nodes` with index at least `start_index`.
    ///
    /// Already subscribed nodes are checked against the cache without any
    /// RPC. The rest are subscribed in a single call, one request per unique
    /// hash.
    pub fn subscribe_nodes(
        &self,
        wallet: &WalletState,
        nodes: &[NodeKey],
        start_index: u32,
    ) -> Result<BTreeMap<NodeKey, SubscriptionState>> {
        let cache = self.engine.cache();
        let mut states = BTreeMap::new();
        let mut pending: BTreeMap<ScriptHash, Vec<NodeKey>> = BTreeMap::new();

        for key in nodes.iter().filter(|k| k.index >= start_index) {
            let Some(node) = wallet.node(*key) else {
                log::error!("[SUBSCRIBE] {} has no node {}", wallet.id(), key);
                continue;
            };
            let hash = node.script_hash();

            if cache.is_subscribed(&hash) {
                let state = match cache.subscribed_status(&hash) {
                    Some(subscribed) => {
                        let fetched = cache.retrieved_status(&hash);
                        let local = cache.local_status(node);
                        if fetched.as_ref() != Some(&subscribed) || local.as_ref() != Some(&subscribed) {
                            SubscriptionState::NeedsFetch
                        } else {
                            SubscriptionState::Current(Some(subscribed))
                        }
                    }
                    None => SubscriptionState::Current(None),
                };
                states.insert(*key, state);
            } else {
                pending.entry(hash).or_default().push(*key);
            }
        }

        if pending.is_empty() {
            return Ok(states);
        }

        log::debug!("[SUBSCRIBE] {} subscribing to {} script hashes", wallet.id(), pending.len());
        let hashes: Vec<ScriptHash> = pending.keys().copied().collect();
        let statuses = self.engine.transport().subscribe_script_hashes(&hashes)?;

        for (hash, status) in statuses {
            let Some(keys) = pending.get(&hash) else {
                log::warn!("[SUBSCRIBE] Server answered for unrequested hash {}", hash);
                continue;
            };

            let changed = status.is_some() && status != cache.retrieved_status(&hash);
            let state = if changed {
                SubscriptionState::NeedsFetch
            } else {
                SubscriptionState::Current(status.clone())
            };
            for key in keys {
                states.insert(*key, state.clone());
            }
            cache.record_subscribed(hash, status);
        }

        Ok(states)
    }

    /// Subscribes hashes that do not belong to any wallet.
    ///
    /// Hashes already subscribed for a wallet are skipped. The statuses are
    /// not recorded, so these hashes never look like wallet subscriptions.
    /// Returns the hashes actually sent.
    pub fn subscribe_untracked(&self, hashes: &[ScriptHash]) -> Result<Vec<ScriptHash>> {
        let cache = self.engine.cache();
        let mut seen = HashSet::new();
        let fresh: Vec<ScriptHash> = hashes
            .iter()
            .copied()
            .filter(|h| !cache.is_subscribed(h) && seen.insert(*h))
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        self.engine.transport().subscribe_script_hashes(&fresh)?;
        Ok(fresh)
    }

    /// Unsubscribes `hashes` when the server supports it. Returns `false`
    /// when it does not, in which case nothing is sent.
    pub fn unsubscribe_hashes(&self, hashes: &[ScriptHash]) -> Result<bool> {
        if hashes.is_empty() {
            return Ok(true);
        }
        if !self.engine.profile().supports_unsubscribe {
            return Ok(false);
        }
        self.engine.transport().unsubscribe_script_hashes(hashes)?;
        Ok(true)
    }
}
