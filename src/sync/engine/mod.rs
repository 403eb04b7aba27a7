//! Wallet history synchronization engine.
//!
//! [`SyncEngine`] owns everything shared by one server session: the
//! transport, the [`StatusCache`], the negotiated capability profile, the
//! chain tip and the randomness used by the privacy features. The
//! components (subscriptions, reconciler, hydrator, UTXO graph, fees,
//! broadcast, decoys) are thin views borrowed from the engine, so several
//! wallets can be reconciled concurrently against the same session.
//!
//! # Guarantees
//! * **No partial merges**: components stage their results; only the
//!   orchestrator writes to a wallet.
//! * **Deterministic under test**: randomness comes from an injectable
//!   [`StdRng`].

pub mod capability;
pub mod decoy;
pub mod fees;
pub mod hydrator;
pub mod reconciler;
pub mod state;
pub mod subscription;
pub mod utxo_graph;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::{OutPoint, Script, Transaction, TxOut, Txid};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::sync::config::{EngineConfig, ServerConfig};
use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::wallet::{NodeKey, WalletState};
use crate::sync::electrum::api::ElectrumTransport;
use crate::sync::error::Result;
use crate::sync::external::{BroadcastSource, FeeRateSource};
use crate::sync::runtime::cancel::CancelToken;
use crate::sync::types::{ConnectionInfo, HeaderTip, Notification};

use capability::{negotiate, CapabilityProfile};
use decoy::{DecoyScheduler, RebroadcastPlan};
use fees::{Broadcaster, FeeEstimator};
use hydrator::TransactionHydrator;
use reconciler::HistoryReconciler;
use state::StatusCache;
use subscription::SubscriptionManager;

pub struct SyncEngine {
    config: EngineConfig,
    transport: RwLock<Arc<dyn ElectrumTransport>>,
    cache: StatusCache,
    profile: RwLock<CapabilityProfile>,
    tip: RwLock<Option<HeaderTip>>,
    server: RwLock<Option<ServerConfig>>,
    rng: Mutex<StdRng>,
    fee_source: Option<Arc<dyn FeeRateSource>>,
    broadcast_sources: Vec<Arc<dyn BroadcastSource>>,
    /// Bumped whenever the cache is dropped; wallets seeded in an older epoch seed again.
    epoch: AtomicU64,
}

impl SyncEngine {
    /// Creates an engine for the configured server. The configuration is
    /// validated here, before any RPC is issued.
    pub fn new(config: EngineConfig, transport: Arc<dyn ElectrumTransport>) -> Result<Self> {
        config.validate()?;
        let server = config.server.clone();
        Ok(Self {
            config,
            transport: RwLock::new(transport),
            cache: StatusCache::new(),
            profile: RwLock::new(CapabilityProfile::default()),
            tip: RwLock::new(None),
            server: RwLock::new(server),
            rng: Mutex::new(StdRng::from_entropy()),
            fee_source: None,
            broadcast_sources: Vec::new(),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn with_fee_source(mut self, source: Arc<dyn FeeRateSource>) -> Self {
        self.fee_source = Some(source);
        self
    }

    pub fn with_broadcast_sources(mut self, sources: Vec<Arc<dyn BroadcastSource>>) -> Self {
        self.broadcast_sources = sources;
        self
    }

    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.rng.lock() = rng;
        self
    }

    // =====================================================================
    // Accessors
    // =====================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn transport(&self) -> Arc<dyn ElectrumTransport> {
        self.transport.read().clone()
    }

    pub fn profile(&self) -> CapabilityProfile {
        *self.profile.read()
    }

    pub fn tip(&self) -> Option<HeaderTip> {
        *self.tip.read()
    }

    pub fn current_height(&self) -> Option<u32> {
        self.tip.read().map(|t| t.height)
    }

    pub fn server(&self) -> Option<ServerConfig> {
        self.server.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn using_proxy(&self) -> bool {
        self.config.using_proxy()
    }

    pub(crate) fn fee_source(&self) -> Option<&Arc<dyn FeeRateSource>> {
        self.fee_source
            .as_ref()
            .filter(|s| s.supports_network(self.config.network))
    }

    pub(crate) fn broadcast_sources(&self) -> Vec<Arc<dyn BroadcastSource>> {
        self.broadcast_sources
            .iter()
            .filter(|s| s.supports_network(self.config.network))
            .cloned()
            .collect()
    }

    pub(crate) fn with_rng_mut<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        f(&mut self.rng.lock())
    }

    // =====================================================================
    // Components
    // =====================================================================

    pub fn subscriptions(&self) -> SubscriptionManager<'_> {
        SubscriptionManager::new(self)
    }

    pub fn decoys(&self) -> DecoyScheduler<'_> {
        DecoyScheduler::new(self)
    }

    pub fn reconciler<'a>(&'a self, cancel: &'a CancelToken) -> HistoryReconciler<'a> {
        HistoryReconciler::new(self, cancel)
    }

    pub fn hydrator(&self) -> TransactionHydrator<'_> {
        TransactionHydrator::new(self)
    }

    pub fn fees(&self) -> FeeEstimator<'_> {
        FeeEstimator::new(self)
    }

    pub fn broadcaster(&self) -> Broadcaster<'_> {
        Broadcaster::new(self)
    }

    // =====================================================================
    // Session lifecycle
    // =====================================================================

    /// Brings up a session: version handshake, capability negotiation,
    /// header subscription, banner and initial fee data.
    pub fn connect(&self) -> Result<ConnectionInfo> {
        self.config.validate()?;
        let transport = self.transport();

        let server_version =
            transport.server_version(&self.config.client_name, &self.config.protocol_versions)?;
        let profile = negotiate(&server_version.server_software);
        log::info!(
            "[ENGINE] Connected to {} (protocol {}), batching={} unsubscribe={}",
            server_version.server_software,
            server_version.protocol_version,
            profile.supports_batching,
            profile.supports_unsubscribe
        );
        *self.profile.write() = profile;
        transport.configure(&profile);

        let tip = self.subscribe_block_headers()?;
        let banner = transport.banner()?;

        let fees = self.fees();
        let minimum_relay_fee = fees.minimum_relay_fee()?;
        let fee_rates = fees.fee_rates_update(minimum_relay_fee)?;

        Ok(ConnectionInfo {
            server_version,
            banner,
            tip,
            fee_rates,
            minimum_relay_fee,
        })
    }

    /// Subscribes to block headers, which starts a fresh subscription
    /// session on the server.
    pub fn subscribe_block_headers(&self) -> Result<HeaderTip> {
        let tip = self.transport().subscribe_block_headers()?;
        self.cache.clear_subscriptions();
        self.record_tip(tip);
        log::debug!("[ENGINE] Chain tip at {}", tip.height);
        Ok(tip)
    }

    /// Switches to `server` over `transport`. Returns `true` when the server
    /// differs from the previous one, in which case every cached status,
    /// transaction and header is dropped.
    pub fn set_server(&self, server: ServerConfig, transport: Arc<dyn ElectrumTransport>) -> bool {
        *self.transport.write() = transport;
        let previous = self.server.write().replace(server.clone());
        if previous.as_ref() == Some(&server) {
            return false;
        }

        log::info!("[ENGINE] Server changed to {}, clearing caches", server.url);
        self.cache.clear();
        *self.tip.write() = None;
        *self.profile.write() = CapabilityProfile::default();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn record_tip(&self, tip: HeaderTip) {
        self.cache.insert_header(tip.height, tip.header);
        *self.tip.write() = Some(tip);
    }

    /// Applies a server notification to the session state.
    ///
    /// A new block may schedule a decoy rebroadcast; the caller decides when
    /// to run it.
    pub fn handle_notification(&self, notification: &Notification) -> Option<RebroadcastPlan> {
        match notification {
            Notification::ScriptHashStatus { hash, status } => {
                log::debug!("[ENGINE] Status update for {}", hash);
                if self.cache.is_subscribed(hash) {
                    self.cache.record_subscribed(*hash, status.clone());
                }
                if !self.using_proxy() {
                    self.decoys().on_status_notification(hash, status.as_ref());
                }
                None
            }
            Notification::NewTip(tip) => {
                log::info!("[ENGINE] New block at height {}", tip.height);
                self.record_tip(*tip);
                if self.using_proxy() {
                    None
                } else {
                    self.decoys().on_new_block(tip.height)
                }
            }
        }
    }

    // =====================================================================
    // One-off queries
    // =====================================================================

    /// Hashes among `nodes` whose server history lists `txid` as unconfirmed.
    pub fn mempool_script_hashes(
        &self,
        wallet: &WalletState,
        txid: &Txid,
        nodes: &[NodeKey],
    ) -> Result<BTreeSet<ScriptHash>> {
        let hashes: Vec<ScriptHash> = nodes
            .iter()
            .filter_map(|k| wallet.node(*k))
            .map(|n| n.script_hash())
            .collect();
        if hashes.is_empty() {
            return Ok(BTreeSet::new());
        }

        let history = self.transport().script_hash_history(&hashes)?;
        Ok(history
            .into_iter()
            .filter(|(_, refs)| refs.iter().any(|r| r.txid == *txid && !r.is_confirmed()))
            .map(|(hash, _)| hash)
            .collect())
    }

    /// Unspent outputs paying to `script`, according to the server.
    ///
    /// Transactions the server cannot supply are skipped.
    pub fn address_utxos(&self, script: &Script) -> Result<Vec<(OutPoint, TxOut)>> {
        let hash = ScriptHash::from_script(script);
        let transport = self.transport();
        let history = transport.script_hash_history(&[hash])?;
        let txids: BTreeSet<Txid> = history
            .get(&hash)
            .map(|refs| refs.iter().map(|r| r.txid).collect())
            .unwrap_or_default();
        if txids.is_empty() {
            return Ok(Vec::new());
        }

        let txids: Vec<Txid> = txids.into_iter().collect();
        let fetched = self.hydrator().fetch_transactions(&txids)?;
        let transactions: Vec<&Transaction> = fetched.values().flatten().collect();

        let mut outputs: Vec<(OutPoint, TxOut)> = transactions
            .iter()
            .flat_map(|tx| {
                let txid = tx.compute_txid();
                tx.output
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.script_pubkey.as_script() == script)
                    .map(move |(vout, o)| (OutPoint::new(txid, vout as u32), o.clone()))
            })
            .collect();

        let spent: BTreeSet<OutPoint> = transactions
            .iter()
            .flat_map(|tx| tx.input.iter().map(|i| i.previous_output))
            .collect();
        outputs.retain(|(outpoint, _)| !spent.contains(outpoint));
        Ok(outputs)
    }
}
