use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{Network, OutPoint, Transaction, Txid};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::sync::config::{EngineConfig, ServerConfig};
use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::domain::status::status_of;
use crate::sync::domain::wallet::{KeyPurpose, NodeKey};
use crate::sync::electrum::mock::MockElectrumTransport;
use crate::sync::engine::capability::negotiate;
use crate::sync::engine::fees::btc_per_kb_to_sat_per_vb;
use crate::sync::engine::SyncEngine;
use crate::sync::error::{ConsistencyFault, Error};
use crate::sync::external::{BroadcastSource, FeeRateSource};
use crate::sync::testutil::{foreign_script, header_at, test_wallet, TestChain};
use crate::sync::types::{BlockSummary, HeaderTip, HydratedTransaction, Notification, ReferenceSet, TxReference};

// --- Fixtures ---

fn config(network: Network) -> EngineConfig {
    let mut config = EngineConfig::with_server(ServerConfig::new("tcp://127.0.0.1:50001"));
    config.network = network;
    config
}

fn engine(mock: &Arc<MockElectrumTransport>) -> SyncEngine {
    engine_with(config(Network::Regtest), mock)
}

fn engine_with(config: EngineConfig, mock: &Arc<MockElectrumTransport>) -> SyncEngine {
    SyncEngine::new(config, mock.clone())
        .unwrap()
        .with_rng(StdRng::seed_from_u64(7))
}

struct FakeFeeSource {
    recent: Vec<TxReference>,
    rates: BTreeMap<u16, f64>,
}

impl FeeRateSource for FakeFeeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn supports_network(&self, _network: Network) -> bool {
        true
    }

    fn block_target_fee_rates(&self, _current: &BTreeMap<u16, f64>) -> anyhow::Result<BTreeMap<u16, f64>> {
        Ok(self.rates.clone())
    }

    fn next_block_median_fee_rate(&self) -> anyhow::Result<Option<f64>> {
        Ok(Some(12.5))
    }

    fn recent_block_summaries(&self) -> anyhow::Result<Vec<BlockSummary>> {
        anyhow::bail!("not supported")
    }

    fn recent_mempool_transactions(&self) -> anyhow::Result<Vec<TxReference>> {
        Ok(self.recent.clone())
    }
}

struct CountingBroadcaster {
    name: &'static str,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingBroadcaster {
    fn new(name: &'static str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

impl BroadcastSource for CountingBroadcaster {
    fn name(&self) -> &str {
        self.name
    }

    fn supports_network(&self, _network: Network) -> bool {
        true
    }

    fn broadcast(&self, tx: &Transaction) -> anyhow::Result<Txid> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("{} unavailable", self.name);
        }
        Ok(tx.compute_txid())
    }
}

// --- Connection and fees ---

#[test]
fn connect_negotiates_profile_and_floors_fees() {
    let mock = Arc::new(MockElectrumTransport::new());
    {
        let mut s = mock.state();
        s.fee_estimates.insert(1, 0.0002);
        s.fee_estimates.insert(2, 0.000005);
        s.histogram = vec![(5.0, 2_000), (20.0, 1_000)];
    }
    let engine = engine(&mock);

    let info = engine.connect().unwrap();
    assert_eq!(info.server_version.server_software, "Fulcrum 1.9.1");
    assert_eq!(info.tip.height, 100);
    assert_eq!(info.minimum_relay_fee, 1.0);

    let rates = &info.fee_rates.target_block_fee_rates;
    assert_eq!(rates[&1], 20.0);
    // 0.5 sat/vB is below the relay fee.
    assert_eq!(rates[&2], 1.0);
    // No estimate (-1) maps to 1 sat/vB.
    assert_eq!(rates[&50], 1.0);
    assert_eq!(info.fee_rates.mempool_rate_sizes.len(), 2);
    assert!(info.fee_rates.mempool_rate_sizes[0].fee_rate < info.fee_rates.mempool_rate_sizes[1].fee_rate);
    assert_eq!(info.fee_rates.next_block_median_fee_rate, None);

    let profile = negotiate("Fulcrum 1.9.1");
    assert_eq!(engine.profile(), profile);
    assert_eq!(mock.state().profile, Some(profile));
}

#[test]
fn fee_conversion() {
    assert_eq!(btc_per_kb_to_sat_per_vb(0.0001), 10.0);
    assert_eq!(btc_per_kb_to_sat_per_vb(-1.0), 1.0);
    assert_eq!(btc_per_kb_to_sat_per_vb(0.0), 0.0);
}

#[test]
fn estimatefee_error_uses_fallback_rate() {
    let mock = Arc::new(MockElectrumTransport::new());
    mock.fail("blockchain.estimatefee");
    let engine = engine(&mock);

    let rates = engine.fees().target_block_fee_rates().unwrap();
    assert_eq!(rates.len(), engine.config().target_blocks.len());
    assert!(rates.values().all(|r| *r == engine.config().fallback_fee_rate));
}

#[test]
fn missing_relay_fee_defaults_to_one() {
    let mock = Arc::new(MockElectrumTransport::new());
    mock.state().relay_fee = None;
    assert_eq!(engine(&mock).fees().minimum_relay_fee().unwrap(), 1.0);
}

#[test]
fn external_fee_source_overlays_server_rates() {
    let mock = Arc::new(MockElectrumTransport::new());
    mock.state().fee_estimates.insert(1, 0.0002);
    let source = FakeFeeSource {
        recent: Vec::new(),
        rates: [(1, 35.0)].into_iter().collect(),
    };
    let engine = engine(&mock).with_fee_source(Arc::new(source));

    let rates = engine.fees().target_block_fee_rates().unwrap();
    assert_eq!(rates[&1], 35.0);
    assert_eq!(rates[&2], 1.0);
    assert_eq!(engine.fees().next_block_median_fee_rate(), Some(12.5));
}

#[test]
fn block_summaries_fall_back_to_headers() {
    let mock = Arc::new(MockElectrumTransport::new());
    mock.state().headers.insert(99, header_at(99));
    let engine = engine(&mock);
    engine.subscribe_block_headers().unwrap();

    let summaries = engine.fees().recent_block_summaries().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[&99].timestamp, header_at(99).time);
    assert_eq!(summaries[&100].timestamp, header_at(100).time);
    assert_eq!(mock.calls_to("blockchain.block.stats"), 0);
}

// --- Subscriptions ---

#[test]
fn nodes_are_subscribed_once_per_session() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut chain = TestChain::new();
    let mut wallet = test_wallet(3);
    wallet.fill_to_index(KeyPurpose::Receive, 2).unwrap();
    let funded = wallet.node(NodeKey::receive(1)).unwrap().clone();
    mock.confirm(&chain.pay(funded.script(), 5_000), 90);

    let nodes = wallet.address_nodes(KeyPurpose::Receive);
    let states = engine.subscriptions().subscribe_nodes(&wallet, &nodes, 0).unwrap();
    assert!(!states[&NodeKey::receive(0)].needs_fetch());
    assert!(states[&NodeKey::receive(1)].needs_fetch());
    assert_eq!(mock.keys_requested("blockchain.scripthash.subscribe"), 3);
    assert_eq!(engine.cache().subscribed_count(), 3);

    // Second pass is answered from the cache; the funded node still differs.
    let states = engine.subscriptions().subscribe_nodes(&wallet, &nodes, 1).unwrap();
    assert_eq!(states.len(), 2);
    assert!(states[&NodeKey::receive(1)].needs_fetch());
    assert_eq!(mock.keys_requested("blockchain.scripthash.subscribe"), 3);
    assert!(engine.cache().is_subscribed(&funded.script_hash()));
}

#[test]
fn new_header_session_resubscribes() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut wallet = test_wallet(1);
    wallet.fill_to_index(KeyPurpose::Receive, 0).unwrap();
    let nodes = wallet.address_nodes(KeyPurpose::Receive);

    engine.subscriptions().subscribe_nodes(&wallet, &nodes, 0).unwrap();
    engine.subscribe_block_headers().unwrap();
    engine.subscriptions().subscribe_nodes(&wallet, &nodes, 0).unwrap();
    assert_eq!(mock.keys_requested("blockchain.scripthash.subscribe"), 2);
}

// --- Hydration ---

#[test]
fn unfetchable_transaction_becomes_sentinel() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut chain = TestChain::new();
    let good = chain.pay(&foreign_script(1), 1_000);
    let bad = chain.pay(&foreign_script(2), 2_000);
    mock.confirm(&good, 50);
    mock.confirm(&bad, 51);
    mock.state().unfetchable.insert(bad.compute_txid());

    let references: BTreeMap<Txid, TxReference> = [
        TxReference::new(good.compute_txid(), 50),
        TxReference::new(bad.compute_txid(), 51),
    ]
    .into_iter()
    .map(|r| (r.txid, r))
    .collect();
    let result = engine.hydrator().hydrate(&references, HashMap::new()).unwrap();

    assert_eq!(result.len(), 2);
    assert!(result[&bad.compute_txid()].is_unfetchable());
    let fetched = result[&good.compute_txid()].as_fetched().unwrap();
    assert_eq!(fetched.height, 50);
    assert_eq!(fetched.block_time, Some(header_at(50).time));
}

#[test]
fn unrequested_transaction_is_a_fault() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut chain = TestChain::new();
    let tx = chain.pay(&foreign_script(1), 1_000);
    mock.add_mempool(&tx, 0, 200);
    mock.state().unrequested = Some(chain.pay(&foreign_script(3), 3_000));

    let references: BTreeMap<Txid, TxReference> =
        [(tx.compute_txid(), TxReference::new(tx.compute_txid(), 0))].into_iter().collect();
    let err = engine.hydrator().hydrate(&references, HashMap::new()).unwrap_err();
    assert!(matches!(err, Error::Consistency(ConsistencyFault::UnrequestedTransaction(_))));
}

#[test]
fn unrequested_placeholder_is_a_fault() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);
    mock.add_mempool(&tx, 0, 200);
    let stray = Txid::from_byte_array([4; 32]);
    mock.state().unrequested_placeholder = Some(stray);

    let references: BTreeMap<Txid, TxReference> =
        [(tx.compute_txid(), TxReference::new(tx.compute_txid(), 0))].into_iter().collect();
    let err = engine.hydrator().hydrate(&references, HashMap::new()).unwrap_err();
    match err {
        Error::Consistency(ConsistencyFault::UnrequestedTransaction(txid)) => assert_eq!(txid, stray),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn missing_transaction_is_unresolved() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let txid = Txid::from_byte_array([9; 32]);

    let references: BTreeMap<Txid, TxReference> = [(txid, TxReference::new(txid, 0))].into_iter().collect();
    let err = engine.hydrator().hydrate(&references, HashMap::new()).unwrap_err();
    match err {
        Error::Consistency(ConsistencyFault::UnresolvedReferences(txids)) => assert_eq!(txids, vec![txid]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn deep_confirmations_are_cached() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    engine.subscribe_block_headers().unwrap();
    let mut chain = TestChain::new();
    let mut wallet = test_wallet(1);
    wallet.fill_to_index(KeyPurpose::Receive, 1).unwrap();
    let deep = chain.pay(wallet.node(NodeKey::receive(0)).unwrap().script(), 1_000);
    let shallow = chain.pay(wallet.node(NodeKey::receive(1)).unwrap().script(), 1_000);
    mock.confirm(&deep, 90);
    mock.confirm(&shallow, 99);

    let references: BTreeMap<NodeKey, ReferenceSet> = [
        (NodeKey::receive(0), [TxReference::new(deep.compute_txid(), 90)].into_iter().collect()),
        (NodeKey::receive(1), [TxReference::new(shallow.compute_txid(), 99)].into_iter().collect()),
    ]
    .into_iter()
    .collect();
    let mut staged = HashMap::new();
    let count = engine
        .hydrator()
        .hydrate_referenced(&wallet, &references, &mut staged)
        .unwrap();

    assert_eq!(count, 2);
    assert!(engine.cache().cached_transaction(&deep.compute_txid()).is_some());
    assert!(engine.cache().cached_transaction(&shallow.compute_txid()).is_none());

    // A second wallet referencing the deep transaction does not fetch it again.
    let before = mock.keys_requested("blockchain.transaction.get");
    let mut other = HashMap::new();
    let references: BTreeMap<NodeKey, ReferenceSet> =
        [(NodeKey::receive(0), [TxReference::new(deep.compute_txid(), 90)].into_iter().collect())]
            .into_iter()
            .collect();
    engine
        .hydrator()
        .hydrate_referenced(&test_wallet(1), &references, &mut other)
        .unwrap();
    assert_eq!(mock.keys_requested("blockchain.transaction.get"), before);
    assert!(matches!(other.get(&deep.compute_txid()), Some(HydratedTransaction::Fetched(_))));
}

// --- Broadcast ---

#[test]
fn broadcast_txid_mismatch_is_reported() {
    let mock = Arc::new(MockElectrumTransport::new());
    mock.state().broadcast_reply = Some("ff".repeat(32));
    let engine = engine(&mock);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);

    let err = engine.broadcaster().broadcast(&tx, Some(300)).unwrap_err();
    match err {
        Error::Consistency(ConsistencyFault::BroadcastTxidMismatch { expected, received }) => {
            assert_eq!(expected, tx.compute_txid());
            assert_eq!(received, "ff".repeat(32));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(engine.cache().broadcast(&tx.compute_txid()).is_none());
}

#[test]
fn broadcast_is_remembered_until_confirmed() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);

    let txid = engine.broadcaster().broadcast(&tx, Some(300)).unwrap();
    assert_eq!(txid, tx.compute_txid());
    assert_eq!(mock.state().broadcasts.len(), 1);
    let recorded = engine.cache().broadcast(&txid).unwrap();
    assert_eq!(recorded.fee, Some(300));
    assert_eq!(recorded.height, 0);
}

#[test]
fn proxy_broadcast_uses_external_sources() {
    let mock = Arc::new(MockElectrumTransport::new());
    let mut config = config(Network::Bitcoin);
    config.proxy = Some("127.0.0.1:9050".into());
    let ok = CountingBroadcaster::new("ok", false);
    let down = CountingBroadcaster::new("down", true);
    let engine = engine_with(config, &mock)
        .with_broadcast_sources(vec![ok.clone() as Arc<dyn BroadcastSource>, down.clone() as Arc<dyn BroadcastSource>]);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);

    let txid = engine.broadcaster().broadcast_privately(&tx).unwrap();
    assert_eq!(txid, tx.compute_txid());
    // Mainnet wants two acceptances; with only one working source every source is tried.
    assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    assert_eq!(down.calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.calls_to("blockchain.transaction.broadcast"), 0);
}

#[test]
fn proxy_broadcast_on_mainnet_needs_two_acceptances() {
    for seed in 0..32 {
        let mock = Arc::new(MockElectrumTransport::new());
        let mut config = config(Network::Bitcoin);
        config.proxy = Some("127.0.0.1:9050".into());
        let down = CountingBroadcaster::new("down", true);
        let a = CountingBroadcaster::new("a", false);
        let b = CountingBroadcaster::new("b", false);
        let engine = engine_with(config, &mock)
            .with_rng(StdRng::seed_from_u64(seed))
            .with_broadcast_sources(vec![
                down.clone() as Arc<dyn BroadcastSource>,
                a.clone() as Arc<dyn BroadcastSource>,
                b.clone() as Arc<dyn BroadcastSource>,
            ]);
        let tx = TestChain::new().pay(&foreign_script(1), 1_000);

        assert_eq!(engine.broadcaster().broadcast_privately(&tx).unwrap(), tx.compute_txid());
        assert_eq!(
            a.calls.load(Ordering::SeqCst) + b.calls.load(Ordering::SeqCst),
            2,
            "seed {}",
            seed
        );
        assert_eq!(mock.calls_to("blockchain.transaction.broadcast"), 0);
    }
}

#[test]
fn proxy_broadcast_falls_back_to_server() {
    let mock = Arc::new(MockElectrumTransport::new());
    let mut config = config(Network::Bitcoin);
    config.proxy = Some("127.0.0.1:9050".into());
    let down = CountingBroadcaster::new("down", true);
    let engine = engine_with(config, &mock).with_broadcast_sources(vec![down.clone() as Arc<dyn BroadcastSource>]);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);

    assert_eq!(engine.broadcaster().broadcast_privately(&tx).unwrap(), tx.compute_txid());
    assert_eq!(down.calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.calls_to("blockchain.transaction.broadcast"), 1);
}

#[test]
fn proxy_broadcast_off_mainnet_stops_after_first_success() {
    let mock = Arc::new(MockElectrumTransport::new());
    let mut config = config(Network::Testnet);
    config.proxy = Some("127.0.0.1:9050".into());
    let a = CountingBroadcaster::new("a", false);
    let b = CountingBroadcaster::new("b", false);
    let engine = engine_with(config, &mock)
        .with_broadcast_sources(vec![a.clone() as Arc<dyn BroadcastSource>, b.clone() as Arc<dyn BroadcastSource>]);
    let tx = TestChain::new().pay(&foreign_script(1), 1_000);

    engine.broadcaster().broadcast_privately(&tx).unwrap();
    assert_eq!(a.calls.load(Ordering::SeqCst) + b.calls.load(Ordering::SeqCst), 1);
}

// --- Decoys ---

fn decoy_engine(mock: &Arc<MockElectrumTransport>) -> (SyncEngine, Vec<Transaction>) {
    let mut chain = TestChain::new();
    let txs: Vec<Transaction> = (0..4)
        .map(|i| {
            let tx = chain.pay(&foreign_script(10 + i), 1_000 + i as u64);
            mock.add_mempool(&tx, 0, 150);
            tx
        })
        .collect();
    let source = FakeFeeSource {
        recent: txs
            .iter()
            .map(|tx| TxReference::new(tx.compute_txid(), 0).with_fee(Some(150)))
            .collect(),
        rates: BTreeMap::new(),
    };
    let engine = engine(mock).with_fee_source(Arc::new(source));
    engine.connect().unwrap();
    (engine, txs)
}

#[test]
fn new_block_subscribes_untracked_decoys() {
    let mock = Arc::new(MockElectrumTransport::new());
    let (engine, _) = decoy_engine(&mock);

    let plan = engine.decoys().on_new_block(101).unwrap();
    assert!(!plan.candidates.is_empty());
    assert!(plan.candidates.len() <= 2);
    assert!(plan.delay.as_secs() <= 600);

    let decoys = engine.cache().decoys();
    assert!(!decoys.is_empty());
    for (hash, height) in &decoys {
        assert_eq!(*height, 101);
        assert!(!engine.cache().is_subscribed(hash));
        assert!(mock.state().subscribed.contains(hash));
    }
}

#[test]
fn old_decoys_are_unsubscribed() {
    let mock = Arc::new(MockElectrumTransport::new());
    let (engine, _) = decoy_engine(&mock);
    engine.decoys().on_new_block(101);
    let first: Vec<ScriptHash> = engine.cache().decoys().into_iter().map(|(h, _)| h).collect();

    // Three blocks is the limit; at 103 nothing is old enough yet.
    engine.decoys().on_new_block(103);
    assert!(mock.state().unsubscribed.is_empty());

    engine.decoys().on_new_block(106);
    let unsubscribed = mock.state().unsubscribed.clone();
    assert!(first.iter().all(|h| unsubscribed.contains(h)));
    assert!(engine.cache().decoys().iter().all(|(_, height)| *height == 106));
}

#[test]
fn decoys_never_touch_wallet_subscriptions() {
    let mock = Arc::new(MockElectrumTransport::new());
    let (engine, txs) = decoy_engine(&mock);

    // The wallet watches the first output of a recent mempool transaction.
    let hash = ScriptHash::from_script(&txs[0].output[0].script_pubkey);
    engine.cache().record_subscribed(hash, None);
    engine.decoys().on_new_block(101);
    assert!(engine.cache().decoys().iter().all(|(h, _)| *h != hash));
}

#[test]
fn rebroadcast_echo_triggers_more_decoys() {
    let mock = Arc::new(MockElectrumTransport::new());
    let (engine, _) = decoy_engine(&mock);
    let plan = engine.decoys().on_new_block(101).unwrap();

    let mut rebroadcast = None;
    for _ in 0..64 {
        rebroadcast = engine.decoys().execute_rebroadcast(&plan);
        if rebroadcast.is_some() {
            break;
        }
    }
    let txid = rebroadcast.expect("a rebroadcast within 64 coin flips");
    let chosen = plan.candidates.iter().find(|c| c.txid == txid).unwrap();
    let hash = ScriptHash::from_script(&chosen.tx.output[0].script_pubkey);
    let status = status_of(&[TxReference::new(txid, 0)]);

    let before = mock.keys_requested("blockchain.scripthash.subscribe");
    engine.handle_notification(&Notification::ScriptHashStatus { hash, status });
    let added = mock.keys_requested("blockchain.scripthash.subscribe") - before;
    assert!((1..=2).contains(&added));
}

#[test]
fn no_decoys_behind_proxy() {
    let mock = Arc::new(MockElectrumTransport::new());
    let mut config = config(Network::Regtest);
    config.proxy = Some("127.0.0.1:9050".into());
    let engine = engine_with(config, &mock);
    engine.connect().unwrap();

    let tip = HeaderTip {
        height: 101,
        header: header_at(101),
    };
    assert!(engine.handle_notification(&Notification::NewTip(tip)).is_none());
    assert_eq!(engine.current_height(), Some(101));
    assert!(engine.cache().decoys().is_empty());
    assert_eq!(mock.calls_to("blockchain.scripthash.subscribe"), 0);
}

// --- Server switching ---

#[test]
fn server_change_drops_session_state() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    engine.connect().unwrap();
    let hash = ScriptHash::from_script(&foreign_script(1));
    engine.cache().set_retrieved(hash, status_of(&[TxReference::new(Txid::from_byte_array([1; 32]), 5)]));
    let epoch = engine.epoch();

    let same = engine.server().unwrap();
    assert!(!engine.set_server(same, mock.clone()));
    assert!(engine.cache().retrieved_status(&hash).is_some());

    let other = Arc::new(MockElectrumTransport::new());
    assert!(engine.set_server(ServerConfig::new("tcp://127.0.0.2:50001"), other));
    assert!(engine.cache().retrieved_status(&hash).is_none());
    assert!(engine.tip().is_none());
    assert_eq!(engine.epoch(), epoch + 1);
}

// --- One-off queries ---

#[test]
fn address_utxos_excludes_spent_outputs() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut chain = TestChain::new();
    let script = foreign_script(4);
    let first = chain.pay(&script, 1_000);
    let second = chain.pay(&script, 2_000);
    mock.confirm(&first, 10);
    mock.confirm(&second, 11);
    let spend = chain.spend(&[OutPoint::new(first.compute_txid(), 0)], &[(&foreign_script(5), 900)]);
    mock.add_mempool(&spend, 0, 100);

    let utxos = engine.address_utxos(&script).unwrap();
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].0, OutPoint::new(second.compute_txid(), 0));
    assert_eq!(utxos[0].1.value.to_sat(), 2_000);
}

#[test]
fn mempool_script_hashes() {
    let mock = Arc::new(MockElectrumTransport::new());
    let engine = engine(&mock);
    let mut chain = TestChain::new();
    let mut wallet = test_wallet(1);
    wallet.fill_to_index(KeyPurpose::Receive, 2).unwrap();
    let node = wallet.node(NodeKey::receive(2)).unwrap().clone();
    let tx = chain.pay(node.script(), 1_000);
    mock.add_mempool(&tx, 0, 100);

    let nodes = wallet.address_nodes(KeyPurpose::Receive);
    let hashes = engine.mempool_script_hashes(&wallet, &tx.compute_txid(), &nodes).unwrap();
    assert_eq!(hashes.into_iter().collect::<Vec<_>>(), vec![node.script_hash()]);
}
