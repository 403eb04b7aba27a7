use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bdk_electrum_history_sync::sync::electrum::asynchronous::ElectrumAdapter;
use bdk_electrum_history_sync::sync::runtime::{CancelToken, ConnectionKeepalive};
use bdk_electrum_history_sync::sync::types::{ConnectionInfo, Notification};
use bdk_electrum_history_sync::sync::domain::wallet::WalletState;
use bdk_electrum_history_sync::sync::{EngineConfig, ServerConfig, SyncEngine, WalletHistoryService};
use bdk_electrum_history_sync::{setup_wallet, DEFAULT_GAP_LIMIT};
use bitcoin::Network;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Connect and print server details.
    Info,
    /// Print fee estimates, the mempool histogram and recent blocks.
    Fees,
    /// Sync the wallet once.
    Sync,
    /// Sync, then keep following notifications.
    Watch,
}

#[derive(Debug)]
struct SyncReport {
    total_time: Duration,
    nodes: usize,
    transactions: usize,
    balance: u64,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON engine configuration; the flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    network: Option<Network>,

    #[arg(long)]
    descriptor: Option<String>,

    #[arg(long)]
    change_descriptor: Option<String>,

    #[arg(long, default_value_t = DEFAULT_GAP_LIMIT)]
    gap_limit: u32,

    #[arg(long)]
    electrum_url: Option<String>,

    /// PEM certificate to pin for an ssl:// server.
    #[arg(long)]
    certificate: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Sync)]
    mode: Mode,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let server = config.server.clone().context("No Electrum server configured")?;

    println!("[MAIN] Mode: {:?}", args.mode);
    println!("[MAIN] Connecting to Electrum: {}", server.url);
    let transport = ElectrumAdapter::connect(&server, config.request_timeout(), config.max_batch_size)?;
    let engine = Arc::new(SyncEngine::new(config, Arc::new(transport))?);
    let info = engine.connect()?;
    print_connection(&info);

    match args.mode {
        Mode::Info => {}
        Mode::Fees => run_fees(&engine, &info)?,
        Mode::Sync => {
            let service = WalletHistoryService::new(engine.clone());
            let mut wallet = wallet_from_args(&args, &engine)?;
            let report = run_sync(&service, &mut wallet, &args, &engine)?;
            print_report(&report);
            print_utxos(&wallet);
        }
        Mode::Watch => run_watch(&args, &engine, &info)?,
    }

    Ok(())
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(url) = &args.electrum_url {
        let mut server = ServerConfig::new(url.clone());
        server.certificate = args.certificate.clone();
        config.server = Some(server);
    } else if config.server.is_none() {
        config.server = Some(ServerConfig::new("ssl://electrum.blockstream.info:60002"));
    }
    if let Some(network) = args.network {
        config.network = network;
    }

    config.validate()?;
    Ok(config)
}

fn wallet_from_args(args: &Args, engine: &SyncEngine) -> Result<WalletState> {
    let descriptor = args.descriptor.as_deref().context("--descriptor is required for this mode")?;
    setup_wallet(
        1,
        descriptor,
        args.change_descriptor.as_deref(),
        engine.config().network,
        args.gap_limit,
    )
}

fn run_sync(
    service: &WalletHistoryService,
    wallet: &mut WalletState,
    args: &Args,
    engine: &SyncEngine,
) -> Result<SyncReport> {
    println!("[SYNC] Starting wallet sync...");
    let t0 = Instant::now();
    let cancel = CancelToken::new();

    match service.sync_wallet(wallet, &cancel) {
        Ok(outcome) => {
            log::info!("[SYNC] {} nodes updated", outcome.updated_nodes.len());
        }
        Err(e) if e.requires_full_resync() => {
            println!("[SYNC] Every used address changed history, starting over...");
            service.clear_wallet_history(wallet);
            *wallet = wallet_from_args(args, engine)?;
            service.sync_wallet(wallet, &cancel)?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(SyncReport {
        total_time: t0.elapsed(),
        nodes: wallet.all_nodes().count(),
        transactions: wallet.transactions().len(),
        balance: wallet.all_nodes().map(|n| n.outputs().balance().to_sat()).sum(),
    })
}

fn run_watch(args: &Args, engine: &Arc<SyncEngine>, info: &ConnectionInfo) -> Result<()> {
    let service = WalletHistoryService::new(engine.clone());
    let mut wallet = wallet_from_args(args, engine)?;
    print_report(&run_sync(&service, &mut wallet, args, engine)?);

    let cancel = CancelToken::new();
    let keepalive = ConnectionKeepalive::new(engine.clone(), info.minimum_relay_fee, Instant::now());
    let mut handle = keepalive.spawn(info.fee_rates.clone(), cancel.clone())?;
    println!("[WATCH] Following notifications...");

    while let Some(notification) = handle.next_notification() {
        match notification {
            Notification::NewTip(tip) => println!("[WATCH] New block {}", tip.height),
            Notification::ScriptHashStatus { hash, .. } => {
                let Some(key) = wallet.script_hash_index().get(&hash).copied() else {
                    continue;
                };
                match service.sync_nodes(&mut wallet, &[key], &cancel) {
                    Ok(outcome) => println!(
                        "[WATCH] {} changed, {} new transactions",
                        key,
                        outcome.new_transactions.len()
                    ),
                    Err(e) => log::error!("[WATCH] Sync of {} failed: {}", key, e),
                }
            }
        }
    }

    println!("[WATCH] Connection closed");
    Ok(())
}

fn run_fees(engine: &SyncEngine, info: &ConnectionInfo) -> Result<()> {
    println!("-----------------------------------");
    println!("Min Relay Fee:    {} sat/vB", info.minimum_relay_fee);
    for (target, rate) in &info.fee_rates.target_block_fee_rates {
        println!("{:>3} blocks:       {:.2} sat/vB", target, rate);
    }
    if let Some(median) = info.fee_rates.next_block_median_fee_rate {
        println!("Next Block:       {:.2} sat/vB", median);
    }
    println!("-----------------------------------");
    for bucket in &info.fee_rates.mempool_rate_sizes {
        println!("{:>10.2} sat/vB  {:>12} vB", bucket.fee_rate, bucket.vsize);
    }
    println!("-----------------------------------");
    for (height, summary) in engine.fees().recent_block_summaries()? {
        println!("Block {:<10} time {}", height, summary.timestamp);
    }
    println!("-----------------------------------");
    Ok(())
}

fn print_connection(info: &ConnectionInfo) {
    println!("-----------------------------------");
    println!("Server:           {}", info.server_version.server_software);
    println!("Protocol:         {}", info.server_version.protocol_version);
    println!("Tip Height:       {}", info.tip.height);
    println!("-----------------------------------");
    log::debug!("[MAIN] Banner: {}", info.banner);
}

fn print_utxos(wallet: &WalletState) {
    for node in wallet.all_nodes() {
        for output in node.outputs().unspent() {
            let state = if output.height > 0 { "confirmed" } else { "unconfirmed" };
            println!("{:<10} {} {:>12} sats  {}", node.key(), output.outpoint, output.value.to_sat(), state);
        }
    }
}

fn print_report(report: &SyncReport) {
    println!("[SYNC] Sync Finished");
    println!("-----------------------------------");
    println!("Total Time:       {:?}", report.total_time);
    println!("Address Nodes:    {}", report.nodes);
    println!("Transactions:     {}", report.transactions);
    println!("Total Balance:    {} sats", report.balance);
    println!("-----------------------------------");
}
