pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use bitcoin::Network;

use crate::sync::domain::derivation::DescriptorDeriver;
use crate::sync::domain::wallet::{WalletId, WalletState};

pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Builds an in-memory wallet watching the addresses of a descriptor pair.
pub fn setup_wallet(
    id: u64,
    descriptor: &str,
    change_descriptor: Option<&str>,
    network: Network,
    gap_limit: u32,
) -> Result<WalletState> {
    let change_descriptor = change_descriptor.context("Change descriptor required")?;
    let deriver = DescriptorDeriver::parse(descriptor, change_descriptor)?;
    log::info!("[WALLET] Watching {} with gap limit {}", descriptor, gap_limit);
    Ok(WalletState::new(WalletId(id), network, gap_limit, Arc::new(deriver)))
}
