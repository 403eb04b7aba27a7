//! Electrum wallet history synchronization.
//!
//! * [`domain`]: script hashes, status strings and the wallet model.
//! * [`electrum`]: the transport seam and its implementations.
//! * [`engine`]: per-session state and the sync components.
//! * [`runtime`]: orchestration, keepalive and cancellation.

pub mod config;
pub mod domain;
pub mod electrum;
pub mod engine;
pub mod error;
pub mod external;
pub mod runtime;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{EngineConfig, ServerConfig};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use runtime::orchestrator::{SyncOutcome, WalletHistoryService};
