//! Error types for history synchronization.
//!
//! Four families reach callers:
//! * [`ConfigError`]: rejected before any RPC is issued.
//! * [`TransportError`]: connection or protocol failure, never retried here.
//! * [`ConsistencyFault`]: the fetched history violates an invariant.
//! * [`Error::FullHistoryChanged`]: the server's view of the wallet moved wholesale,
//!   the caller should discard cached state and resync from scratch.

use std::path::PathBuf;

use bitcoin::{OutPoint, Txid};

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// History consistency fault
    #[error("Consistency fault: {0}")]
    Consistency(#[from] ConsistencyFault),

    /// Every used wallet address changed status at once
    #[error("All used addresses on a non-empty wallet changed history, full resync required")]
    FullHistoryChanged,

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Wallet model error (derivation, unknown node)
    #[error("Wallet error: {0}")]
    Wallet(String),
}

impl Error {
    /// Returns `true` when the caller should discard cached state and start over.
    pub fn requires_full_resync(&self) -> bool {
        matches!(self, Error::FullHistoryChanged)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no server configured")]
    NoServer,

    #[error("invalid server url {url}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("server certificate {0} does not exist")]
    MissingCertificate(PathBuf),

    #[error("could not read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to {server}: {reason}")]
    Connection { server: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("{method} timed out")]
    Timeout { method: String },

    #[error("malformed response to {method}: {reason}")]
    Protocol { method: String, reason: String },

    #[error("connection closed")]
    Disconnected,
}

impl TransportError {
    pub(crate) fn protocol(method: &str, reason: impl ToString) -> Self {
        TransportError::Protocol {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyFault {
    #[error("did not retrieve transaction {0}")]
    MissingTransaction(Txid),

    #[error("could not retrieve transaction {0}")]
    UnfetchableTransaction(Txid),

    #[error("server returned transaction {0} that was not requested")]
    UnrequestedTransaction(Txid),

    #[error("could not retrieve transactions {0:?}")]
    UnresolvedReferences(Vec<Txid>),

    #[error("found spent output {0} but no record of receiving it")]
    SpentWithoutReceipt(OutPoint),

    #[error("output {outpoint} spent by both {first} and {second}")]
    DoubleSpend {
        outpoint: OutPoint,
        first: Txid,
        second: Txid,
    },

    #[error("input spends {0} which is out of range")]
    OutputIndexOutOfRange(OutPoint),

    #[error("server returned txid {received}, expected {expected}")]
    BroadcastTxidMismatch { expected: Txid, received: String },
}
