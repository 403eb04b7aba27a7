use std::collections::BTreeMap;

use bitcoin::Txid;

use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::engine::capability::CapabilityProfile;
use crate::sync::error::TransportError;
use crate::sync::types::{BlockSummary, HeaderTip, Notification, ServerVersion, StatusString, TxReference};

/// Raw transaction hex a server sends for a transaction it cannot supply.
pub const UNFETCHABLE_PLACEHOLDER: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Electrum RPC surface used by the engine.
///
/// Calls block until the server answers. Multi-key calls may be sent as a
/// single JSON-RPC batch when the negotiated profile allows it; the result
/// maps are keyed the same way as the request. Timeouts and framing are the
/// implementation's concern, any failure surfaces as a [`TransportError`].
pub trait ElectrumTransport: Send + Sync {
    /// Applies the negotiated capability profile (batching, batch size).
    fn configure(&self, profile: &CapabilityProfile);

    fn ping(&self) -> Result<(), TransportError>;

    fn server_version(
        &self,
        client_name: &str,
        protocol_versions: &[String],
    ) -> Result<ServerVersion, TransportError>;

    fn banner(&self) -> Result<String, TransportError>;

    fn subscribe_block_headers(&self) -> Result<HeaderTip, TransportError>;

    fn subscribe_script_hashes(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Option<StatusString>>, TransportError>;

    fn unsubscribe_script_hashes(&self, hashes: &[ScriptHash]) -> Result<(), TransportError>;

    fn script_hash_history(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Vec<TxReference>>, TransportError>;

    /// Raw transaction hex by txid. A transaction the server could not
    /// supply maps to [`UNFETCHABLE_PLACEHOLDER`].
    fn transactions(&self, txids: &[Txid]) -> Result<BTreeMap<Txid, String>, TransportError>;

    /// Raw 80-byte header hex by height. Heights the server does not know may be absent.
    fn block_headers(&self, heights: &[u32]) -> Result<BTreeMap<u32, String>, TransportError>;

    /// BTC/kB by target; negative when the server has no estimate.
    fn fee_estimates(&self, targets: &[u16]) -> Result<BTreeMap<u16, f64>, TransportError>;

    /// `(sat/vB, vsize)` buckets.
    fn fee_histogram(&self) -> Result<Vec<(f64, u64)>, TransportError>;

    /// BTC/kB, `None` when the server does not report one.
    fn relay_fee(&self) -> Result<Option<f64>, TransportError>;

    /// Returns the txid string the server reports.
    fn broadcast(&self, raw_tx: &str) -> Result<String, TransportError>;

    fn block_stats(&self, heights: &[u32]) -> Result<BTreeMap<u32, BlockSummary>, TransportError>;

    /// Takes the notifications received since the last call.
    fn drain_notifications(&self) -> Vec<Notification>;
}
