//! Electrum Protocol Adapter (async implementation behind a blocking facade).
//!
//! Implements [`ElectrumTransport`] over a newline-delimited JSON-RPC
//! connection (TCP or TLS) driven by a Tokio runtime on a background thread.
//!
//! # Architecture
//! * **Outgoing queue**: callers serialize requests and push them onto an
//!   unbounded channel; the writer task flushes them to the socket.
//! * **Pending map**: every request id maps to the channel its caller blocks
//!   on. The reader task routes responses (single or batched) by id.
//! * **Notifications**: messages without an id are parsed and queued until
//!   [`ElectrumTransport::drain_notifications`] is called.
//!
//! Multi-key calls are sent as JSON-RPC batches when the negotiated profile
//! allows it, otherwise one request per key, all in flight at once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{block, Txid};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_native_tls::TlsConnector;

use crate::sync::config::ServerConfig;
use crate::sync::domain::scripthash::ScriptHash;
use crate::sync::electrum::api::{ElectrumTransport, UNFETCHABLE_PLACEHOLDER};
use crate::sync::engine::capability::CapabilityProfile;
use crate::sync::error::TransportError;
use crate::sync::types::{
    BlockSummary, HeaderTip, Notification, ServerVersion, StatusString, TxReference,
};

type Reply = Result<Value, TransportError>;

// =====================================================================
// Shared State
// =====================================================================

struct PendingCall {
    method: &'static str,
    /// Position of the request within its chunk.
    index: usize,
    reply: std::sync::mpsc::Sender<(usize, Reply)>,
}

/// State shared between callers and the reader task.
#[derive(Default)]
pub(crate) struct SharedState {
    pending: HashMap<u64, PendingCall>,
    notifications: VecDeque<Notification>,
    closed: bool,
}

impl SharedState {
    /// Fails every call still waiting; later calls fail immediately.
    fn close(&mut self) {
        self.closed = true;
        for (_, call) in self.pending.drain() {
            let _ = call.reply.send((call.index, Err(TransportError::Disconnected)));
        }
    }
}

// =====================================================================
// Public Client (blocking facade)
// =====================================================================

pub struct ElectrumAdapter {
    server: String,
    shared: Arc<Mutex<SharedState>>,
    outgoing: mpsc::UnboundedSender<String>,
    profile: Mutex<CapabilityProfile>,
    max_batch_size: usize,
    timeout: Duration,
    next_id: AtomicU64,
}

impl ElectrumAdapter {
    /// Connects to `server` and blocks until the socket (and TLS session)
    /// is up or `timeout` elapses.
    ///
    /// A pinned certificate replaces the system roots and hostname checks,
    /// as is usual for self-signed Electrum servers.
    pub fn connect(server: &ServerConfig, timeout: Duration, max_batch_size: usize) -> Result<Self, TransportError> {
        let url = server.url.clone();
        let connection_error = |reason: String| TransportError::Connection {
            server: url.clone(),
            reason,
        };

        let (host, port, tls) = server.endpoint().map_err(|e| connection_error(e.to_string()))?;
        let connector = if tls {
            Some(tls_connector(server.certificate.as_deref()).map_err(&connection_error)?)
        } else {
            None
        };

        let shared = Arc::new(Mutex::new(SharedState::default()));
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let bg_shared = shared.clone();
        std::thread::Builder::new()
            .name("electrum-adapter".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                rt.block_on(async move {
                    let stream = match open_stream(&host, port, connector).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    run_connection(stream, bg_shared, out_rx).await;
                });
            })?;

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(connection_error(reason)),
            Err(_) => return Err(connection_error("timed out".into())),
        }
        log::info!("[ADAPTER] Connected to {}", server.url);

        Ok(Self {
            server: server.url.clone(),
            shared,
            outgoing: out_tx,
            profile: Mutex::new(CapabilityProfile::default()),
            max_batch_size: max_batch_size.max(1),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn batch_size(&self) -> usize {
        let profile = *self.profile.lock();
        if !profile.supports_batching {
            return 1;
        }
        profile
            .max_batch_targets
            .unwrap_or(self.max_batch_size)
            .min(self.max_batch_size)
    }

    fn call(&self, method: &'static str, params: Value) -> Result<Value, TransportError> {
        self.send_requests(method, vec![params])?
            .pop()
            .unwrap_or(Err(TransportError::Disconnected))
    }

    /// Sends one request per entry of `params` and waits for every reply.
    ///
    /// Per-request RPC errors are returned in place; timeouts and
    /// disconnects fail the whole call.
    fn send_requests(&self, method: &'static str, params: Vec<Value>) -> Result<Vec<Reply>, TransportError> {
        let mut replies = Vec::with_capacity(params.len());
        let batch_size = self.batch_size();

        for chunk in params.chunks(batch_size) {
            let (tx, rx) = std::sync::mpsc::channel();
            let mut ids = Vec::with_capacity(chunk.len());
            let mut requests = Vec::with_capacity(chunk.len());
            {
                let mut shared = self.shared.lock();
                if shared.closed {
                    return Err(TransportError::Disconnected);
                }
                for (index, p) in chunk.iter().enumerate() {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    shared.pending.insert(
                        id,
                        PendingCall {
                            method,
                            index,
                            reply: tx.clone(),
                        },
                    );
                    ids.push(id);
                    requests.push(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "method": method,
                        "params": p,
                    }));
                }
            }
            drop(tx);

            let lines: Vec<String> = if batch_size > 1 && requests.len() > 1 {
                vec![Value::Array(requests).to_string()]
            } else {
                requests.iter().map(Value::to_string).collect()
            };
            log::trace!("[ADAPTER] {} x{} in {} messages", method, chunk.len(), lines.len());
            for line in lines {
                if self.outgoing.send(line).is_err() {
                    self.forget(&ids);
                    return Err(TransportError::Disconnected);
                }
            }

            let mut slots: Vec<Option<Reply>> = (0..chunk.len()).map(|_| None).collect();
            let deadline = Instant::now() + self.timeout;
            for _ in 0..chunk.len() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok((index, reply)) => {
                        if let Some(slot) = slots.get_mut(index) {
                            *slot = Some(reply);
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        self.forget(&ids);
                        return Err(TransportError::Timeout {
                            method: method.to_string(),
                        });
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        return Err(TransportError::Disconnected);
                    }
                }
            }
            replies.extend(
                slots
                    .into_iter()
                    .map(|slot| slot.unwrap_or(Err(TransportError::Disconnected))),
            );
        }
        Ok(replies)
    }

    fn forget(&self, ids: &[u64]) {
        let mut shared = self.shared.lock();
        for id in ids {
            shared.pending.remove(id);
        }
    }
}

// =====================================================================
// ElectrumTransport
// =====================================================================

impl ElectrumTransport for ElectrumAdapter {
    fn configure(&self, profile: &CapabilityProfile) {
        *self.profile.lock() = *profile;
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.call("server.ping", json!([])).map(|_| ())
    }

    fn server_version(&self, client_name: &str, protocol_versions: &[String]) -> Result<ServerVersion, TransportError> {
        let versions = match protocol_versions {
            [single] => json!(single),
            many => json!(many),
        };
        let result = self.call("server.version", json!([client_name, versions]))?;
        parse_server_version(&result)
    }

    fn banner(&self) -> Result<String, TransportError> {
        let result = self.call("server.banner", json!([]))?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    fn subscribe_block_headers(&self) -> Result<HeaderTip, TransportError> {
        let result = self.call("blockchain.headers.subscribe", json!([]))?;
        parse_header_tip(&result)
    }

    fn subscribe_script_hashes(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Option<StatusString>>, TransportError> {
        let params = hashes.iter().map(|h| json!([h.to_hex()])).collect();
        let replies = self.send_requests("blockchain.scripthash.subscribe", params)?;
        hashes
            .iter()
            .zip(replies)
            .map(|(hash, reply)| Ok((*hash, parse_status(&reply?))))
            .collect()
    }

    fn unsubscribe_script_hashes(&self, hashes: &[ScriptHash]) -> Result<(), TransportError> {
        let params = hashes.iter().map(|h| json!([h.to_hex()])).collect();
        for reply in self.send_requests("blockchain.scripthash.unsubscribe", params)? {
            reply?;
        }
        Ok(())
    }

    fn script_hash_history(
        &self,
        hashes: &[ScriptHash],
    ) -> Result<BTreeMap<ScriptHash, Vec<TxReference>>, TransportError> {
        let params = hashes.iter().map(|h| json!([h.to_hex()])).collect();
        let replies = self.send_requests("blockchain.scripthash.get_history", params)?;
        hashes
            .iter()
            .zip(replies)
            .map(|(hash, reply)| Ok((*hash, parse_history(&reply?)?)))
            .collect()
    }

    fn transactions(&self, txids: &[Txid]) -> Result<BTreeMap<Txid, String>, TransportError> {
        let params = txids.iter().map(|t| json!([t.to_string(), false])).collect();
        let replies = self.send_requests("blockchain.transaction.get", params)?;
        let mut out = BTreeMap::new();
        for (txid, reply) in txids.iter().zip(replies) {
            let hex = match reply {
                Ok(Value::String(hex)) => hex,
                Ok(other) => {
                    return Err(TransportError::protocol(
                        "blockchain.transaction.get",
                        format!("expected hex, got {}", other),
                    ))
                }
                Err(TransportError::Rpc { message, .. }) => {
                    log::warn!("[ADAPTER] Server could not supply {}: {}", txid, message);
                    UNFETCHABLE_PLACEHOLDER.to_string()
                }
                Err(e) => return Err(e),
            };
            out.insert(*txid, hex);
        }
        Ok(out)
    }

    fn block_headers(&self, heights: &[u32]) -> Result<BTreeMap<u32, String>, TransportError> {
        let params = heights.iter().map(|h| json!([h])).collect();
        let replies = self.send_requests("blockchain.block.header", params)?;
        let mut out = BTreeMap::new();
        for (height, reply) in heights.iter().zip(replies) {
            match reply {
                Ok(Value::String(hex)) => {
                    out.insert(*height, hex);
                }
                Ok(_) => log::warn!("[ADAPTER] Malformed header at {}", height),
                Err(TransportError::Rpc { message, .. }) => {
                    log::warn!("[ADAPTER] No header at {}: {}", height, message)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn fee_estimates(&self, targets: &[u16]) -> Result<BTreeMap<u16, f64>, TransportError> {
        let params = targets.iter().map(|t| json!([t])).collect();
        let replies = self.send_requests("blockchain.estimatefee", params)?;
        targets
            .iter()
            .zip(replies)
            .map(|(target, reply)| {
                let rate = reply?
                    .as_f64()
                    .ok_or_else(|| TransportError::protocol("blockchain.estimatefee", "not a number"))?;
                Ok((*target, rate))
            })
            .collect()
    }

    fn fee_histogram(&self) -> Result<Vec<(f64, u64)>, TransportError> {
        let result = self.call("mempool.get_fee_histogram", json!([]))?;
        parse_histogram(&result)
    }

    fn relay_fee(&self) -> Result<Option<f64>, TransportError> {
        Ok(self.call("blockchain.relayfee", json!([]))?.as_f64())
    }

    fn broadcast(&self, raw_tx: &str) -> Result<String, TransportError> {
        let result = self.call("blockchain.transaction.broadcast", json!([raw_tx]))?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TransportError::protocol("blockchain.transaction.broadcast", "not a string"))
    }

    fn block_stats(&self, heights: &[u32]) -> Result<BTreeMap<u32, BlockSummary>, TransportError> {
        let params = heights.iter().map(|h| json!([h])).collect();
        let replies = self.send_requests("blockchain.block.stats", params)?;
        let mut out = BTreeMap::new();
        for (height, reply) in heights.iter().zip(replies) {
            match reply {
                Ok(value) => {
                    if let Some(summary) = parse_block_stats(*height, &value) {
                        out.insert(*height, summary);
                    }
                }
                Err(TransportError::Rpc { message, .. }) => {
                    log::debug!("[ADAPTER] No block stats at {}: {}", height, message)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn drain_notifications(&self) -> Vec<Notification> {
        self.shared.lock().notifications.drain(..).collect()
    }
}

// =====================================================================
// Connection
// =====================================================================

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

fn tls_connector(certificate: Option<&Path>) -> Result<native_tls::TlsConnector, String> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = certificate {
        let pem = std::fs::read(path).map_err(|e| format!("reading {}: {}", path.display(), e))?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| e.to_string())?;
        builder
            .add_root_certificate(cert)
            .disable_built_in_roots(true)
            .danger_accept_invalid_hostnames(true);
    }
    builder.build().map_err(|e| e.to_string())
}

async fn open_stream(
    host: &str,
    port: u16,
    connector: Option<native_tls::TlsConnector>,
) -> Result<Box<dyn Stream>, String> {
    log::debug!("[ADAPTER] Connecting to {}:{} ...", host, port);
    let tcp = TcpStream::connect((host, port)).await.map_err(|e| e.to_string())?;
    match connector {
        Some(connector) => {
            let tls = TlsConnector::from(connector)
                .connect(host, tcp)
                .await
                .map_err(|e| e.to_string())?;
            log::debug!("[ADAPTER] TLS connected");
            Ok(Box::new(tls))
        }
        None => Ok(Box::new(tcp)),
    }
}

async fn run_connection(
    stream: Box<dyn Stream>,
    shared: Arc<Mutex<SharedState>>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) {
    let (reader, mut writer) = tokio::io::split(stream);

    let reader_shared = shared.clone();
    let mut read_task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => route_message(&line, &reader_shared),
                Ok(None) => {
                    log::error!("[ADAPTER] socket closed");
                    break;
                }
                Err(e) => {
                    log::error!("[ADAPTER] read error: {:?}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            line = outgoing.recv() => {
                let Some(line) = line else { break };
                log::trace!("[ADAPTER] Send payload:{}", line);
                let written = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    log::error!("[ADAPTER] write error: {:?}", e);
                    break;
                }
            }
            _ = &mut read_task => break,
        }
    }

    read_task.abort();
    shared.lock().close();
    log::info!("[ADAPTER] Connection closed");
}

// =====================================================================
// Message Processing
// =====================================================================

pub(crate) fn route_message(line: &str, shared: &Mutex<SharedState>) {
    log::trace!("[ADAPTER] Received:{}", line.trim());
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log::error!("[ADAPTER] Unparsable message: {}", e);
            return;
        }
    };
    match value {
        Value::Array(items) => items.into_iter().for_each(|v| route_value(v, shared)),
        v => route_value(v, shared),
    }
}

fn route_value(value: Value, shared: &Mutex<SharedState>) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(call) = shared.lock().pending.remove(&id) else {
            log::debug!("[ADAPTER] response with unknown id {}", id);
            return;
        };
        let reply = match value.get("error").filter(|e| !e.is_null()) {
            Some(error) => Err(TransportError::Rpc {
                method: call.method.to_string(),
                message: error_message(error),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = call.reply.send((call.index, reply));
        return;
    }

    match parse_notification(&value) {
        Ok(Some(notification)) => shared.lock().notifications.push_back(notification),
        Ok(None) => log::debug!("[ADAPTER] Ignoring message {}", value),
        Err(e) => log::warn!("[ADAPTER] {}", e),
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

pub(crate) fn parse_notification(value: &Value) -> Result<Option<Notification>, TransportError> {
    let params = value.get("params").and_then(Value::as_array);
    match value.get("method").and_then(Value::as_str) {
        Some(method @ "blockchain.scripthash.subscribe") => {
            let params = params.ok_or_else(|| TransportError::protocol(method, "missing params"))?;
            let hash = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::protocol(method, "missing script hash"))?
                .parse::<ScriptHash>()
                .map_err(|e| TransportError::protocol(method, e))?;
            let status = params.get(1).map(parse_status).unwrap_or(None);
            Ok(Some(Notification::ScriptHashStatus { hash, status }))
        }
        Some(method @ "blockchain.headers.subscribe") => {
            let header = params
                .and_then(|p| p.first())
                .ok_or_else(|| TransportError::protocol(method, "missing header"))?;
            Ok(Some(Notification::NewTip(parse_header_tip(header)?)))
        }
        _ => Ok(None),
    }
}

pub(crate) fn parse_status(value: &Value) -> Option<StatusString> {
    value.as_str().map(StatusString::new)
}

pub(crate) fn parse_server_version(value: &Value) -> Result<ServerVersion, TransportError> {
    let field = |i: usize| {
        value
            .get(i)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::protocol("server.version", "expected [software, protocol]"))
    };
    Ok(ServerVersion {
        server_software: field(0)?,
        protocol_version: field(1)?,
    })
}

pub(crate) fn parse_header_tip(value: &Value) -> Result<HeaderTip, TransportError> {
    const METHOD: &str = "blockchain.headers.subscribe";
    let height = value
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::protocol(METHOD, "missing height"))?;
    let hex = value
        .get("hex")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::protocol(METHOD, "missing hex"))?;
    let bytes = hex::decode(hex).map_err(|e| TransportError::protocol(METHOD, e))?;
    let header: block::Header =
        bitcoin::consensus::deserialize(&bytes).map_err(|e| TransportError::protocol(METHOD, e))?;
    Ok(HeaderTip {
        height: height as u32,
        header,
    })
}

pub(crate) fn parse_history(value: &Value) -> Result<Vec<TxReference>, TransportError> {
    const METHOD: &str = "blockchain.scripthash.get_history";
    let items = value
        .as_array()
        .ok_or_else(|| TransportError::protocol(METHOD, "history not array"))?;
    items
        .iter()
        .map(|item| {
            let txid: Txid = item
                .get("tx_hash")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::protocol(METHOD, "missing tx_hash"))?
                .parse()
                .map_err(|e| TransportError::protocol(METHOD, e))?;
            let height = item
                .get("height")
                .and_then(Value::as_i64)
                .ok_or_else(|| TransportError::protocol(METHOD, "missing height"))?;
            let fee = item.get("fee").and_then(Value::as_u64);
            Ok(TxReference::new(txid, height as i32).with_fee(fee))
        })
        .collect()
}

pub(crate) fn parse_histogram(value: &Value) -> Result<Vec<(f64, u64)>, TransportError> {
    const METHOD: &str = "mempool.get_fee_histogram";
    let buckets = value
        .as_array()
        .ok_or_else(|| TransportError::protocol(METHOD, "histogram not array"))?;
    buckets
        .iter()
        .map(|bucket| {
            let rate = bucket.get(0).and_then(Value::as_f64);
            let vsize = bucket.get(1).and_then(Value::as_f64);
            match (rate, vsize) {
                (Some(rate), Some(vsize)) => Ok((rate, vsize as u64)),
                _ => Err(TransportError::protocol(METHOD, format!("bad bucket {}", bucket))),
            }
        })
        .collect()
}

pub(crate) fn parse_block_stats(height: u32, value: &Value) -> Option<BlockSummary> {
    let timestamp = value
        .get("time")
        .or_else(|| value.get("timestamp"))
        .and_then(Value::as_u64)?;
    Some(BlockSummary {
        height,
        timestamp: timestamp as u32,
        median_fee: value
            .get("median_fee")
            .or_else(|| value.get("feerate_median"))
            .and_then(Value::as_f64),
        transaction_count: value
            .get("tx_count")
            .or_else(|| value.get("txs"))
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        weight: value.get("weight").or_else(|| value.get("total_weight")).and_then(Value::as_u64),
    })
}

#[cfg(test)]
pub(crate) fn test_shared() -> Mutex<SharedState> {
    Mutex::new(SharedState::default())
}

#[cfg(test)]
pub(crate) fn register_pending(
    shared: &Mutex<SharedState>,
    id: u64,
    method: &'static str,
) -> std::sync::mpsc::Receiver<(usize, Reply)> {
    let (tx, rx) = std::sync::mpsc::channel();
    shared.lock().pending.insert(
        id,
        PendingCall {
            method,
            index: 0,
            reply: tx,
        },
    );
    rx
}

#[cfg(test)]
pub(crate) fn drain_test_notifications(shared: &Mutex<SharedState>) -> Vec<Notification> {
    shared.lock().notifications.drain(..).collect()
}

#[cfg(test)]
pub(crate) fn close_shared(shared: &Mutex<SharedState>) {
    shared.lock().close();
}
