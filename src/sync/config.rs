//! Engine configuration.
//!
//! Loaded from JSON; every field has a default so a config file only needs
//! to name the server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::Network;
use serde::Deserialize;

use crate::sync::error::ConfigError;

pub const DEFAULT_CLIENT_NAME: &str = "bdk-electrum-history-sync";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = ["1.3", "1.4.2"];
pub const TARGET_BLOCKS: [u16; 8] = [1, 2, 3, 4, 5, 10, 25, 50];

/// Electrum server address, `ssl://host:port` or `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub url: String,

    /// PEM certificate to pin for self-signed servers.
    #[serde(default)]
    pub certificate: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            certificate: None,
        }
    }

    /// Splits the url into `(host, port, use_tls)`.
    ///
    /// A url without a scheme is treated as TLS.
    pub fn endpoint(&self) -> Result<(String, u16, bool), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServerUrl {
            url: self.url.clone(),
            reason: reason.to_string(),
        };

        let s = self.url.trim();
        let (rest, tls) = if let Some(r) = s.strip_prefix("ssl://") {
            (r, true)
        } else if let Some(r) = s.strip_prefix("tcp://") {
            (r, false)
        } else if s.contains("://") {
            return Err(invalid("unsupported scheme"));
        } else {
            (s, true)
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
        Ok((host.to_string(), port, tls))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: Option<ServerConfig>,

    /// Set when traffic is routed through an anonymising proxy. Enables
    /// multi-source broadcast and disables decoy traffic.
    pub proxy: Option<String>,

    pub network: Network,
    pub client_name: String,
    pub protocol_versions: Vec<String>,
    pub target_blocks: Vec<u16>,

    /// sat/vB used for every target when the server cannot estimate.
    pub fallback_fee_rate: f64,

    pub keepalive_interval_secs: u64,
    pub fee_refresh_interval_secs: u64,

    /// Transactions with at least this many confirmations are cached across wallets.
    pub cache_confirmations: u32,

    /// Decoy subscriptions older than this many blocks are dropped.
    pub decoy_max_age_blocks: u32,

    pub request_timeout_secs: u64,
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server: None,
            proxy: None,
            network: Network::Bitcoin,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS.iter().map(|v| v.to_string()).collect(),
            target_blocks: TARGET_BLOCKS.to_vec(),
            fallback_fee_rate: 10.0,
            keepalive_interval_secs: 10,
            fee_refresh_interval_secs: 30,
            cache_confirmations: 6,
            decoy_max_age_blocks: 3,
            request_timeout_secs: 30,
            max_batch_size: 250,
        }
    }
}

impl EngineConfig {
    pub fn with_server(server: ServerConfig) -> Self {
        Self {
            server: Some(server),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = self.server.as_ref().ok_or(ConfigError::NoServer)?;
        server.endpoint()?;

        if let Some(cert) = &server.certificate {
            if !cert.exists() {
                return Err(ConfigError::MissingCertificate(cert.clone()));
            }
        }

        if self.target_blocks.is_empty() {
            return Err(ConfigError::Invalid {
                field: "target_blocks",
                reason: "at least one target is required".into(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_batch_size",
                reason: "must be positive".into(),
            });
        }
        if self.fallback_fee_rate.is_nan() || self.fallback_fee_rate <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "fallback_fee_rate",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn using_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn fee_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.fee_refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
