//! Server capability negotiation.
//!
//! Electrum implementations differ in whether they accept JSON-RPC batches
//! and `blockchain.scripthash.unsubscribe`. The only signal available is the
//! software string from `server.version`, so the profile is derived from
//! known version thresholds per server family.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const ELECTRS_MIN_BATCHING: [u64; 3] = [0, 9, 0];
const FULCRUM_MIN_BATCHING: [u64; 3] = [1, 6, 0];
const MEMPOOL_ELECTRS_MIN_BATCHING: [u64; 3] = [3, 1, 0];
const MEMPOOL_ELECTRS_MAX_BATCH: usize = 25;
/// Development build of mempool-electrs 3.1.0 known to batch correctly.
const MEMPOOL_ELECTRS_GOOD_DEV_BUILD: &str = "dev-249848d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityProfile {
    pub supports_batching: bool,
    /// Upper bound on requests per batch; `None` leaves it to the transport.
    pub max_batch_targets: Option<usize>,
    pub supports_unsubscribe: bool,
    pub supports_block_stats: bool,
}

impl CapabilityProfile {
    pub const fn new(supports_batching: bool, supports_unsubscribe: bool) -> Self {
        Self {
            supports_batching,
            max_batch_targets: None,
            supports_unsubscribe,
            supports_block_stats: false,
        }
    }
}

impl Default for CapabilityProfile {
    /// Unknown servers: one request at a time, unsubscribe assumed to work.
    fn default() -> Self {
        Self::new(false, true)
    }
}

/// Dotted numeric version, compared component-wise with missing parts as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<u64>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid version {:?}", self.0)
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('v');
        if s.is_empty() {
            return Err(VersionParseError(s.to_string()));
        }
        s.split('.')
            .map(|p| p.parse::<u64>().map_err(|_| VersionParseError(s.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Version)
    }
}

impl Version {
    fn compare(&self, other: &[u64]) -> Ordering {
        let len = self.0.len().max(other.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

/// Splits `"1.7.0-rc1"` into `("1.7.0", "-rc1")`.
fn split_suffix(s: &str) -> (&str, &str) {
    match s.find('-') {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

/// Maps the software string from `server.version` to a capability profile.
///
/// Matching is case-insensitive and the first rule that accepts the string
/// wins. A rule whose version cannot be parsed, or is below its threshold,
/// falls through to the next.
pub fn negotiate(server_software: &str) -> CapabilityProfile {
    let server = server_software.trim().to_lowercase();

    if server.contains("electrumx") {
        return CapabilityProfile::new(true, true);
    }

    if server.starts_with("cormorant") {
        return CapabilityProfile::new(true, false);
    }

    if let Some(rest) = server.strip_prefix("electrs/") {
        let (version, _) = split_suffix(rest);
        match version.parse::<Version>() {
            Ok(v) if v.compare(&ELECTRS_MIN_BATCHING) != Ordering::Less => {
                return CapabilityProfile::new(true, true);
            }
            Ok(_) => {}
            Err(e) => log::debug!("[ENGINE] {}", e),
        }
    }

    if let Some(rest) = server.strip_prefix("fulcrum") {
        let (version, _) = split_suffix(rest.trim());
        match version.parse::<Version>() {
            Ok(v) if v.compare(&FULCRUM_MIN_BATCHING) != Ordering::Less => {
                return CapabilityProfile::new(true, true);
            }
            Ok(_) => {}
            Err(e) => log::debug!("[ENGINE] {}", e),
        }
    }

    if let Some(rest) = server.strip_prefix("mempool-electrs") {
        let (version, suffix) = split_suffix(rest.trim());
        match version.parse::<Version>() {
            Ok(v) => {
                let eligible = match v.compare(&MEMPOOL_ELECTRS_MIN_BATCHING) {
                    Ordering::Greater => true,
                    Ordering::Equal => {
                        !suffix.contains("dev") || suffix.contains(MEMPOOL_ELECTRS_GOOD_DEV_BUILD)
                    }
                    Ordering::Less => false,
                };
                if eligible {
                    return CapabilityProfile {
                        supports_batching: true,
                        max_batch_targets: Some(MEMPOOL_ELECTRS_MAX_BATCH),
                        supports_unsubscribe: false,
                        supports_block_stats: false,
                    };
                }
            }
            Err(e) => log::debug!("[ENGINE] {}", e),
        }
    }

    if server.starts_with("electrumpersonalserver") {
        return CapabilityProfile::new(false, false);
    }

    CapabilityProfile::default()
}
