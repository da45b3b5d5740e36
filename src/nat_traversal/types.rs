/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Public or local UDP endpoint. IPv4 only.
pub type Endpoint = SocketAddrV4;

/// Narrow a socket address to an IPv4 endpoint
pub fn to_endpoint(addr: SocketAddr) -> Option<Endpoint> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

/// Public STUN servers tried when none are configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.stunprotocol.org:3478",
];

/// A STUN server whose hostname has been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServer {
    pub hostname: String,
    pub port: u16,
    pub endpoint: Endpoint,
}

impl fmt::Display for StunServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.hostname, self.port, self.endpoint)
    }
}

/// 96-bit STUN transaction id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// NAT filtering/mapping behaviour, computed once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatClassification {
    NoNat,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    Undetermined,
    Unreachable,
}

impl NatClassification {
    /// Probable consequence for hole punching and what the operator can do about it
    pub fn advice(&self) -> &'static str {
        match self {
            Self::NoNat => "Host is directly reachable; the peer can send to the public endpoint as-is.",
            Self::FullCone => "Any host can reach the mapped port; hole punching should succeed.",
            Self::RestrictedCone => {
                "Inbound traffic is allowed from hosts already contacted; both peers must punch at the same time."
            }
            Self::PortRestrictedCone => {
                "Inbound traffic is allowed only from contacted ip:port pairs; start both bursts within a few seconds."
            }
            Self::Symmetric => {
                "The mapping changes per destination; punching will likely fail. Forward a port manually or use a relay."
            }
            Self::Undetermined => {
                "The NAT gave inconsistent answers; punching may still work, otherwise forward a port manually."
            }
            Self::Unreachable => {
                "Fewer than two STUN servers answered; check the firewall and connectivity, or forward a port manually."
            }
        }
    }
}

impl fmt::Display for NatClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoNat => "No NAT",
            Self::FullCone => "Full Cone NAT",
            Self::RestrictedCone => "Restricted Cone NAT",
            Self::PortRestrictedCone => "Port Restricted Cone NAT",
            Self::Symmetric => "Symmetric NAT",
            Self::Undetermined => "Undetermined",
            Self::Unreachable => "Unreachable",
        };
        f.write_str(name)
    }
}

/// Hole-punch session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    Idle,
    Punching,
    Established,
    Closed,
}

/// What is known about the peer when punching starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTarget {
    /// Probe this endpoint and accept traffic only from it
    Confirmed(Endpoint),
    /// Probe this endpoint, but adopt whoever answers first
    Assumed(Endpoint),
    /// No probes; the first sender becomes the peer
    Unknown,
}

impl PeerTarget {
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self {
            Self::Confirmed(ep) | Self::Assumed(ep) => Some(*ep),
            Self::Unknown => None,
        }
    }
}

/// Pipeline progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Binding,
    ResolvingServers,
    StunDiscovery,
    Classifying,
    Ready,
    Failed(String),
}

/// Punch burst and receive loop tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchConfig {
    /// Probes per burst
    pub probe_count: u32,

    /// Delay between two probes
    pub probe_interval: Duration,

    /// Receive loop bounded wait; also the shutdown latency
    pub poll_interval: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            probe_count: 12,
            probe_interval: Duration::from_millis(300),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// NAT traversal configuration
#[derive(Debug, Clone)]
pub struct NatTraversalConfig {
    /// STUN servers (host:port), tried in order
    pub stun_servers: Vec<String>,

    /// Local UDP port to bind (0 for random)
    pub local_port: u16,

    /// Port the operator already forwarded on the router, if any
    pub forwarded_port: Option<u16>,

    /// Per-server STUN response timeout
    pub stun_timeout: Duration,

    /// Wait used by the full cone and restricted cone probes
    pub probe_timeout: Duration,

    pub punch: PunchConfig,
}

impl Default for NatTraversalConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            local_port: 0,
            forwarded_port: None,
            stun_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(1),
            punch: PunchConfig::default(),
        }
    }
}

impl NatTraversalConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(list) = lookup("STUN_SERVERS") {
            let servers: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if servers.is_empty() {
                return Err(anyhow!("STUN_SERVERS is set but lists no server"));
            }
            config.stun_servers = servers;
        }

        if let Some(port) = parse_var::<u16, _>(&lookup, "LOCAL_PORT")? {
            config.local_port = port;
        }

        config.forwarded_port = parse_var::<u16, _>(&lookup, "PUNCH_PORT")?;

        if let Some(count) = parse_var::<u32, _>(&lookup, "PUNCH_COUNT")? {
            config.punch.probe_count = count.clamp(1, 100);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PUNCH_INTERVAL_MS")? {
            config.punch.probe_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "POLL_INTERVAL_MS")? {
            config.punch.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "STUN_TIMEOUT_MS")? {
            config.stun_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PROBE_TIMEOUT_MS")? {
            config.probe_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = NatTraversalConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.stun_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert_eq!(config.local_port, 0);
        assert_eq!(config.forwarded_port, None);
        assert_eq!(config.stun_timeout, Duration::from_secs(3));
        assert_eq!(config.punch, PunchConfig::default());
    }

    #[test]
    fn environment_overrides() {
        let config = NatTraversalConfig::from_lookup(lookup_from(&[
            ("STUN_SERVERS", "a.example:3478, b.example:19302,"),
            ("LOCAL_PORT", "40000"),
            ("PUNCH_PORT", "40001"),
            ("PUNCH_COUNT", "500"),
            ("PUNCH_INTERVAL_MS", "200"),
        ]))
        .unwrap();

        assert_eq!(config.stun_servers, vec!["a.example:3478", "b.example:19302"]);
        assert_eq!(config.local_port, 40000);
        assert_eq!(config.forwarded_port, Some(40001));
        assert_eq!(config.punch.probe_count, 100);
        assert_eq!(config.punch.probe_interval, Duration::from_millis(200));
    }

    #[test]
    fn malformed_variable_names_the_key() {
        let err = NatTraversalConfig::from_lookup(lookup_from(&[("LOCAL_PORT", "seventy")]))
            .unwrap_err();
        assert!(err.to_string().contains("LOCAL_PORT"));
    }

    #[test]
    fn empty_server_list_is_rejected() {
        assert!(NatTraversalConfig::from_lookup(lookup_from(&[("STUN_SERVERS", " , ")])).is_err());
    }

    #[test]
    fn v4_mapped_v6_narrows_to_endpoint() {
        let mapped: SocketAddr = "[::ffff:203.0.113.5]:62345".parse().unwrap();
        assert_eq!(to_endpoint(mapped), Some("203.0.113.5:62345".parse().unwrap()));
        let v6: SocketAddr = "[2001:db8::1]:1".parse().unwrap();
        assert_eq!(to_endpoint(v6), None);
    }
}
