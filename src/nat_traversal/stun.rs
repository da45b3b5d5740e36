/**
 * nat_traversal/stun.rs
 *
 * STUN client for NAT discovery
 */

use super::codec::{decode_binding_response_for, encode_binding_request};
use super::error::{DecodeError, DiscoveryError, QueryError, SocketError};
use super::types::{to_endpoint, Endpoint, StunServer, TransactionId};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Per-server wait for a Binding Response
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest datagram read from the socket
pub(crate) const RECV_BUFFER: usize = 2048;

/// STUN client
///
/// Holds no socket of its own: the socket whose mapping is wanted is passed
/// to every call, so the same socket can later be used for hole punching.
#[derive(Debug, Clone, Copy)]
pub struct StunClient {
    timeout: Duration,
}

impl Default for StunClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StunClient {
    /// Create a new STUN client
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Try each server in order; the first mapping obtained wins
    pub async fn discover_public_endpoint(
        &self,
        socket: &UdpSocket,
        servers: &[StunServer],
    ) -> Result<Endpoint, DiscoveryError> {
        if servers.is_empty() {
            return Err(DiscoveryError::NoServers);
        }

        for server in servers {
            match self.query(socket, server).await {
                Ok(mapped) => {
                    info!("Public endpoint {} reported by {}", mapped, server);
                    return Ok(mapped);
                }
                Err(e) => {
                    warn!("STUN server {} skipped: {}", server, e);
                }
            }
        }

        Err(DiscoveryError::AllServersUnreachable)
    }

    /// Send one Binding Request to `server` and wait for its answer
    pub async fn query(&self, socket: &UdpSocket, server: &StunServer) -> Result<Endpoint, QueryError> {
        let transaction_id = TransactionId::random();
        let request = encode_binding_request(&transaction_id);

        socket
            .send_to(&request, server.endpoint)
            .await
            .map_err(|source| SocketError::Send {
                target: server.endpoint.to_string(),
                source,
            })?;
        debug!("Binding request {} sent to {}", transaction_id, server);

        let deadline = Instant::now() + self.timeout;
        let mut buffer = vec![0u8; RECV_BUFFER];

        loop {
            let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Err(_) => return Err(QueryError::Timeout(self.timeout)),
                Ok(Err(e)) => return Err(SocketError::Receive(e).into()),
                Ok(Ok(received)) => received,
            };

            let from_server = to_endpoint(from) == Some(server.endpoint);
            match decode_binding_response_for(&buffer[..len], &transaction_id) {
                Ok(mapped) => {
                    if !from_server {
                        debug!("Binding response for {} arrived from {} instead of {}", transaction_id, from, server.endpoint);
                    }
                    return Ok(mapped);
                }
                Err(DecodeError::TransactionMismatch) => {
                    debug!("Stale binding response from {} ignored", from);
                }
                Err(e) if from_server => return Err(e.into()),
                Err(_) => {
                    debug!("Ignoring {} byte datagram from {} while waiting for {}", len, from, server);
                }
            }
        }
    }
}

/// Resolve one `host:port` entry to an IPv4 endpoint
pub async fn resolve_server(spec: &str) -> Result<StunServer, SocketError> {
    let (hostname, port) = spec
        .rsplit_once(':')
        .and_then(|(host, port)| port.parse::<u16>().ok().map(|p| (host, p)))
        .ok_or_else(|| SocketError::Resolve {
            host: spec.to_string(),
            reason: "expected host:port".to_string(),
        })?;

    let addrs = lookup_host((hostname, port))
        .await
        .map_err(|e| SocketError::Resolve {
            host: spec.to_string(),
            reason: e.to_string(),
        })?;

    let endpoint = addrs
        .filter_map(to_endpoint)
        .next()
        .ok_or_else(|| SocketError::Resolve {
            host: spec.to_string(),
            reason: "no IPv4 address".to_string(),
        })?;

    Ok(StunServer {
        hostname: hostname.to_string(),
        port,
        endpoint,
    })
}

/// Resolve every entry once; entries that fail are dropped
pub async fn resolve_servers(specs: &[String]) -> Vec<StunServer> {
    let mut servers = Vec::with_capacity(specs.len());
    for spec in specs {
        match resolve_server(spec).await {
            Ok(server) => {
                debug!("Resolved STUN server {}", server);
                servers.push(server);
            }
            Err(e) => warn!("Dropping STUN server: {}", e),
        }
    }
    servers
}
