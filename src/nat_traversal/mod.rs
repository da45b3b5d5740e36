/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - STUN codec and client
 * - NAT behaviour classification
 * - UDP hole punching
 * - the text channel over the punched hole
 */

mod channel;
mod classifier;
mod codec;
mod error;
mod forwarding;
mod hole_punching;
mod socket;
mod stun;
mod types;

pub use channel::{send_once, Datagram, Inbox, SessionEvent, ECHO_PREFIX, PROBE_PREFIX};
pub use classifier::NatClassifier;
pub use codec::{
    decode_binding_response, decode_binding_response_for, encode_binding_request,
    encode_binding_response, AddressEncoding, MessageType, StunMessage, MAGIC_COOKIE,
};
pub use error::{ClassificationError, DecodeError, DiscoveryError, QueryError, SessionError, SocketError};
pub use forwarding::{ManualForward, NoForward, PortForwarder};
pub use hole_punching::{PunchSession, PunchStats};
pub use socket::bind_udp;
pub use stun::{resolve_servers, StunClient};
pub use types::{
    ConnectionState, Endpoint, NatClassification, NatTraversalConfig, PeerTarget, PunchConfig,
    PunchState, StunServer, TransactionId,
};

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use tracing::info;

/// What the pipeline learned before punching
#[derive(Debug, Clone)]
pub struct TraversalReport {
    pub local_endpoint: Endpoint,
    pub public_endpoint: Endpoint,
    pub classification: NatClassification,
    pub forwarded_port: Option<u16>,
    pub servers: Vec<StunServer>,
}

/// Bind, discover, classify, then hand the socket to a punch session
pub struct NatTraversal {
    config: NatTraversalConfig,
    forwarder: Box<dyn PortForwarder + Send + Sync>,
    state: ConnectionState,
}

impl NatTraversal {
    /// Create a new NAT traversal manager
    pub fn new(config: NatTraversalConfig) -> Self {
        let forwarder = ManualForward::new(config.forwarded_port);
        Self {
            config,
            forwarder: Box::new(forwarder),
            state: ConnectionState::Idle,
        }
    }

    pub fn with_forwarder<F>(mut self, forwarder: F) -> Self
    where
        F: PortForwarder + Send + Sync + 'static,
    {
        self.forwarder = Box::new(forwarder);
        self
    }

    /// Execute the pipeline up to the point where punching can start.
    /// Returns a session bound to the socket the public endpoint belongs to.
    pub async fn prepare(&mut self) -> Result<(PunchSession, TraversalReport)> {
        let result = self.run().await;
        if let Err(e) = &result {
            self.state = ConnectionState::Failed(format!("{:#}", e));
        }
        result
    }

    async fn run(&mut self) -> Result<(PunchSession, TraversalReport)> {
        // Step 1: Bind the session socket
        self.state = ConnectionState::Binding;
        let socket = bind_udp(Ipv4Addr::UNSPECIFIED, self.config.local_port)
            .context("Failed to create UDP socket")?;
        let local_endpoint = socket::local_endpoint(&socket)?;

        // Step 2: Resolve STUN servers
        self.state = ConnectionState::ResolvingServers;
        let servers = resolve_servers(&self.config.stun_servers).await;

        // Step 3: STUN discovery
        self.state = ConnectionState::StunDiscovery;
        let client = StunClient::with_timeout(self.config.stun_timeout);
        let public_endpoint = client
            .discover_public_endpoint(&socket, &servers)
            .await
            .context("STUN discovery failed")?;

        // Step 4: Classification (advisory)
        self.state = ConnectionState::Classifying;
        let classification = NatClassifier::new(&socket, &servers, client)
            .with_probe_timeout(self.config.probe_timeout)
            .classify()
            .await;
        info!("NAT classification: {}", classification);

        let forwarded_port = self.forwarder.forward(local_endpoint.port());

        let session = PunchSession::new(socket, Some(public_endpoint), self.config.punch)?;
        self.state = ConnectionState::Ready;

        Ok((
            session,
            TraversalReport {
                local_endpoint,
                public_endpoint,
                classification,
                forwarded_port,
                servers,
            },
        ))
    }

    /// Get current pipeline state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn config(&self) -> &NatTraversalConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::stun::tests::{FakeStunServer, Reply};
    use std::time::Duration;

    fn config_for(servers: &[&FakeStunServer]) -> NatTraversalConfig {
        NatTraversalConfig {
            stun_servers: servers
                .iter()
                .map(|s| s.server.endpoint.to_string())
                .collect(),
            stun_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(100),
            forwarded_port: Some(41000),
            ..NatTraversalConfig::default()
        }
    }

    #[tokio::test]
    async fn pipeline_reports_mapping_and_classification() {
        let a = FakeStunServer::spawn(Reply::Fixed("203.0.113.5:40000".parse().unwrap())).await;
        let b = FakeStunServer::spawn(Reply::Fixed("203.0.113.5:40001".parse().unwrap())).await;

        let mut traversal = NatTraversal::new(config_for(&[&a, &b]));
        let (session, report) = traversal.prepare().await.unwrap();

        assert_eq!(traversal.state(), &ConnectionState::Ready);
        assert_eq!(report.public_endpoint, "203.0.113.5:40000".parse().unwrap());
        assert_eq!(report.classification, NatClassification::Symmetric);
        assert_eq!(report.forwarded_port, Some(41000));
        assert_eq!(report.servers.len(), 2);
        assert_eq!(session.public_endpoint(), Some(report.public_endpoint));
        assert_eq!(session.local_endpoint(), report.local_endpoint);
        assert_eq!(session.state(), PunchState::Idle);
    }

    #[tokio::test]
    async fn pipeline_fails_when_nobody_answers() {
        let a = FakeStunServer::spawn(Reply::Silent).await;

        let mut traversal = NatTraversal::new(config_for(&[&a])).with_forwarder(NoForward);
        let Err(err) = traversal.prepare().await else {
            panic!("discovery should fail without any STUN answer");
        };

        assert!(err.to_string().contains("STUN discovery failed"));
        assert!(matches!(traversal.state(), ConnectionState::Failed(_)));
    }
}
