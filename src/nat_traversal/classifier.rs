/**
 * nat_traversal/classifier.rs
 *
 * NAT behaviour classification from a fixed sequence of STUN probes
 */

use super::codec::encode_binding_request;
use super::error::{ClassificationError, SocketError};
use super::socket::{bind_udp, interface_endpoint, local_endpoint};
use super::stun::{StunClient, RECV_BUFFER};
use super::types::{to_endpoint, Endpoint, NatClassification, StunServer, TransactionId};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Default wait for the unsolicited-traffic probes
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// NAT type classifier
///
/// Tests run from the most permissive behaviour to the least and stop at the
/// first conclusive one:
/// 1. two servers must answer, otherwise `Unreachable`
/// 2. mapping equal to the interface address: `NoNat`
/// 3. the two servers see different ports: `Symmetric`
/// 4. unsolicited traffic reaches the mapping after a request from another socket: `FullCone`
/// 5. traffic from the second server's host arrives after contacting only the first: `RestrictedCone`
/// 6. a second round of queries either confirms a stable port (`PortRestrictedCone`)
///    or flips to `Symmetric`
/// 7. anything else: `Undetermined`
pub struct NatClassifier<'a> {
    socket: &'a UdpSocket,
    servers: &'a [StunServer],
    client: StunClient,
    probe_timeout: Duration,
}

impl<'a> NatClassifier<'a> {
    pub fn new(socket: &'a UdpSocket, servers: &'a [StunServer], client: StunClient) -> Self {
        Self {
            socket,
            servers,
            client,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Classify, folding a failure to reach two servers into `Unreachable`
    pub async fn classify(&self) -> NatClassification {
        match self.try_classify().await {
            Ok(classification) => classification,
            Err(ClassificationError::Unreachable { answered, tried }) => {
                warn!("NAT classification needs two STUN servers, {} of {} answered", answered, tried);
                NatClassification::Unreachable
            }
            Err(e) => {
                warn!("NAT classification aborted: {}", e);
                NatClassification::Undetermined
            }
        }
    }

    pub async fn try_classify(&self) -> Result<NatClassification, ClassificationError> {
        let ((server_a, mapped_a), (server_b, mapped_b)) = self.two_mappings().await?;
        debug!("Mappings: {} via {}, {} via {}", mapped_a, server_a, mapped_b, server_b);

        let local = interface_endpoint(self.socket, server_a.endpoint)?;
        if mapped_a == local {
            info!("Mapped endpoint {} equals the interface address", mapped_a);
            return Ok(NatClassification::NoNat);
        }

        if mapped_a.port() != mapped_b.port() {
            info!(
                "Mapped port differs per destination ({} vs {})",
                mapped_a.port(),
                mapped_b.port()
            );
            return Ok(NatClassification::Symmetric);
        }

        let contacted = [server_a.endpoint, server_b.endpoint];

        if self.full_cone_probe(server_a, &contacted).await? {
            return Ok(NatClassification::FullCone);
        }

        if self.restricted_cone_probe(server_a, server_b, &contacted).await? {
            return Ok(NatClassification::RestrictedCone);
        }

        let again_a = self.client.query(self.socket, server_a).await;
        let again_b = self.client.query(self.socket, server_b).await;
        match (again_a, again_b) {
            (Ok(a), Ok(b)) if a.port() != b.port() => {
                info!("Second round saw differing ports ({} vs {})", a.port(), b.port());
                Ok(NatClassification::Symmetric)
            }
            (Ok(_), Ok(_)) => Ok(NatClassification::PortRestrictedCone),
            (a, b) => {
                debug!("Second round inconclusive: {:?} / {:?}", a.err(), b.err());
                Ok(NatClassification::Undetermined)
            }
        }
    }

    /// First two servers, in order, that report a mapping
    async fn two_mappings(
        &self,
    ) -> Result<((&'a StunServer, Endpoint), (&'a StunServer, Endpoint)), ClassificationError> {
        let mut found: Vec<(&'a StunServer, Endpoint)> = Vec::with_capacity(2);
        let mut tried = 0;

        for server in self.servers {
            if found.len() == 2 {
                break;
            }
            if found.iter().any(|(s, _)| s.endpoint == server.endpoint) {
                continue;
            }
            tried += 1;
            match self.client.query(self.socket, server).await {
                Ok(mapped) => found.push((server, mapped)),
                Err(e) => debug!("Classifier query to {} failed: {}", server, e),
            }
        }

        match found.as_slice() {
            [a, b] => Ok((*a, *b)),
            _ => Err(ClassificationError::Unreachable {
                answered: found.len(),
                tried,
            }),
        }
    }

    /// A request leaves from a throwaway socket; does anything reach the original mapping?
    async fn full_cone_probe(
        &self,
        server: &StunServer,
        contacted: &[Endpoint],
    ) -> Result<bool, ClassificationError> {
        let local = local_endpoint(self.socket)?;
        let throwaway = bind_udp(*local.ip(), 0)?;
        send_request(&throwaway, server.endpoint).await?;

        let hit = self
            .wait_for(|from| !contacted.contains(&from))
            .await?;
        if let Some(from) = hit {
            info!("Unsolicited datagram from {} reached the mapping", from);
        }
        Ok(hit.is_some())
    }

    /// Contact only `server_a`; does the host of `server_b` get through on an uncontacted port?
    async fn restricted_cone_probe(
        &self,
        server_a: &StunServer,
        server_b: &StunServer,
        contacted: &[Endpoint],
    ) -> Result<bool, ClassificationError> {
        send_request(self.socket, server_a.endpoint).await?;

        let host_b = *server_b.endpoint.ip();
        let hit = self
            .wait_for(|from| *from.ip() == host_b && !contacted.contains(&from))
            .await?;
        if let Some(from) = hit {
            info!("Datagram from {} arrived after contacting only {}", from, server_a.endpoint);
        }
        Ok(hit.is_some())
    }

    /// Drain the socket for `probe_timeout`, returning the first source accepted by `accept`
    async fn wait_for<F>(&self, accept: F) -> Result<Option<Endpoint>, ClassificationError>
    where
        F: Fn(Endpoint) -> bool,
    {
        let deadline = Instant::now() + self.probe_timeout;
        let mut buffer = vec![0u8; RECV_BUFFER];

        loop {
            match timeout_at(deadline, self.socket.recv_from(&mut buffer)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(SocketError::Receive(e).into()),
                Ok(Ok((len, from))) => {
                    let Some(from) = to_endpoint(from) else {
                        continue;
                    };
                    if accept(from) {
                        return Ok(Some(from));
                    }
                    debug!("Probe wait ignored {} bytes from {}", len, from);
                }
            }
        }
    }
}

async fn send_request(socket: &UdpSocket, target: Endpoint) -> Result<(), SocketError> {
    let request = encode_binding_request(&TransactionId::random());
    socket
        .send_to(&request, target)
        .await
        .map(|_| ())
        .map_err(|source| SocketError::Send {
            target: target.to_string(),
            source,
        })
}
