/**
 * nat_traversal/socket.rs
 *
 * UDP socket setup
 */

use super::error::SocketError;
use super::types::{to_endpoint, Endpoint};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Bind a UDP socket on `port`, falling back to an ephemeral port when that fails.
/// Port 0 asks for an ephemeral port directly.
pub fn bind_udp(ip: Ipv4Addr, port: u16) -> Result<UdpSocket, SocketError> {
    match bind_exact(ip, port) {
        Ok(socket) => Ok(socket),
        Err(e) if port != 0 => {
            warn!("Could not bind UDP port {}: {}; falling back to an ephemeral port", port, e);
            bind_exact(ip, 0).map_err(|source| SocketError::Bind { port: 0, source })
        }
        Err(source) => Err(SocketError::Bind { port, source }),
    }
}

fn bind_exact(ip: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_nonblocking(true)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;

    debug!("Bound UDP socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// Local endpoint of a bound socket
pub fn local_endpoint(socket: &UdpSocket) -> Result<Endpoint, SocketError> {
    let addr = socket.local_addr().map_err(SocketError::Receive)?;
    to_endpoint(addr).ok_or_else(|| SocketError::Resolve {
        host: addr.to_string(),
        reason: "not an IPv4 address".to_string(),
    })
}

/// Address of the interface that routes towards `target`, with the port of `socket`.
/// A socket bound to a concrete address answers with that address.
pub fn interface_endpoint(socket: &UdpSocket, target: Endpoint) -> Result<Endpoint, SocketError> {
    let local = local_endpoint(socket)?;
    if !local.ip().is_unspecified() {
        return Ok(local);
    }

    // connect() on a throwaway socket selects the route without sending anything
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|source| SocketError::Bind { port: 0, source })?;
    probe
        .connect(target)
        .map_err(|source| SocketError::Send {
            target: target.to_string(),
            source,
        })?;
    let routed = probe.local_addr().map_err(SocketError::Receive)?;

    match to_endpoint(routed) {
        Some(ep) => Ok(Endpoint::new(*ep.ip(), local.port())),
        None => Ok(local),
    }
}
