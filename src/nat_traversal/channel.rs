/**
 * nat_traversal/channel.rs
 *
 * Application datagrams and the inbound side of an established session
 */

use super::error::SocketError;
use super::stun::RECV_BUFFER;
use super::types::{to_endpoint, Endpoint};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Prefix reserved for hole-punch probes; such datagrams are never chat content
pub const PROBE_PREFIX: &str = "PUNCH_";

/// Prefix of the automatic reply sent in listen mode
pub const ECHO_PREFIX: &str = "Received: ";

/// A received application datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// `PUNCH_<seq>`; `seq` is `None` when the suffix is not a number
    Probe(Option<u32>),
    Text(String),
}

impl Datagram {
    pub fn parse(bytes: &[u8]) -> Self {
        if let Some(rest) = bytes.strip_prefix(PROBE_PREFIX.as_bytes()) {
            let seq = std::str::from_utf8(rest).ok().and_then(|s| s.parse().ok());
            return Self::Probe(seq);
        }
        Self::Text(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Self::Probe(_))
    }
}

/// Payload of probe number `seq`
pub fn probe_payload(seq: u32) -> String {
    format!("{}{}", PROBE_PREFIX, seq)
}

/// Everything the receive loop reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The first accepted datagram arrived from `peer`
    Established { peer: Endpoint },

    /// A probe from the peer
    Probe { from: Endpoint, seq: Option<u32> },

    /// Chat text from the peer
    Message { from: Endpoint, text: String },

    /// A datagram from somebody other than the peer; reported, never trusted
    Stranger { from: Endpoint, datagram: Datagram },
}

/// Stream of events from a session's receive loop
pub struct Inbox {
    rx: UnboundedReceiver<SessionEvent>,
}

impl Inbox {
    pub(crate) fn new(rx: UnboundedReceiver<SessionEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the session is closed and drained
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking variant for plain threads outside the runtime
    pub fn blocking_recv(&mut self) -> Option<SessionEvent> {
        self.rx.blocking_recv()
    }

    /// Wait at most `wait` for the next chat message, skipping other events
    pub async fn next_message(&mut self, wait: Duration) -> Option<(Endpoint, String)> {
        timeout(wait, async {
            while let Some(event) = self.rx.recv().await {
                if let SessionEvent::Message { from, text } = event {
                    return Some((from, text));
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }
}

/// Send one datagram to `target` and wait up to `wait` for a single reply
pub async fn send_once(
    socket: &UdpSocket,
    target: Endpoint,
    text: &str,
    wait: Duration,
) -> Result<Option<(Endpoint, String)>, SocketError> {
    socket
        .send_to(text.as_bytes(), target)
        .await
        .map_err(|source| SocketError::Send {
            target: target.to_string(),
            source,
        })?;

    let mut buffer = vec![0u8; RECV_BUFFER];
    match timeout(wait, socket.recv_from(&mut buffer)).await {
        Err(_) => Ok(None),
        Ok(Err(e)) => Err(SocketError::Receive(e)),
        Ok(Ok((len, from))) => {
            let from = to_endpoint(from).ok_or_else(|| SocketError::Resolve {
                host: from.to_string(),
                reason: "not an IPv4 address".to_string(),
            })?;
            Ok(Some((from, String::from_utf8_lossy(&buffer[..len]).into_owned())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probes_are_recognised() {
        assert_eq!(Datagram::parse(b"PUNCH_7"), Datagram::Probe(Some(7)));
        assert_eq!(Datagram::parse(b"PUNCH_"), Datagram::Probe(None));
        assert_eq!(Datagram::parse(probe_payload(12).as_bytes()), Datagram::Probe(Some(12)));
        assert!(!Datagram::parse(b"punch_1").is_probe());
    }

    #[test]
    fn text_is_decoded_lossily() {
        assert_eq!(Datagram::parse(b"hello"), Datagram::Text("hello".to_string()));
        assert_eq!(
            Datagram::parse(&[b'h', 0xFF, b'i']),
            Datagram::Text("h\u{FFFD}i".to_string())
        );
    }

    #[tokio::test]
    async fn send_once_gets_reply() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = to_endpoint(listener.local_addr().unwrap()).unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = listener.recv_from(&mut buf).await.unwrap();
            let reply = format!("{}{}", ECHO_PREFIX, String::from_utf8_lossy(&buf[..len]));
            listener.send_to(reply.as_bytes(), from).await.unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = send_once(&socket, target, "Hello!", Duration::from_secs(2))
            .await
            .unwrap();
        echo.await.unwrap();

        assert_eq!(reply, Some((target, "Received: Hello!".to_string())));
    }

    #[tokio::test]
    async fn send_once_times_out_quietly() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = to_endpoint(silent.local_addr().unwrap()).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let reply = send_once(&socket, target, "anyone?", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(reply, None);
    }
}
