/**
 * nat_traversal/error.rs
 *
 * Error taxonomy for the traversal engine
 */

use std::io;
use thiserror::Error;

/// A STUN response that cannot be used
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("STUN message truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("No address attribute found in STUN response")]
    NoAddressAttribute,

    #[error("Unexpected STUN message type: 0x{0:04x}")]
    UnexpectedMessageType(u16),

    #[error("Invalid magic cookie: 0x{0:08x}")]
    BadMagicCookie(u32),

    #[error("Unsupported address family: 0x{0:02x}")]
    UnsupportedFamily(u8),

    #[error("Transaction ID mismatch")]
    TransactionMismatch,
}

/// UDP socket failures
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Failed to bind UDP socket on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Failed to send to {target}: {source}")]
    Send { target: String, source: io::Error },

    #[error("Failed to receive: {0}")]
    Receive(#[source] io::Error),
}

/// Public endpoint discovery failed outright
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(
        "No STUN server answered. Probable cause: no connectivity or a firewall blocking UDP. \
         Try other STUN servers or forward a port manually"
    )]
    AllServersUnreachable,

    #[error("No STUN server could be resolved; check DNS or the STUN_SERVERS list")]
    NoServers,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Classification could not run to completion
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Fewer than two STUN servers answered ({answered} of {tried})")]
    Unreachable { answered: usize, tried: usize },

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Misuse or failure of a punch session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("No peer connection established yet")]
    NotEstablished,

    #[error("Session closed")]
    Closed,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// One binding request against one server did not produce a mapping
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No response within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}
