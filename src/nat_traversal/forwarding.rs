/**
 * nat_traversal/forwarding.rs
 *
 * Seam for an external port-forwarding helper (UPnP, manual router rules)
 */

use tracing::info;

/// Something that may have opened an inbound mapping for a local port
pub trait PortForwarder {
    /// Externally reachable port for `local_port`, or `None` if nothing was opened
    fn forward(&self, local_port: u16) -> Option<u16>;
}

/// A forward configured by hand on the router
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualForward {
    pub external_port: Option<u16>,
}

impl ManualForward {
    pub fn new(external_port: Option<u16>) -> Self {
        Self { external_port }
    }
}

impl PortForwarder for ManualForward {
    fn forward(&self, local_port: u16) -> Option<u16> {
        let external = self.external_port?;
        info!("Using operator-forwarded port {} for local port {}", external, local_port);
        Some(external)
    }
}

/// No forwarding at all
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForward;

impl PortForwarder for NoForward {
    fn forward(&self, _local_port: u16) -> Option<u16> {
        None
    }
}
