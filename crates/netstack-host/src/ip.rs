//! Minimal IPv4 protocol glue.
//!
//! The host binary exists to exercise the stack's registration surface, not
//! to ship a protocol suite. This protocol implements just the endpoint
//! lifecycle and the forwarding capability; packets delivered to it are
//! counted and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use netstack_core::{NetworkProtocolNumber, NicId, PacketBuffer, StackError};
use netstack_stack::{ForwardingNetworkEndpoint, NetworkEndpoint, NetworkProtocol};

pub struct MinimalIpv4;

impl MinimalIpv4 {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MinimalIpv4 {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProtocol for MinimalIpv4 {
    fn number(&self) -> NetworkProtocolNumber {
        NetworkProtocolNumber::IPV4
    }

    fn new_endpoint(&self, nic: NicId) -> Arc<dyn NetworkEndpoint> {
        Arc::new(MinimalIpv4Endpoint {
            nic,
            enabled: AtomicBool::new(false),
            forwarding: ForwardingBit::default(),
            received: AtomicU64::new(0),
        })
    }
}

#[derive(Default)]
struct ForwardingBit {
    enabled: AtomicBool,
}

impl ForwardingNetworkEndpoint for ForwardingBit {
    fn forwarding(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_forwarding(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }
}

struct MinimalIpv4Endpoint {
    nic: NicId,
    enabled: AtomicBool,
    forwarding: ForwardingBit,
    received: AtomicU64,
}

impl NetworkEndpoint for MinimalIpv4Endpoint {
    fn enable(&self) -> Result<(), StackError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn handle_packet(&self, pkt: PacketBuffer) {
        let total = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(
            nic = self.nic.0,
            len = pkt.len(),
            total,
            "ipv4 packet received"
        );
    }

    fn forwarding(&self) -> Option<&dyn ForwardingNetworkEndpoint> {
        Some(&self.forwarding)
    }
}
