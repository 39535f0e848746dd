//! Protocol traits and capability interfaces.
//!
//! The stack dispatches over protocol objects through these traits. Optional
//! behaviors (forwarding, multicast forwarding, link-address resolution,
//! buffer-limit reporting) are modeled as capability accessors returning
//! `Option<&dyn ...>` — the Rust counterpart of runtime capability queries —
//! so a protocol advertises exactly what it implements.

use std::any::Any;
use std::sync::Arc;

use netstack_core::{
    Address, LinkAddress, MonotonicTime, NetworkProtocolNumber, NicId, PacketBuffer, StackError,
    TransportProtocolNumber,
};

use crate::demux::TransportEndpointId;
use crate::stack::Stack;

/// Min/default/max buffer sizes applied to endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferSizeRange {
    pub min: usize,
    pub default: usize,
    pub max: usize,
}

/// A network-layer protocol registered with a stack.
///
/// Factories must not mutate the stack; they may only query it.
pub trait NetworkProtocol: Send + Sync {
    fn number(&self) -> NetworkProtocolNumber;

    /// Create the per-NIC endpoint for this protocol.
    fn new_endpoint(&self, nic: NicId) -> Arc<dyn NetworkEndpoint>;

    /// Set a protocol-level option. The option type is protocol-defined.
    fn set_option(&self, option: &dyn Any) -> Result<(), StackError> {
        let _ = option;
        Err(StackError::NotSupported)
    }

    /// Read a protocol-level option into `option`.
    fn option(&self, option: &mut dyn Any) -> Result<(), StackError> {
        let _ = option;
        Err(StackError::NotSupported)
    }

    /// Release protocol resources during stack teardown.
    fn close(&self) {}

    /// Block until background work has finished.
    fn wait(&self) {}

    /// Link-address resolution capability (ARP, NDP).
    fn link_address_resolver(&self) -> Option<&dyn LinkAddressResolver> {
        None
    }

    /// Multicast forwarding capability.
    fn multicast_forwarding(&self) -> Option<&dyn MulticastForwardingNetworkProtocol> {
        None
    }
}

/// The per-NIC instance of a network protocol.
pub trait NetworkEndpoint: Send + Sync {
    /// Start delivering and accepting packets. Idempotent.
    fn enable(&self) -> Result<(), StackError>;

    /// Stop delivering and accepting packets. Idempotent.
    fn disable(&self);

    /// Handle an inbound packet delivered by the NIC.
    fn handle_packet(&self, pkt: PacketBuffer);

    /// Unicast forwarding capability.
    fn forwarding(&self) -> Option<&dyn ForwardingNetworkEndpoint> {
        None
    }

    /// Multicast forwarding capability.
    fn multicast_forwarding(&self) -> Option<&dyn MulticastForwardingNetworkEndpoint> {
        None
    }
}

/// Capability of network endpoints that can forward unicast packets.
pub trait ForwardingNetworkEndpoint: Send + Sync {
    fn forwarding(&self) -> bool;

    /// Returns the previous setting.
    fn set_forwarding(&self, enabled: bool) -> bool;
}

/// Capability of network endpoints that can forward multicast packets.
pub trait MulticastForwardingNetworkEndpoint: Send + Sync {
    fn multicast_forwarding(&self) -> bool;

    /// Returns the previous setting.
    fn set_multicast_forwarding(&self, enabled: bool) -> bool;
}

/// Capability of network protocols that resolve network addresses to link
/// addresses.
pub trait LinkAddressResolver: Send + Sync {
    /// Resolve without the network: static mappings such as multicast and
    /// broadcast addresses.
    fn resolve_static(&self, addr: &Address) -> Option<LinkAddress>;

    /// Send a resolution probe for `addr`, sourced from `local_addr`, on the
    /// given NIC. Completion is reported back through the NIC's neighbor
    /// cache.
    fn probe(&self, nic: NicId, addr: &Address, local_addr: &Address);
}

/// A source address paired with a multicast destination, keying a multicast
/// route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnicastSourceAndMulticastDestination {
    pub source: Address,
    pub destination: Address,
}

/// One outgoing interface of a multicast route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MulticastRouteOutgoingInterface {
    pub id: NicId,
    /// Packets with a smaller TTL are not forwarded out this interface.
    pub min_ttl: u8,
}

/// A multicast route installed via the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastRoute {
    pub expected_input_interface: NicId,
    pub outgoing_interfaces: Vec<MulticastRouteOutgoingInterface>,
}

/// Context for multicast forwarding events.
#[derive(Clone, Debug)]
pub struct MulticastPacketContext {
    pub source_and_destination: UnicastSourceAndMulticastDestination,
    pub input_interface: NicId,
}

/// Sink for multicast forwarding events.
pub trait MulticastForwardingEventDispatcher: Send + Sync {
    /// A packet arrived for which no multicast route is installed.
    fn on_missing_route(&self, context: MulticastPacketContext);

    /// A packet matched a route but arrived on an unexpected interface.
    fn on_unexpected_input_interface(&self, context: MulticastPacketContext, expected: NicId);
}

/// Capability of network protocols that support multicast forwarding.
pub trait MulticastForwardingNetworkProtocol: Send + Sync {
    /// Enable multicast forwarding, directing events to `dispatcher`.
    ///
    /// Returns true if forwarding was already enabled.
    fn enable_multicast_forwarding(
        &self,
        dispatcher: Arc<dyn MulticastForwardingEventDispatcher>,
    ) -> Result<bool, StackError>;

    fn disable_multicast_forwarding(&self);

    fn add_multicast_route(
        &self,
        addresses: UnicastSourceAndMulticastDestination,
        route: MulticastRoute,
    ) -> Result<(), StackError>;

    fn remove_multicast_route(
        &self,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<(), StackError>;

    /// When the route matching `addresses` was last used or updated.
    fn multicast_route_last_used_time(
        &self,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<MonotonicTime, StackError>;
}

/// A transport-layer protocol registered with a stack.
pub trait TransportProtocol: Send + Sync {
    fn number(&self) -> TransportProtocolNumber;

    /// Create an endpoint of this protocol over the given network protocol.
    fn new_endpoint(
        &self,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError>;

    /// Create a raw endpoint receiving all packets of this protocol.
    fn new_raw_endpoint(
        &self,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        let _ = network;
        Err(StackError::NotSupported)
    }

    fn set_option(&self, option: &dyn Any) -> Result<(), StackError> {
        let _ = option;
        Err(StackError::NotSupported)
    }

    fn option(&self, option: &mut dyn Any) -> Result<(), StackError> {
        let _ = option;
        Err(StackError::NotSupported)
    }

    /// Release protocol resources during stack teardown.
    fn close(&self) {}

    /// Block until background work has finished.
    fn wait(&self) {}

    /// Stop background workers and drain queues ahead of serialization.
    fn pause(&self) {}

    /// Restart background workers after a save.
    fn resume(&self) {}

    /// Restart background workers on a freshly loaded stack.
    fn restore(&self) {}

    /// Parse the transport header in `pkt`. Returns false on parse failure.
    fn parse(&self, pkt: &mut PacketBuffer) -> bool {
        let _ = pkt;
        false
    }

    /// Send-buffer limit reporting capability (implemented by TCP).
    fn send_buffer_limits(&self) -> Option<BufferSizeRange> {
        None
    }
}

/// A transport endpoint registered with the demuxer for packet delivery.
pub trait TransportEndpoint: Send + Sync {
    /// Handle a packet matched to this endpoint's id.
    fn handle_packet(&self, id: &TransportEndpointId, pkt: PacketBuffer);

    /// Initiate a non-blocking hangup during stack teardown.
    fn abort(&self);

    /// Block until the endpoint's background work has finished.
    fn wait(&self);
}

/// A raw endpoint receiving every packet of a transport protocol.
pub trait RawTransportEndpoint: Send + Sync {
    fn handle_packet(&self, pkt: PacketBuffer);
}

/// An endpoint receiving every link-delivered packet of a network protocol.
pub trait PacketEndpoint: Send + Sync {
    fn handle_packet(&self, nic: NicId, protocol: NetworkProtocolNumber, pkt: &PacketBuffer);
}

/// Factory for raw and packet endpoints. Raw sockets are denied when the
/// stack is built without one.
pub trait RawFactory: Send + Sync {
    fn new_unassociated_endpoint(
        &self,
        stack: &Stack,
        network: NetworkProtocolNumber,
        transport: TransportProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError>;

    fn new_packet_endpoint(
        &self,
        stack: &Stack,
        cooked: bool,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn PacketEndpoint>, StackError>;
}

/// An endpoint that must be brought back to life on a restored stack.
pub trait RestoredEndpoint: Send + Sync {
    /// Called after the stack's configuration has been substituted; may call
    /// back into `stack`.
    fn restore(&self, stack: &Stack);
}

/// An endpoint that must be resumed after a save.
pub trait ResumableEndpoint: Send + Sync {
    fn resume(&self);
}

/// Identity-keyed handle to a transport endpoint, used for set membership
/// and unregistration by pointer equality.
#[derive(Clone)]
pub struct EndpointRef(pub Arc<dyn TransportEndpoint>);

impl EndpointRef {
    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for EndpointRef {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.addr(), other.addr())
    }
}

impl Eq for EndpointRef {}

impl std::hash::Hash for EndpointRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.addr() as usize).hash(state);
    }
}

impl std::fmt::Debug for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EndpointRef").field(&self.addr()).finish()
    }
}

impl std::ops::Deref for EndpointRef {
    type Target = Arc<dyn TransportEndpoint>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
