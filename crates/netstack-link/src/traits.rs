//! Core link endpoint trait and upward delivery interface.

use std::sync::Arc;

use netstack_core::{LinkAddress, NetworkProtocolNumber, NicId, PacketBuffer, StackError};

/// Capabilities advertised by a link endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkCapabilities {
    /// The link requires neighbor (link-address) resolution before sending.
    pub resolution_required: bool,
    /// The endpoint loops outbound frames back as inbound ones.
    pub loopback: bool,
}

/// Receiver of inbound packets; implemented by the NIC that a link endpoint
/// is attached to.
pub trait NetworkDispatcher: Send + Sync {
    /// Deliver an inbound packet for the given network protocol.
    fn deliver_network_packet(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer);
}

/// Action registered by the stack to run when the link closes underneath it.
pub type OnCloseAction = Box<dyn FnOnce() + Send>;

/// The lower-layer producer/consumer of frames bound to a NIC.
///
/// Implementations must be internally synchronized: the stack calls these
/// methods from many threads.
pub trait LinkEndpoint: Send + Sync {
    /// Maximum transmission unit of the link.
    fn mtu(&self) -> u32;

    fn set_mtu(&self, mtu: u32);

    /// Maximum link-layer header length, used to reserve packet headroom.
    fn max_header_length(&self) -> u16;

    fn link_address(&self) -> LinkAddress;

    fn set_link_address(&self, addr: LinkAddress);

    fn capabilities(&self) -> LinkCapabilities;

    /// Bind the endpoint to a dispatcher, or unbind with `None`.
    ///
    /// Attaching starts inbound delivery; detaching stops it.
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    fn is_attached(&self) -> bool;

    /// Write an outbound packet to the link.
    fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError>;

    /// Block until internal workers have finished. The default is a no-op
    /// for endpoints without background work.
    fn wait(&self) {}

    /// Register (or clear) the action to run when the endpoint closes.
    fn set_on_close_action(&self, action: Option<OnCloseAction>);

    /// Release the endpoint's resources, running any registered close
    /// action exactly once.
    fn close(&self);

    /// Access the coordinator capability for aggregating endpoints.
    fn coordinator(&self) -> Option<&dyn CoordinatorLink> {
        None
    }
}

/// Capability of link endpoints that aggregate subordinate NICs
/// (master/slave style bonds).
pub trait CoordinatorLink: Send + Sync {
    /// Enroll a subordinate NIC.
    fn add_port(&self, id: NicId) -> Result<(), StackError>;

    /// Remove a subordinate NIC.
    fn del_port(&self, id: NicId) -> Result<(), StackError>;
}
