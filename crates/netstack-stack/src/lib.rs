//! The registry and dispatch core of a userspace networking stack.
//!
//! This crate is the composition point that binds together network-layer
//! protocols, transport-layer protocols, network interfaces (NICs), a
//! longest-prefix-match route table, and the endpoint registration machinery
//! used for packet demultiplexing. It does not implement any protocol; it
//! orchestrates and owns the components that do.
//!
//! The entry point is [`Stack`], constructed from [`StackOptions`] with a set
//! of protocol factories. NICs wrap [`netstack_link::LinkEndpoint`]s and are
//! created, enabled, disabled, and removed through the stack, which keeps the
//! route table and the demuxer consistent with the NIC map.
//!
//! LOCK ORDERING: the NIC lock is always acquired before the route lock.
//! Route-table mutation happens only through `Stack` methods, which acquire
//! the two locks in that canonical order; no code path holds the route lock
//! while requesting the NIC lock.

pub mod demux;
pub mod filter;
pub mod nic;
pub mod ports;
pub mod proto;
pub mod rate_limit;
pub mod route;
pub mod stack;
pub mod testutil;

pub use demux::{PortFlags, TransportEndpointId};
pub use filter::{AllowAllTables, FilterHook, FilterVerdict, IpTables, NfTables};
pub use nic::addresses::{
    AddressLifetimes, AddressProperties, AssignedAddress, PrimaryEndpointBehavior,
};
pub use nic::neighbor::{
    LinkResolutionCallback, NeighborEntry, NeighborState, NudConfigurations, NudDispatcher,
};
pub use nic::{NicInfo, NicStateFlags};
pub use ports::{EphemeralPortManager, PortManager};
pub use proto::{
    BufferSizeRange, ForwardingNetworkEndpoint, LinkAddressResolver,
    MulticastForwardingEventDispatcher, MulticastForwardingNetworkProtocol,
    MulticastForwardingNetworkEndpoint, MulticastPacketContext, MulticastRoute,
    MulticastRouteOutgoingInterface, NetworkEndpoint, NetworkProtocol, PacketEndpoint,
    RawFactory, RawTransportEndpoint, RestoredEndpoint, ResumableEndpoint, TransportEndpoint,
    TransportProtocol, UnicastSourceAndMulticastDestination,
};
pub use rate_limit::IcmpRateLimiter;
pub use route::{RouteEntry, RouteTable};
pub use stack::routing::{PacketLooping, Route};
pub use stack::{
    NetworkProtocolFactory, NicOptions, ParseResult, Stack, StackOptions,
    TransportProtocolFactory,
};
