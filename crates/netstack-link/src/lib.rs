//! Link-layer endpoint abstraction for the netstack workspace.
//!
//! A [`LinkEndpoint`] is the lower edge of a NIC: it consumes outbound frames
//! and produces inbound ones, delivering them upward through an attached
//! [`NetworkDispatcher`]. Concrete drivers (tap devices, fd-backed links)
//! live outside this workspace; this crate ships the trait plus two
//! in-memory endpoints — a queue-backed [`channel`] endpoint and a
//! [`loopback`] endpoint — used by tests, demos, and integrators.

pub mod channel;
pub mod loopback;
pub mod testing;
pub mod traits;

pub use channel::{ChannelConfig, ChannelEndpoint};
pub use loopback::LoopbackEndpoint;
pub use traits::{
    CoordinatorLink, LinkCapabilities, LinkEndpoint, NetworkDispatcher, OnCloseAction,
};
