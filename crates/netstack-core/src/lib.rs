//! Base value types shared across the netstack workspace.
//!
//! This crate defines the vocabulary of the stack — interface ids, protocol
//! numbers, network and link addresses, subnets — together with the error
//! taxonomy, the clock abstraction, thread-safe random number sources, the
//! packet buffer value type, and counter bundles. It has no knowledge of
//! protocols or interfaces; those live in `netstack-link` and
//! `netstack-stack`.

pub mod addr;
pub mod clock;
pub mod error;
pub mod packet;
pub mod rng;
pub mod stats;
pub mod types;

pub use addr::{Address, AddressWithPrefix, LinkAddress, ProtocolAddress, Subnet};
pub use clock::{Clock, ManualClock, MonotonicTime, StdClock};
pub use error::StackError;
pub use packet::PacketBuffer;
pub use rng::{InsecureRng, SecureRng};
pub use stats::{Counter, NicStats, StackStats};
pub use types::{NetworkProtocolNumber, NicId, TransportProtocolNumber};
