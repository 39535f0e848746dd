//! Opaque packet-filter handles.
//!
//! Rule evaluation engines are out of scope; the stack owns handles it can
//! hand to integrators and substitute wholesale during restore.

use netstack_core::{NicId, PacketBuffer};

/// Where in the pipeline a filter check runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterHook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    Drop,
}

/// The iptables-style rule engine handle.
pub trait IpTables: Send + Sync {
    fn check(&self, hook: FilterHook, pkt: &PacketBuffer, nic: NicId) -> FilterVerdict;
}

/// The nftables-style rule engine handle.
pub trait NfTables: Send + Sync {
    fn check(&self, hook: FilterHook, pkt: &PacketBuffer, nic: NicId) -> FilterVerdict;
}

/// The default rule set: accept everything.
pub struct AllowAllTables;

impl IpTables for AllowAllTables {
    fn check(&self, _hook: FilterHook, _pkt: &PacketBuffer, _nic: NicId) -> FilterVerdict {
        FilterVerdict::Accept
    }
}

impl NfTables for AllowAllTables {
    fn check(&self, _hook: FilterHook, _pkt: &PacketBuffer, _nic: NicId) -> FilterVerdict {
        FilterVerdict::Accept
    }
}
