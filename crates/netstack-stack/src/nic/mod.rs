//! Per-interface state: addresses, forwarding, taps, neighbors, delivery.
//!
//! A NIC binds a link endpoint to the stack and owns one network endpoint
//! per registered network protocol, together with that protocol's address
//! book, multicast memberships, neighbor cache, and NUD configuration. The
//! stack delegates interface-scoped operations here while holding the NIC
//! lock; anything that must run without it (link close) is handed back as a
//! deferred action.

pub mod addresses;
pub mod neighbor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use netstack_core::{
    Address, AddressWithPrefix, Clock, LinkAddress, NetworkProtocolNumber, NicId, NicStats,
    PacketBuffer, ProtocolAddress, StackError,
};
use netstack_link::{LinkEndpoint, NetworkDispatcher};

use crate::nic::addresses::{AddressBook, AddressLifetimes, AddressProperties, AssignedAddress};
use crate::nic::neighbor::{
    CacheUpdate, LinkResolutionCallback, NeighborCache, NeighborEntry, NudConfigurations,
    NudDispatcher,
};
use crate::proto::{NetworkEndpoint, NetworkProtocol, PacketEndpoint};
use crate::stack::StackCore;

/// State bits reported for a NIC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NicStateFlags {
    /// Interfaces are considered administratively up once created.
    pub up: bool,
    /// Whether the NIC is enabled.
    pub running: bool,
    pub promiscuous: bool,
    pub loopback: bool,
}

/// Snapshot of a NIC's name, addresses, and flags.
#[derive(Debug)]
pub struct NicInfo {
    pub name: String,
    pub link_address: LinkAddress,
    pub protocol_addresses: Vec<ProtocolAddress>,
    pub flags: NicStateFlags,
    pub mtu: u32,
    pub forwarding: HashMap<NetworkProtocolNumber, bool>,
    pub multicast_forwarding: HashMap<NetworkProtocolNumber, bool>,
}

struct ProtocolState {
    protocol: Arc<dyn NetworkProtocol>,
    endpoint: Arc<dyn NetworkEndpoint>,
    addresses: Mutex<AddressBook>,
    groups: Mutex<HashMap<Address, usize>>,
    neighbors: NeighborCache,
    nud: Mutex<NudConfigurations>,
}

pub(crate) struct Nic {
    id: NicId,
    name: RwLock<String>,
    link: Arc<dyn LinkEndpoint>,
    stack: RwLock<Weak<StackCore>>,
    clock: Arc<dyn Clock>,
    nud_dispatcher: Option<Arc<dyn NudDispatcher>>,
    enabled: AtomicBool,
    attached: AtomicBool,
    promiscuous: AtomicBool,
    spoofing: AtomicBool,
    /// Coordinator this NIC is subordinate to, if any.
    coordinator: RwLock<Option<Arc<Nic>>>,
    protocols: HashMap<NetworkProtocolNumber, ProtocolState>,
    packet_endpoints: Mutex<HashMap<NetworkProtocolNumber, Vec<Arc<dyn PacketEndpoint>>>>,
    pub(crate) stats: NicStats,
}

impl Nic {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stack: Weak<StackCore>,
        id: NicId,
        name: String,
        link: Arc<dyn LinkEndpoint>,
        network_protocols: &HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>>,
        nud_defaults: NudConfigurations,
        nud_dispatcher: Option<Arc<dyn NudDispatcher>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let mut protocols = HashMap::new();
        for (&number, protocol) in network_protocols {
            protocols.insert(
                number,
                ProtocolState {
                    protocol: protocol.clone(),
                    endpoint: protocol.new_endpoint(id),
                    addresses: Mutex::new(AddressBook::new()),
                    groups: Mutex::new(HashMap::new()),
                    neighbors: NeighborCache::new(),
                    nud: Mutex::new(nud_defaults),
                },
            );
        }
        Arc::new(Self {
            id,
            name: RwLock::new(name),
            link,
            stack: RwLock::new(stack),
            clock,
            nud_dispatcher,
            enabled: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            spoofing: AtomicBool::new(false),
            coordinator: RwLock::new(None),
            protocols,
            packet_endpoints: Mutex::new(HashMap::new()),
            stats: NicStats::default(),
        })
    }

    pub(crate) fn id(&self) -> NicId {
        self.id
    }

    pub(crate) fn name(&self) -> String {
        self.name.read().unwrap().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.write().unwrap() = name;
    }

    pub(crate) fn link(&self) -> &Arc<dyn LinkEndpoint> {
        &self.link
    }

    /// Re-parent this NIC onto another stack (restore, namespace moves).
    pub(crate) fn set_stack(&self, stack: Weak<StackCore>) {
        *self.stack.write().unwrap() = stack;
    }

    pub(crate) fn coordinator(&self) -> Option<Arc<Nic>> {
        self.coordinator.read().unwrap().clone()
    }

    pub(crate) fn set_coordinator(&self, coordinator: Option<Arc<Nic>>) {
        *self.coordinator.write().unwrap() = coordinator;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_loopback(&self) -> bool {
        self.link.capabilities().loopback
    }

    pub(crate) fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::SeqCst)
    }

    pub(crate) fn set_promiscuous(&self, enable: bool) {
        self.promiscuous.store(enable, Ordering::SeqCst);
    }

    pub(crate) fn spoofing(&self) -> bool {
        self.spoofing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_spoofing(&self, enable: bool) {
        self.spoofing.store(enable, Ordering::SeqCst);
    }

    /// Enable the NIC, attaching the link endpoint on first use. Idempotent.
    pub(crate) fn enable(self: &Arc<Self>) -> Result<(), StackError> {
        if !self.attached.swap(true, Ordering::SeqCst) {
            let dispatcher: Arc<dyn NetworkDispatcher> = self.clone();
            self.link.attach(Some(dispatcher));
        }
        if self.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for state in self.protocols.values() {
            state.endpoint.enable()?;
        }
        tracing::debug!(nic = self.id.0, "nic enabled");
        Ok(())
    }

    /// Disable the NIC, stopping upward delivery. Idempotent.
    pub(crate) fn disable(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        for state in self.protocols.values() {
            state.endpoint.disable();
        }
        tracing::debug!(nic = self.id.0, "nic disabled");
    }

    fn protocol_state(&self, proto: NetworkProtocolNumber) -> Result<&ProtocolState, StackError> {
        self.protocols.get(&proto).ok_or(StackError::UnknownProtocol)
    }

    // -- Forwarding --

    pub(crate) fn set_forwarding(
        &self,
        proto: NetworkProtocolNumber,
        enable: bool,
    ) -> Result<bool, StackError> {
        let state = self.protocol_state(proto)?;
        let forwarding = state.endpoint.forwarding().ok_or(StackError::NotSupported)?;
        Ok(forwarding.set_forwarding(enable))
    }

    pub(crate) fn forwarding(&self, proto: NetworkProtocolNumber) -> Result<bool, StackError> {
        let state = self.protocol_state(proto)?;
        let forwarding = state.endpoint.forwarding().ok_or(StackError::NotSupported)?;
        Ok(forwarding.forwarding())
    }

    pub(crate) fn set_multicast_forwarding(
        &self,
        proto: NetworkProtocolNumber,
        enable: bool,
    ) -> Result<bool, StackError> {
        let state = self.protocol_state(proto)?;
        let forwarding = state
            .endpoint
            .multicast_forwarding()
            .ok_or(StackError::NotSupported)?;
        Ok(forwarding.set_multicast_forwarding(enable))
    }

    pub(crate) fn multicast_forwarding(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Result<bool, StackError> {
        let state = self.protocol_state(proto)?;
        let forwarding = state
            .endpoint
            .multicast_forwarding()
            .ok_or(StackError::NotSupported)?;
        Ok(forwarding.multicast_forwarding())
    }

    // -- Addresses --

    pub(crate) fn add_address(
        &self,
        protocol_address: ProtocolAddress,
        properties: AddressProperties,
    ) -> Result<(), StackError> {
        let state = self.protocol_state(protocol_address.protocol)?;
        state
            .addresses
            .lock()
            .unwrap()
            .add(protocol_address.address_with_prefix, properties)
    }

    pub(crate) fn remove_address(&self, addr: &Address) -> Result<(), StackError> {
        for state in self.protocols.values() {
            let mut book = state.addresses.lock().unwrap();
            if book.has(addr) {
                return book.remove(addr);
            }
        }
        Err(StackError::BadLocalAddress)
    }

    pub(crate) fn set_address_lifetimes(
        &self,
        addr: &Address,
        lifetimes: AddressLifetimes,
    ) -> Result<(), StackError> {
        for state in self.protocols.values() {
            let mut book = state.addresses.lock().unwrap();
            if book.has(addr) {
                return book.set_lifetimes(addr, lifetimes);
            }
        }
        Err(StackError::BadLocalAddress)
    }

    pub(crate) fn primary_address(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Result<AddressWithPrefix, StackError> {
        let state = self.protocol_state(proto)?;
        let book = state.addresses.lock().unwrap();
        Ok(book.primary_address().unwrap_or_default())
    }

    /// Select the primary assigned address for `remote`, honoring a source
    /// hint.
    pub(crate) fn primary_assigned(
        &self,
        proto: NetworkProtocolNumber,
        remote: &Address,
        src_hint: &Address,
    ) -> Option<AssignedAddress> {
        let state = self.protocols.get(&proto)?;
        let book = state.addresses.lock().unwrap();
        book.primary_assigned(remote, src_hint)
    }

    /// Find the assigned address `local`. With `allow_spoofed` and spoofing
    /// enabled, a temporary assignment is fabricated for unknown addresses.
    pub(crate) fn find_assigned(
        &self,
        proto: NetworkProtocolNumber,
        local: &Address,
        allow_spoofed: bool,
    ) -> Option<AssignedAddress> {
        let state = self.protocols.get(&proto)?;
        {
            let book = state.addresses.lock().unwrap();
            if let Some(assigned) = book.find(local) {
                return Some(assigned);
            }
        }
        if allow_spoofed && self.spoofing() && !local.is_empty() {
            return Some(AssignedAddress {
                address_with_prefix: local.with_prefix(local.bit_len() as u8),
                deprecated: false,
                temporary: true,
            });
        }
        None
    }

    pub(crate) fn has_address(&self, proto: NetworkProtocolNumber, addr: &Address) -> bool {
        self.protocols
            .get(&proto)
            .is_some_and(|s| s.addresses.lock().unwrap().has(addr))
    }

    pub(crate) fn all_permanent_addresses(&self) -> Vec<ProtocolAddress> {
        let mut out = Vec::new();
        for (&protocol, state) in &self.protocols {
            for awp in state.addresses.lock().unwrap().permanent() {
                out.push(ProtocolAddress {
                    protocol,
                    address_with_prefix: awp,
                });
            }
        }
        out
    }

    pub(crate) fn primary_addresses(&self) -> Vec<ProtocolAddress> {
        let mut out = Vec::new();
        for (&protocol, state) in &self.protocols {
            for awp in state.addresses.lock().unwrap().primary_candidates() {
                out.push(ProtocolAddress {
                    protocol,
                    address_with_prefix: awp,
                });
            }
        }
        out
    }

    pub(crate) fn is_subnet_broadcast(
        &self,
        proto: NetworkProtocolNumber,
        addr: &Address,
    ) -> bool {
        self.protocols
            .get(&proto)
            .is_some_and(|s| s.addresses.lock().unwrap().is_subnet_broadcast(addr))
    }

    // -- Multicast groups --

    pub(crate) fn join_group(
        &self,
        proto: NetworkProtocolNumber,
        addr: &Address,
    ) -> Result<(), StackError> {
        let state = self.protocol_state(proto)?;
        if !addr.is_multicast() {
            return Err(StackError::BadAddress);
        }
        *state.groups.lock().unwrap().entry(*addr).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn leave_group(
        &self,
        proto: NetworkProtocolNumber,
        addr: &Address,
    ) -> Result<(), StackError> {
        let state = self.protocol_state(proto)?;
        let mut groups = state.groups.lock().unwrap();
        let count = groups.get_mut(addr).ok_or(StackError::BadLocalAddress)?;
        *count -= 1;
        if *count == 0 {
            groups.remove(addr);
        }
        Ok(())
    }

    pub(crate) fn is_in_group(&self, addr: &Address) -> bool {
        self.protocols
            .values()
            .any(|s| s.groups.lock().unwrap().contains_key(addr))
    }

    // -- Neighbors --

    fn resolving_state(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Result<&ProtocolState, StackError> {
        let state = self.protocol_state(proto)?;
        if !self.link.capabilities().resolution_required {
            return Err(StackError::NotSupported);
        }
        Ok(state)
    }

    fn dispatch_update(&self, update: CacheUpdate) {
        if let Some(dispatcher) = &self.nud_dispatcher {
            if let Some(entry) = &update.added {
                dispatcher.on_neighbor_added(self.id, entry);
            }
            if let Some(entry) = &update.changed {
                dispatcher.on_neighbor_changed(self.id, entry);
            }
            if let Some(entry) = &update.removed {
                dispatcher.on_neighbor_removed(self.id, entry);
            }
        }
        for (callback, result) in update.callbacks {
            callback(result);
        }
    }

    pub(crate) fn neighbors(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Result<Vec<NeighborEntry>, StackError> {
        Ok(self.resolving_state(proto)?.neighbors.entries())
    }

    pub(crate) fn add_static_neighbor(
        &self,
        proto: NetworkProtocolNumber,
        addr: Address,
        link_addr: LinkAddress,
    ) -> Result<(), StackError> {
        let state = self.resolving_state(proto)?;
        let update = state.neighbors.add_static(addr, link_addr, self.clock.now());
        self.dispatch_update(update);
        Ok(())
    }

    pub(crate) fn remove_neighbor(
        &self,
        proto: NetworkProtocolNumber,
        addr: &Address,
    ) -> Result<(), StackError> {
        let state = self.resolving_state(proto)?;
        let update = state.neighbors.remove(addr)?;
        self.dispatch_update(update);
        Ok(())
    }

    pub(crate) fn clear_neighbors(&self, proto: NetworkProtocolNumber) -> Result<(), StackError> {
        let state = self.resolving_state(proto)?;
        let removed = state.neighbors.clear();
        if let Some(dispatcher) = &self.nud_dispatcher {
            for entry in &removed {
                dispatcher.on_neighbor_removed(self.id, entry);
            }
        }
        Ok(())
    }

    /// Resolve `addr` to a link address.
    ///
    /// On a cache hit or static mapping, `on_resolve` runs before this
    /// returns. Otherwise the callback is queued, a probe is kicked off and
    /// `WouldBlock` is returned; completion arrives via
    /// [`Nic::handle_link_resolution`].
    pub(crate) fn get_link_address(
        &self,
        addr: &Address,
        local_addr: &Address,
        proto: NetworkProtocolNumber,
        on_resolve: LinkResolutionCallback,
    ) -> Result<(), StackError> {
        let state = self.resolving_state(proto)?;

        if let Some(link_addr) = state.neighbors.lookup(addr) {
            on_resolve(Ok(link_addr));
            return Ok(());
        }

        let Some(resolver) = state.protocol.link_address_resolver() else {
            return Err(StackError::NotSupported);
        };
        if let Some(link_addr) = resolver.resolve_static(addr) {
            on_resolve(Ok(link_addr));
            return Ok(());
        }

        let (update, first) = state.neighbors.enqueue(*addr, on_resolve, self.clock.now());
        self.dispatch_update(update);
        if first {
            resolver.probe(self.id, addr, local_addr);
        }
        Err(StackError::WouldBlock)
    }

    /// Completion hook for asynchronous link resolution, called by protocol
    /// glue when a reply (or timeout) arrives.
    pub(crate) fn handle_link_resolution(
        &self,
        proto: NetworkProtocolNumber,
        addr: &Address,
        result: Result<LinkAddress, StackError>,
    ) {
        if let Some(state) = self.protocols.get(&proto) {
            let update = state.neighbors.complete(addr, result, self.clock.now());
            self.dispatch_update(update);
        }
    }

    pub(crate) fn nud_configs(
        &self,
        proto: NetworkProtocolNumber,
    ) -> Result<NudConfigurations, StackError> {
        Ok(*self.protocol_state(proto)?.nud.lock().unwrap())
    }

    pub(crate) fn set_nud_configs(
        &self,
        proto: NetworkProtocolNumber,
        configs: NudConfigurations,
    ) -> Result<(), StackError> {
        let state = self.protocol_state(proto)?;
        *state.nud.lock().unwrap() = configs.sanitized();
        Ok(())
    }

    // -- Packet endpoint taps --

    pub(crate) fn register_packet_endpoint(
        &self,
        proto: NetworkProtocolNumber,
        ep: Arc<dyn PacketEndpoint>,
    ) {
        self.packet_endpoints
            .lock()
            .unwrap()
            .entry(proto)
            .or_default()
            .push(ep);
    }

    pub(crate) fn unregister_packet_endpoint(
        &self,
        proto: NetworkProtocolNumber,
        ep: &Arc<dyn PacketEndpoint>,
    ) {
        let mut taps = self.packet_endpoints.lock().unwrap();
        if let Some(list) = taps.get_mut(&proto) {
            list.retain(|member| !Arc::ptr_eq(member, ep));
            if list.is_empty() {
                taps.remove(&proto);
            }
        }
    }

    // -- Outbound --

    pub(crate) fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError> {
        let len = pkt.len() as u64;
        self.link.write_packet(pkt)?;
        self.stats.tx_packets.increment();
        self.stats.tx_bytes.add(len);
        if let Some(stack) = self.stack.read().unwrap().upgrade() {
            stack.stats.packets_sent.increment();
        }
        Ok(())
    }

    // -- Info --

    pub(crate) fn info(&self) -> NicInfo {
        let mut forwarding = HashMap::new();
        let mut multicast_forwarding = HashMap::new();
        for (&proto, state) in &self.protocols {
            if let Some(f) = state.endpoint.forwarding() {
                forwarding.insert(proto, f.forwarding());
            }
            if let Some(f) = state.endpoint.multicast_forwarding() {
                multicast_forwarding.insert(proto, f.multicast_forwarding());
            }
        }
        NicInfo {
            name: self.name(),
            link_address: self.link.link_address(),
            protocol_addresses: self.primary_addresses(),
            flags: NicStateFlags {
                up: true,
                running: self.is_enabled(),
                promiscuous: self.promiscuous(),
                loopback: self.is_loopback(),
            },
            mtu: self.link.mtu(),
            forwarding,
            multicast_forwarding,
        }
    }

    /// Dismantle the NIC. The returned action detaches (and optionally
    /// closes) the link endpoint and must run outside the NIC lock.
    pub(crate) fn remove(&self, close_link_endpoint: bool) -> Option<Box<dyn FnOnce() + Send>> {
        self.disable();
        for state in self.protocols.values() {
            for (callback, result) in state.neighbors.fail_pending() {
                callback(result);
            }
        }
        // Clear the close callback so tearing the link down does not loop
        // back into the stack.
        self.link.set_on_close_action(None);

        let link = self.link.clone();
        let id = self.id;
        Some(Box::new(move || {
            link.attach(None);
            if close_link_endpoint {
                link.close();
            }
            tracing::debug!(nic = id.0, "nic removed");
        }))
    }
}

impl NetworkDispatcher for Nic {
    fn deliver_network_packet(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer) {
        if !self.is_enabled() {
            self.stats.disabled_rx_packets.increment();
            return;
        }
        self.stats.rx_packets.increment();
        self.stats.rx_bytes.add(pkt.len() as u64);

        let stack = self.stack.read().unwrap().upgrade();
        if let Some(stack) = &stack {
            stack.stats.packets_received.increment();
        }

        let taps = self
            .packet_endpoints
            .lock()
            .unwrap()
            .get(&protocol)
            .cloned()
            .unwrap_or_default();
        for tap in taps {
            tap.handle_packet(self.id, protocol, &pkt);
        }

        match self.protocols.get(&protocol) {
            Some(state) => {
                state.endpoint.handle_packet(pkt);
                if let Some(stack) = &stack {
                    stack.stats.packets_delivered.increment();
                }
            }
            None => {
                if let Some(stack) = &stack {
                    stack.stats.unknown_protocol_received.increment();
                    stack.stats.packets_dropped.increment();
                }
            }
        }
    }
}
