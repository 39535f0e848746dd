//! Fake protocols and endpoints for exercising the stack.
//!
//! These implement just enough of the protocol traits to drive the
//! registration and orchestration surface: counters instead of state
//! machines, maps instead of wire formats. They are used by this crate's
//! own tests and are public so integrators can reuse them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use netstack_core::{
    Address, LinkAddress, MonotonicTime, NetworkProtocolNumber, NicId, PacketBuffer, StackError,
    TransportProtocolNumber,
};

use crate::demux::TransportEndpointId;
use crate::proto::{
    ForwardingNetworkEndpoint, LinkAddressResolver, MulticastForwardingEventDispatcher,
    MulticastForwardingNetworkEndpoint, MulticastForwardingNetworkProtocol, MulticastRoute,
    NetworkEndpoint, NetworkProtocol, PacketEndpoint, RawFactory, RawTransportEndpoint,
    RestoredEndpoint, ResumableEndpoint, TransportEndpoint, TransportProtocol,
    UnicastSourceAndMulticastDestination,
};
use crate::stack::Stack;

/// A demux-registrable endpoint that records teardown calls.
#[derive(Default)]
pub struct FakeTransportEndpoint {
    pub aborted: AtomicBool,
    pub waited: AtomicBool,
    pub packets: AtomicUsize,
}

impl FakeTransportEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TransportEndpoint for FakeTransportEndpoint {
    fn handle_packet(&self, _id: &TransportEndpointId, _pkt: PacketBuffer) {
        self.packets.fetch_add(1, Ordering::SeqCst);
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn wait(&self) {
        self.waited.store(true, Ordering::SeqCst);
    }
}

/// A raw endpoint that counts packets.
#[derive(Default)]
pub struct FakeRawEndpoint {
    pub packets: AtomicUsize,
}

impl FakeRawEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RawTransportEndpoint for FakeRawEndpoint {
    fn handle_packet(&self, _pkt: PacketBuffer) {
        self.packets.fetch_add(1, Ordering::SeqCst);
    }
}

/// A packet tap that counts deliveries.
#[derive(Default)]
pub struct FakePacketEndpoint {
    pub packets: AtomicUsize,
}

impl FakePacketEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PacketEndpoint for FakePacketEndpoint {
    fn handle_packet(&self, _nic: NicId, _protocol: NetworkProtocolNumber, _pkt: &PacketBuffer) {
        self.packets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwarding toggle shared by the fake network endpoint capabilities.
#[derive(Default)]
pub struct FakeForwarding {
    enabled: AtomicBool,
}

impl ForwardingNetworkEndpoint for FakeForwarding {
    fn forwarding(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_forwarding(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }
}

impl MulticastForwardingNetworkEndpoint for FakeForwarding {
    fn multicast_forwarding(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_multicast_forwarding(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }
}

/// The per-NIC endpoint created by [`FakeNetworkProtocol`].
pub struct FakeNetworkEndpoint {
    pub nic: NicId,
    pub enabled: AtomicBool,
    pub received: AtomicUsize,
    forwarding: Option<FakeForwarding>,
    multicast_forwarding: Option<FakeForwarding>,
}

impl NetworkEndpoint for FakeNetworkEndpoint {
    fn enable(&self) -> Result<(), StackError> {
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn handle_packet(&self, _pkt: PacketBuffer) {
        self.received.fetch_add(1, Ordering::SeqCst);
    }

    fn forwarding(&self) -> Option<&dyn ForwardingNetworkEndpoint> {
        self.forwarding
            .as_ref()
            .map(|f| f as &dyn ForwardingNetworkEndpoint)
    }

    fn multicast_forwarding(&self) -> Option<&dyn MulticastForwardingNetworkEndpoint> {
        self.multicast_forwarding
            .as_ref()
            .map(|f| f as &dyn MulticastForwardingNetworkEndpoint)
    }
}

/// A resolver with a static map and a probe log.
#[derive(Default)]
pub struct FakeResolver {
    static_map: Mutex<HashMap<Address, LinkAddress>>,
    pub probes: Mutex<Vec<(NicId, Address)>>,
}

impl FakeResolver {
    pub fn add_static_mapping(&self, addr: Address, link: LinkAddress) {
        self.static_map.lock().unwrap().insert(addr, link);
    }
}

impl LinkAddressResolver for FakeResolver {
    fn resolve_static(&self, addr: &Address) -> Option<LinkAddress> {
        self.static_map.lock().unwrap().get(addr).copied()
    }

    fn probe(&self, nic: NicId, addr: &Address, _local_addr: &Address) {
        self.probes.lock().unwrap().push((nic, *addr));
    }
}

struct MulticastTable {
    enabled: bool,
    routes: HashMap<UnicastSourceAndMulticastDestination, (MulticastRoute, MonotonicTime)>,
}

/// Multicast-forwarding capability backed by a plain map.
pub struct FakeMulticastForwarding {
    state: Mutex<MulticastTable>,
}

impl Default for FakeMulticastForwarding {
    fn default() -> Self {
        Self {
            state: Mutex::new(MulticastTable {
                enabled: false,
                routes: HashMap::new(),
            }),
        }
    }
}

impl MulticastForwardingNetworkProtocol for FakeMulticastForwarding {
    fn enable_multicast_forwarding(
        &self,
        _dispatcher: Arc<dyn MulticastForwardingEventDispatcher>,
    ) -> Result<bool, StackError> {
        let mut state = self.state.lock().unwrap();
        let previous = state.enabled;
        state.enabled = true;
        Ok(previous)
    }

    fn disable_multicast_forwarding(&self) {
        let mut state = self.state.lock().unwrap();
        state.enabled = false;
        state.routes.clear();
    }

    fn add_multicast_route(
        &self,
        addresses: UnicastSourceAndMulticastDestination,
        route: MulticastRoute,
    ) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            return Err(StackError::NotPermitted);
        }
        state
            .routes
            .insert(addresses, (route, MonotonicTime::ZERO));
        Ok(())
    }

    fn remove_multicast_route(
        &self,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<(), StackError> {
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .remove(addresses)
            .map(|_| ())
            .ok_or(StackError::BadAddress)
    }

    fn multicast_route_last_used_time(
        &self,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<MonotonicTime, StackError> {
        let state = self.state.lock().unwrap();
        state
            .routes
            .get(addresses)
            .map(|(_, t)| *t)
            .ok_or(StackError::BadAddress)
    }
}

/// Builder-style configuration of a [`FakeNetworkProtocol`].
#[derive(Default)]
pub struct FakeNetworkProtocolConfig {
    pub supports_forwarding: bool,
    pub supports_multicast_forwarding: bool,
    pub with_resolver: bool,
    pub with_multicast_protocol: bool,
}

/// A network protocol stub tracking its per-NIC endpoints.
pub struct FakeNetworkProtocol {
    number: NetworkProtocolNumber,
    config: FakeNetworkProtocolConfig,
    pub resolver: FakeResolver,
    pub multicast: FakeMulticastForwarding,
    pub closed: AtomicBool,
    pub endpoints: Mutex<HashMap<NicId, Arc<FakeNetworkEndpoint>>>,
}

impl FakeNetworkProtocol {
    pub fn new(number: NetworkProtocolNumber, config: FakeNetworkProtocolConfig) -> Arc<Self> {
        Arc::new(Self {
            number,
            config,
            resolver: FakeResolver::default(),
            multicast: FakeMulticastForwarding::default(),
            closed: AtomicBool::new(false),
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// A plain protocol with forwarding support, the common test setup.
    pub fn forwarding_capable(number: NetworkProtocolNumber) -> Arc<Self> {
        Self::new(
            number,
            FakeNetworkProtocolConfig {
                supports_forwarding: true,
                ..Default::default()
            },
        )
    }

    pub fn endpoint(&self, nic: NicId) -> Option<Arc<FakeNetworkEndpoint>> {
        self.endpoints.lock().unwrap().get(&nic).cloned()
    }
}

impl NetworkProtocol for FakeNetworkProtocol {
    fn number(&self) -> NetworkProtocolNumber {
        self.number
    }

    fn new_endpoint(&self, nic: NicId) -> Arc<dyn NetworkEndpoint> {
        let endpoint = Arc::new(FakeNetworkEndpoint {
            nic,
            enabled: AtomicBool::new(false),
            received: AtomicUsize::new(0),
            forwarding: self.config.supports_forwarding.then(FakeForwarding::default),
            multicast_forwarding: self
                .config
                .supports_multicast_forwarding
                .then(FakeForwarding::default),
        });
        self.endpoints.lock().unwrap().insert(nic, endpoint.clone());
        endpoint
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn link_address_resolver(&self) -> Option<&dyn LinkAddressResolver> {
        self.config
            .with_resolver
            .then_some(&self.resolver as &dyn LinkAddressResolver)
    }

    fn multicast_forwarding(&self) -> Option<&dyn MulticastForwardingNetworkProtocol> {
        self.config
            .with_multicast_protocol
            .then_some(&self.multicast as &dyn MulticastForwardingNetworkProtocol)
    }
}

/// A transport protocol stub tracking lifecycle calls.
pub struct FakeTransportProtocol {
    number: TransportProtocolNumber,
    pub closed: AtomicBool,
    pub waited: AtomicBool,
    pub paused: AtomicUsize,
    pub resumed: AtomicUsize,
    pub restored: AtomicUsize,
}

impl FakeTransportProtocol {
    pub fn new(number: TransportProtocolNumber) -> Arc<Self> {
        Arc::new(Self {
            number,
            closed: AtomicBool::new(false),
            waited: AtomicBool::new(false),
            paused: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
            restored: AtomicUsize::new(0),
        })
    }
}

impl TransportProtocol for FakeTransportProtocol {
    fn number(&self) -> TransportProtocolNumber {
        self.number
    }

    fn new_endpoint(
        &self,
        _network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        Ok(FakeTransportEndpoint::new())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn wait(&self) {
        self.waited.store(true, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.paused.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }

    fn restore(&self) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }
}

/// A raw factory producing fake endpoints.
#[derive(Default)]
pub struct FakeRawFactory;

impl RawFactory for FakeRawFactory {
    fn new_unassociated_endpoint(
        &self,
        _stack: &Stack,
        _network: NetworkProtocolNumber,
        _transport: TransportProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        Ok(FakeTransportEndpoint::new())
    }

    fn new_packet_endpoint(
        &self,
        _stack: &Stack,
        _cooked: bool,
        _network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn PacketEndpoint>, StackError> {
        Ok(FakePacketEndpoint::new())
    }
}

/// Restore-callback recorder.
#[derive(Default)]
pub struct FakeRestoredEndpoint {
    pub restored: AtomicUsize,
}

impl FakeRestoredEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl RestoredEndpoint for FakeRestoredEndpoint {
    fn restore(&self, _stack: &Stack) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }
}

/// Resume-callback recorder.
#[derive(Default)]
pub struct FakeResumableEndpoint {
    pub resumed: AtomicUsize,
}

impl FakeResumableEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ResumableEndpoint for FakeResumableEndpoint {
    fn resume(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}
