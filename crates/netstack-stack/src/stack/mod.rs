//! The top-level orchestrator.
//!
//! A [`Stack`] owns the NIC map, the route table, the transport demuxer, and
//! the protocol registries, and sequences their lifecycles. It is cheaply
//! cloneable; clones share the same stack.
//!
//! LOCK ORDERING: `mu` (the NIC lock) before `route_table` (the route lock).
//! `cleanup_endpoints` is a leaf lock.

pub mod lifecycle;
pub mod routing;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use netstack_core::{
    Address, AddressWithPrefix, Clock, InsecureRng, LinkAddress, NetworkProtocolNumber, NicId,
    PacketBuffer, ProtocolAddress, SecureRng, StackError, StackStats, StdClock,
    TransportProtocolNumber,
};
use netstack_link::LinkEndpoint;

use crate::demux::{PortFlags, TransportDemuxer, TransportEndpointId};
use crate::filter::{AllowAllTables, IpTables, NfTables};
use crate::nic::addresses::{AddressLifetimes, AddressProperties};
use crate::nic::neighbor::{
    LinkResolutionCallback, NeighborEntry, NudConfigurations, NudDispatcher,
};
use crate::nic::{Nic, NicInfo};
use crate::ports::{EphemeralPortManager, PortManager};
use crate::proto::{
    BufferSizeRange, EndpointRef, MulticastForwardingEventDispatcher,
    MulticastForwardingNetworkProtocol, MulticastRoute, NetworkProtocol, PacketEndpoint,
    RawFactory, RawTransportEndpoint, RestoredEndpoint, ResumableEndpoint, TransportEndpoint,
    TransportProtocol, UnicastSourceAndMulticastDestination,
};
use crate::rate_limit::IcmpRateLimiter;
use crate::route::{RouteEntry, RouteTable};
use crate::stack::lifecycle::LoadGroup;

/// Minimum send/receive buffer size for non-TCP endpoints.
pub const MIN_BUFFER_SIZE: usize = 4 << 10;
/// Default send/receive buffer size for non-TCP endpoints.
pub const DEFAULT_BUFFER_SIZE: usize = 212 << 10;
/// Default maximum send/receive buffer size for non-TCP endpoints.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4 << 20;

const DEFAULT_TCP_INVALID_RATE_LIMIT: Duration = Duration::from_millis(500);

/// Instantiates a network protocol. Must not mutate the stack.
pub type NetworkProtocolFactory = Box<dyn FnOnce(&Stack) -> Arc<dyn NetworkProtocol>>;

/// Instantiates a transport protocol. Must not mutate the stack.
pub type TransportProtocolFactory = Box<dyn FnOnce(&Stack) -> Arc<dyn TransportProtocol>>;

/// Per-stack default handler for packets that match no endpoint.
pub type TransportPacketHandler =
    Arc<dyn Fn(&TransportEndpointId, &PacketBuffer) -> bool + Send + Sync>;

/// Builds the initial iptables rules when none are supplied.
pub type DefaultIpTablesFactory =
    Box<dyn FnOnce(Arc<dyn Clock>, &InsecureRng) -> Arc<dyn IpTables>>;

/// Optional stack configuration.
#[derive(Default)]
pub struct StackOptions {
    pub network_protocols: Vec<NetworkProtocolFactory>,
    pub transport_protocols: Vec<TransportProtocolFactory>,
    /// Defaults to the monotonic system clock.
    pub clock: Option<Arc<dyn Clock>>,
    /// Defaults to freshly zeroed counters.
    pub stats: Option<Arc<StackStats>>,
    /// Whether packets destined to their source are handled internally.
    pub handle_local: bool,
    pub nud_configs: Option<NudConfigurations>,
    pub nud_dispatcher: Option<Arc<dyn NudDispatcher>>,
    /// Raw endpoints are denied when absent.
    pub raw_factory: Option<Arc<dyn RawFactory>>,
    pub allow_packet_endpoint_write: bool,
    /// Thread-safe PRNG; seeded from the secure RNG when absent.
    pub rand_source: Option<InsecureRng>,
    /// Initial iptables rules; `default_iptables` is consulted when absent,
    /// and with both absent all traffic is allowed.
    pub iptables: Option<Arc<dyn IpTables>>,
    pub default_iptables: Option<DefaultIpTablesFactory>,
    pub nftables: Option<Arc<dyn NfTables>>,
    /// Defaults to the process-wide secure generator.
    pub secure_rng: Option<SecureRng>,
}

/// Configuration of a NIC as it is created. The default value creates an
/// enabled, unnamed NIC.
#[derive(Clone, Debug, Default)]
pub struct NicOptions {
    /// Optional name, unique within the stack when non-empty.
    pub name: String,
    /// Skip enabling (and attaching) the NIC.
    pub disabled: bool,
}

/// Result of a transport-header parse attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseResult {
    ParsedOk,
    UnknownTransportProtocol,
    TransportLayerParseError,
}

pub(crate) struct TransportProtocolState {
    pub(crate) proto: Arc<dyn TransportProtocol>,
    pub(crate) default_handler: RwLock<Option<TransportPacketHandler>>,
}

/// State guarded by the NIC lock.
pub(crate) struct StackState {
    pub(crate) nics: HashMap<NicId, Arc<Nic>>,
    pub(crate) default_forwarding_enabled: HashSet<NetworkProtocolNumber>,
    pub(crate) restored_endpoints: Vec<Arc<dyn RestoredEndpoint>>,
    pub(crate) resumable_endpoints: Vec<Arc<dyn ResumableEndpoint>>,
    pub(crate) save_restore_enabled: bool,
}

pub(crate) struct StackCore {
    network_protocols: OnceLock<HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>>>,
    transport_protocols: OnceLock<HashMap<TransportProtocolNumber, TransportProtocolState>>,
    demux: OnceLock<TransportDemuxer>,
    raw_factory: Option<Arc<dyn RawFactory>>,
    packet_endpoint_write_supported: bool,
    pub(crate) stats: Arc<StackStats>,
    /// The route lock. Acquired after `mu` when both are needed.
    route_table: RwLock<RouteTable>,
    /// The NIC lock.
    pub(crate) mu: RwLock<StackState>,
    nic_id_gen: AtomicU32,
    cleanup_endpoints: Mutex<HashSet<EndpointRef>>,
    port_manager: Arc<dyn PortManager>,
    clock: Arc<dyn Clock>,
    handle_local: bool,
    iptables: RwLock<Arc<dyn IpTables>>,
    nftables: RwLock<Option<Arc<dyn NfTables>>>,
    icmp_rate_limiter: IcmpRateLimiter,
    /// One-time random value fixed at construction.
    seed: u32,
    nud_configs: NudConfigurations,
    nud_dispatcher: Option<Arc<dyn NudDispatcher>>,
    insecure_rng: InsecureRng,
    secure_rng: SecureRng,
    send_buffer_size: RwLock<BufferSizeRange>,
    receive_buffer_size: RwLock<BufferSizeRange>,
    tcp_invalid_rate_limit: RwLock<Duration>,
    /// TCP timestamp offset secret fixed at construction.
    ts_offset_secret: u32,
    pub(crate) loading: LoadGroup,
}

impl StackCore {
    pub(crate) fn net_protocols(
        &self,
    ) -> &HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>> {
        self.network_protocols.get().expect("stack is initialized")
    }

    pub(crate) fn trans_protocols(
        &self,
    ) -> &HashMap<TransportProtocolNumber, TransportProtocolState> {
        self.transport_protocols.get().expect("stack is initialized")
    }

    pub(crate) fn demuxer(&self) -> &TransportDemuxer {
        self.demux.get().expect("stack is initialized")
    }
}

/// A networking stack with its protocols, NICs, and route table.
///
/// There may be several per process (network namespaces). Clones are
/// handles to the same stack.
#[derive(Clone)]
pub struct Stack {
    pub(crate) core: Arc<StackCore>,
}

impl Stack {
    /// Allocate a stack with the requested protocols configured with default
    /// options.
    pub fn new(opts: StackOptions) -> Stack {
        let clock = opts.clock.unwrap_or_else(|| Arc::new(StdClock::new()));
        let secure_rng = opts.secure_rng.unwrap_or_else(SecureRng::system);
        let insecure_rng = opts
            .rand_source
            .unwrap_or_else(|| InsecureRng::from_secure(&secure_rng));
        let iptables = match opts.iptables {
            Some(tables) => tables,
            None => match opts.default_iptables {
                Some(factory) => factory(clock.clone(), &insecure_rng),
                None => Arc::new(AllowAllTables) as Arc<dyn IpTables>,
            },
        };

        let seed = secure_rng.next_u32();
        let ts_offset_secret = secure_rng.next_u32();

        let core = Arc::new(StackCore {
            network_protocols: OnceLock::new(),
            transport_protocols: OnceLock::new(),
            demux: OnceLock::new(),
            raw_factory: opts.raw_factory,
            packet_endpoint_write_supported: opts.allow_packet_endpoint_write,
            stats: opts.stats.unwrap_or_default(),
            route_table: RwLock::new(RouteTable::new()),
            mu: RwLock::new(StackState {
                nics: HashMap::new(),
                default_forwarding_enabled: HashSet::new(),
                restored_endpoints: Vec::new(),
                resumable_endpoints: Vec::new(),
                save_restore_enabled: false,
            }),
            nic_id_gen: AtomicU32::new(0),
            cleanup_endpoints: Mutex::new(HashSet::new()),
            port_manager: Arc::new(EphemeralPortManager::new()),
            icmp_rate_limiter: IcmpRateLimiter::new(clock.clone()),
            clock,
            handle_local: opts.handle_local,
            iptables: RwLock::new(iptables),
            nftables: RwLock::new(opts.nftables),
            seed,
            nud_configs: opts.nud_configs.unwrap_or_default().sanitized(),
            nud_dispatcher: opts.nud_dispatcher,
            insecure_rng,
            secure_rng,
            send_buffer_size: RwLock::new(BufferSizeRange {
                min: MIN_BUFFER_SIZE,
                default: DEFAULT_BUFFER_SIZE,
                max: DEFAULT_MAX_BUFFER_SIZE,
            }),
            receive_buffer_size: RwLock::new(BufferSizeRange {
                min: MIN_BUFFER_SIZE,
                default: DEFAULT_BUFFER_SIZE,
                max: DEFAULT_MAX_BUFFER_SIZE,
            }),
            tcp_invalid_rate_limit: RwLock::new(DEFAULT_TCP_INVALID_RATE_LIMIT),
            ts_offset_secret,
            loading: LoadGroup::new(),
        });
        let stack = Stack { core };

        let mut net = HashMap::new();
        for factory in opts.network_protocols {
            let proto = factory(&stack);
            net.insert(proto.number(), proto);
        }
        let mut trans = HashMap::new();
        for factory in opts.transport_protocols {
            let proto = factory(&stack);
            trans.insert(
                proto.number(),
                TransportProtocolState {
                    proto,
                    default_handler: RwLock::new(None),
                },
            );
        }
        let net_numbers: Vec<_> = net.keys().copied().collect();
        let trans_numbers: Vec<_> = trans.keys().copied().collect();

        assert!(stack.core.network_protocols.set(net).is_ok());
        assert!(stack.core.transport_protocols.set(trans).is_ok());
        assert!(stack
            .core
            .demux
            .set(TransportDemuxer::new(&net_numbers, &trans_numbers, seed))
            .is_ok());

        stack
    }

    pub(crate) fn from_core(core: Arc<StackCore>) -> Stack {
        Stack { core }
    }

    /// Whether two handles refer to the same stack.
    #[must_use]
    pub fn same_stack(&self, other: &Stack) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    // -- Identifiers and accessors --

    /// Allocate the next NIC id.
    ///
    /// Panics when the 32-bit id space overflows.
    pub fn next_nic_id(&self) -> NicId {
        let next = self.core.nic_id_gen.fetch_add(1, Ordering::SeqCst) + 1;
        if next > i32::MAX as u32 {
            panic!("NIC id overflow");
        }
        NicId::new(next)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.core.clock.clone()
    }

    pub fn stats(&self) -> &StackStats {
        &self.core.stats
    }

    /// The stack's one-time random seed.
    #[must_use]
    pub fn seed(&self) -> u32 {
        self.core.seed
    }

    /// The TCP timestamp offset secret fixed at construction.
    #[must_use]
    pub fn ts_offset_secret(&self) -> u32 {
        self.core.ts_offset_secret
    }

    pub fn insecure_rng(&self) -> &InsecureRng {
        &self.core.insecure_rng
    }

    pub fn secure_rng(&self) -> &SecureRng {
        &self.core.secure_rng
    }

    /// Whether non-loopback interfaces may loop packets internally.
    #[must_use]
    pub fn handle_local(&self) -> bool {
        self.core.handle_local
    }

    /// Whether packet endpoints support write operations.
    #[must_use]
    pub fn packet_endpoint_write_supported(&self) -> bool {
        self.core.packet_endpoint_write_supported
    }

    pub fn iptables(&self) -> Arc<dyn IpTables> {
        self.core.iptables.read().unwrap().clone()
    }

    pub fn nftables(&self) -> Option<Arc<dyn NfTables>> {
        self.core.nftables.read().unwrap().clone()
    }

    pub fn set_nftables(&self, nftables: Option<Arc<dyn NfTables>>) {
        *self.core.nftables.write().unwrap() = nftables;
    }

    pub fn icmp_rate_limiter(&self) -> &IcmpRateLimiter {
        &self.core.icmp_rate_limiter
    }

    /// Whether the limiter admits an ICMP message right now.
    pub fn allow_icmp_message(&self) -> bool {
        let allowed = self.core.icmp_rate_limiter.allow();
        if !allowed {
            self.core.stats.icmp_rate_limited.increment();
        }
        allowed
    }

    pub fn port_range(&self) -> (u16, u16) {
        self.core.port_manager.port_range()
    }

    pub fn set_port_range(&self, start: u16, end: u16) -> Result<(), StackError> {
        self.core.port_manager.set_port_range(start, end)
    }

    // -- Stack-level options --

    pub fn send_buffer_size(&self) -> BufferSizeRange {
        *self.core.send_buffer_size.read().unwrap()
    }

    pub fn set_send_buffer_size(&self, range: BufferSizeRange) -> Result<(), StackError> {
        validate_buffer_range(range)?;
        *self.core.send_buffer_size.write().unwrap() = range;
        Ok(())
    }

    pub fn receive_buffer_size(&self) -> BufferSizeRange {
        *self.core.receive_buffer_size.read().unwrap()
    }

    pub fn set_receive_buffer_size(&self, range: BufferSizeRange) -> Result<(), StackError> {
        validate_buffer_range(range)?;
        *self.core.receive_buffer_size.write().unwrap() = range;
        Ok(())
    }

    /// The minimal interval between replies to invalid TCP segments of an
    /// existing connection. Zero disables the limit.
    pub fn tcp_invalid_rate_limit(&self) -> Duration {
        *self.core.tcp_invalid_rate_limit.read().unwrap()
    }

    pub fn set_tcp_invalid_rate_limit(&self, limit: Duration) {
        *self.core.tcp_invalid_rate_limit.write().unwrap() = limit;
    }

    // -- Protocol registry access --

    /// Whether a network protocol is enabled in the stack.
    #[must_use]
    pub fn check_network_protocol(&self, protocol: NetworkProtocolNumber) -> bool {
        self.core.net_protocols().contains_key(&protocol)
    }

    pub fn network_protocol_instance(
        &self,
        number: NetworkProtocolNumber,
    ) -> Option<Arc<dyn NetworkProtocol>> {
        self.core.net_protocols().get(&number).cloned()
    }

    pub fn transport_protocol_instance(
        &self,
        number: TransportProtocolNumber,
    ) -> Option<Arc<dyn TransportProtocol>> {
        self.core
            .trans_protocols()
            .get(&number)
            .map(|state| state.proto.clone())
    }

    pub fn set_network_protocol_option(
        &self,
        network: NetworkProtocolNumber,
        option: &dyn Any,
    ) -> Result<(), StackError> {
        let proto = self
            .core
            .net_protocols()
            .get(&network)
            .ok_or(StackError::UnknownProtocol)?;
        proto.set_option(option)
    }

    pub fn network_protocol_option(
        &self,
        network: NetworkProtocolNumber,
        option: &mut dyn Any,
    ) -> Result<(), StackError> {
        let proto = self
            .core
            .net_protocols()
            .get(&network)
            .ok_or(StackError::UnknownProtocol)?;
        proto.option(option)
    }

    pub fn set_transport_protocol_option(
        &self,
        transport: TransportProtocolNumber,
        option: &dyn Any,
    ) -> Result<(), StackError> {
        let state = self
            .core
            .trans_protocols()
            .get(&transport)
            .ok_or(StackError::UnknownProtocol)?;
        state.proto.set_option(option)
    }

    pub fn transport_protocol_option(
        &self,
        transport: TransportProtocolNumber,
        option: &mut dyn Any,
    ) -> Result<(), StackError> {
        let state = self
            .core
            .trans_protocols()
            .get(&transport)
            .ok_or(StackError::UnknownProtocol)?;
        state.proto.option(option)
    }

    /// The TCP send buffer limits.
    ///
    /// Fails with `UnknownProtocol` when TCP is not registered and
    /// `NotSupported` when the protocol does not report limits.
    pub fn tcp_send_buffer_limits(&self) -> Result<BufferSizeRange, StackError> {
        let state = self
            .core
            .trans_protocols()
            .get(&TransportProtocolNumber::TCP)
            .ok_or(StackError::UnknownProtocol)?;
        state.proto.send_buffer_limits().ok_or(StackError::NotSupported)
    }

    /// Set the per-stack default handler for the given protocol.
    ///
    /// Must only be called during initialization of the stack.
    pub fn set_transport_protocol_handler(
        &self,
        transport: TransportProtocolNumber,
        handler: Option<TransportPacketHandler>,
    ) {
        if let Some(state) = self.core.trans_protocols().get(&transport) {
            *state.default_handler.write().unwrap() = handler;
        }
    }

    /// Parse the transport header of `pkt` with the registered protocol.
    pub fn parse_packet_buffer_transport(
        &self,
        protocol: TransportProtocolNumber,
        pkt: &mut PacketBuffer,
    ) -> ParseResult {
        pkt.transport_protocol = Some(protocol);
        let Some(state) = self.core.trans_protocols().get(&protocol) else {
            return ParseResult::UnknownTransportProtocol;
        };
        if !state.proto.parse(pkt) {
            return ParseResult::TransportLayerParseError;
        }
        ParseResult::ParsedOk
    }

    // -- Endpoint construction --

    /// Create a transport endpoint of the given protocol.
    pub fn new_endpoint(
        &self,
        transport: TransportProtocolNumber,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        let state = self
            .core
            .trans_protocols()
            .get(&transport)
            .ok_or(StackError::UnknownProtocol)?;
        state.proto.new_endpoint(network)
    }

    /// Create a raw endpoint receiving all traffic of a protocol.
    ///
    /// Fails with `NotPermitted` when the stack has no raw factory.
    pub fn new_raw_endpoint(
        &self,
        transport: TransportProtocolNumber,
        network: NetworkProtocolNumber,
        associated: bool,
    ) -> Result<Arc<dyn TransportEndpoint>, StackError> {
        let Some(factory) = &self.core.raw_factory else {
            tracing::info!("raw endpoint requested but no raw factory is configured");
            return Err(StackError::NotPermitted);
        };
        if !associated {
            return factory.new_unassociated_endpoint(self, network, transport);
        }
        let state = self
            .core
            .trans_protocols()
            .get(&transport)
            .ok_or(StackError::UnknownProtocol)?;
        state.proto.new_raw_endpoint(network)
    }

    /// Create a packet endpoint listening for the given network protocol.
    pub fn new_packet_endpoint(
        &self,
        cooked: bool,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn PacketEndpoint>, StackError> {
        let Some(factory) = &self.core.raw_factory else {
            return Err(StackError::NotPermitted);
        };
        factory.new_packet_endpoint(self, cooked, network)
    }

    // -- NIC lifecycle --

    /// Create a NIC with the provided id and link endpoint, using default
    /// options.
    pub fn create_nic(
        &self,
        id: NicId,
        ep: Arc<dyn LinkEndpoint>,
    ) -> Result<(), StackError> {
        self.create_nic_with_options(id, ep, NicOptions::default())
    }

    /// Create a NIC with the provided id, link endpoint, and options.
    pub fn create_nic_with_options(
        &self,
        id: NicId,
        ep: Arc<dyn LinkEndpoint>,
        opts: NicOptions,
    ) -> Result<(), StackError> {
        let mut state = self.core.mu.write().unwrap();

        if id.is_unspecified() {
            return Err(StackError::InvalidNicId);
        }
        if state.nics.contains_key(&id) {
            return Err(StackError::DuplicateNicId);
        }
        if !opts.name.is_empty() && state.nics.values().any(|n| n.name() == opts.name) {
            return Err(StackError::DuplicateNicId);
        }

        let nic = Nic::new(
            Arc::downgrade(&self.core),
            id,
            opts.name.clone(),
            ep.clone(),
            self.core.net_protocols(),
            self.core.nud_configs,
            self.core.nud_dispatcher.clone(),
            self.core.clock.clone(),
        );

        let defaults: Vec<_> = state.default_forwarding_enabled.iter().copied().collect();
        let mut done_once = false;
        for proto in defaults {
            if let Err(err) = nic.set_forwarding(proto, true) {
                // Forwarding support is expected to be uniform across NICs.
                if done_once {
                    panic!(
                        "nic(id={}).set_forwarding({}, true): {err}",
                        id.0, proto.0
                    );
                }
                return Err(err);
            }
            done_once = true;
        }

        state.nics.insert(id, nic.clone());
        tracing::info!(nic = id.0, name = %opts.name, "nic created");

        let weak = Arc::downgrade(&self.core);
        ep.set_on_close_action(Some(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                let _ = Stack::from_core(core).remove_nic(id);
            }
        })));

        if !opts.disabled {
            return nic.enable();
        }
        Ok(())
    }

    /// Remove a NIC and all routes through it.
    pub fn remove_nic(&self, id: NicId) -> Result<(), StackError> {
        let deferred = {
            let mut state = self.core.mu.write().unwrap();
            self.remove_nic_locked(&mut state, id)?
        };
        if let Some(act) = deferred {
            act();
        }
        Ok(())
    }

    /// Remove a NIC while holding the NIC lock. Routes through the NIC are
    /// purged in the same critical section; the returned action must run
    /// after the locks are released.
    pub(crate) fn remove_nic_locked(
        &self,
        state: &mut StackState,
        id: NicId,
    ) -> Result<Option<Box<dyn FnOnce() + Send>>, StackError> {
        let nic = state.nics.remove(&id).ok_or(StackError::UnknownNicId)?;

        if let Some(coordinator) = nic.coordinator() {
            if let Some(coord) = coordinator.link().coordinator() {
                coord.del_port(id)?;
            }
            nic.set_coordinator(None);
        }

        self.core.route_table.write().unwrap().remove(|r| r.nic == id);

        Ok(nic.remove(true))
    }

    /// Move a NIC to another stack. The link endpoint is not closed; the
    /// peer allocates a fresh id and reattaches the endpoint.
    pub fn set_nic_stack(&self, id: NicId, peer: &Stack) -> Result<NicId, StackError> {
        let (nic, deferred) = {
            let mut state = self.core.mu.write().unwrap();
            let nic = state.nics.get(&id).cloned().ok_or(StackError::UnknownNicId)?;
            if self.same_stack(peer) {
                return Ok(id);
            }
            state.nics.remove(&id);
            self.core.route_table.write().unwrap().remove(|r| r.nic == id);
            let deferred = nic.remove(false);
            (nic, deferred)
        };
        if let Some(act) = deferred {
            act();
        }

        let new_id = peer.next_nic_id();
        peer.create_nic_with_options(
            new_id,
            nic.link().clone(),
            NicOptions {
                name: nic.name(),
                disabled: false,
            },
        )?;
        Ok(new_id)
    }

    fn get_nic(&self, id: NicId) -> Result<Arc<Nic>, StackError> {
        self.core
            .mu
            .read()
            .unwrap()
            .nics
            .get(&id)
            .cloned()
            .ok_or(StackError::UnknownNicId)
    }

    /// Enable the given NIC so the link endpoint can start delivering
    /// packets to it.
    pub fn enable_nic(&self, id: NicId) -> Result<(), StackError> {
        self.get_nic(id)?.enable()
    }

    pub fn disable_nic(&self, id: NicId) -> Result<(), StackError> {
        self.get_nic(id)?.disable();
        Ok(())
    }

    /// Whether the NIC exists and is enabled.
    #[must_use]
    pub fn check_nic(&self, id: NicId) -> bool {
        self.get_nic(id).map(|n| n.is_enabled()).unwrap_or(false)
    }

    /// Whether the NIC id is defined in the stack.
    #[must_use]
    pub fn has_nic(&self, id: NicId) -> bool {
        self.core.mu.read().unwrap().nics.contains_key(&id)
    }

    pub fn set_nic_name(&self, id: NicId, name: String) -> Result<(), StackError> {
        self.get_nic(id)?.set_name(name);
        Ok(())
    }

    pub fn set_nic_mtu(&self, id: NicId, mtu: u32) -> Result<(), StackError> {
        self.get_nic(id)?.link().set_mtu(mtu);
        Ok(())
    }

    /// Set the NIC's hardware (link) address.
    pub fn set_nic_address(&self, id: NicId, addr: LinkAddress) -> Result<(), StackError> {
        self.get_nic(id)?.link().set_link_address(addr);
        Ok(())
    }

    /// Subordinate NIC `id` to the coordinator NIC `mid`.
    pub fn set_nic_coordinator(&self, id: NicId, mid: NicId) -> Result<(), StackError> {
        let state = self.core.mu.write().unwrap();
        let nic = state.nics.get(&id).ok_or(StackError::UnknownNicId)?;
        // A coordinator cannot itself be subordinated.
        if nic.link().coordinator().is_some() {
            return Err(StackError::NoSuchFile);
        }
        let coordinator = state.nics.get(&mid).ok_or(StackError::UnknownNicId)?;
        let Some(coord_link) = coordinator.link().coordinator() else {
            return Err(StackError::NotSupported);
        };
        coord_link.add_port(id)?;
        nic.set_coordinator(Some(coordinator.clone()));
        Ok(())
    }

    /// The name of the NIC, or empty when unknown.
    #[must_use]
    pub fn find_nic_name_from_id(&self, id: NicId) -> String {
        self.get_nic(id).map(|n| n.name()).unwrap_or_default()
    }

    /// The link endpoint of the NIC with the given name, if any.
    pub fn get_link_endpoint_by_name(&self, name: &str) -> Option<Arc<dyn LinkEndpoint>> {
        let state = self.core.mu.read().unwrap();
        state
            .nics
            .values()
            .find(|n| n.name() == name)
            .map(|n| n.link().clone())
    }

    /// Information about the NIC. Fails with `NoSuchFile` when absent.
    pub fn get_nic_info(&self, id: NicId) -> Result<NicInfo, StackError> {
        let state = self.core.mu.read().unwrap();
        state
            .nics
            .get(&id)
            .map(|n| n.info())
            .ok_or(StackError::NoSuchFile)
    }

    /// Information about every NIC.
    #[must_use]
    pub fn nic_info(&self) -> HashMap<NicId, NicInfo> {
        let state = self.core.mu.read().unwrap();
        state.nics.iter().map(|(&id, n)| (id, n.info())).collect()
    }

    // -- Forwarding --

    /// Enable or disable forwarding on a NIC. Returns the previous setting.
    pub fn set_nic_forwarding(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
        enable: bool,
    ) -> Result<bool, StackError> {
        self.get_nic(id)?.set_forwarding(protocol, enable)
    }

    pub fn nic_forwarding(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<bool, StackError> {
        self.get_nic(id)?.forwarding(protocol)
    }

    /// Set forwarding on every NIC and the default for new NICs.
    pub fn set_forwarding_default_and_all_nics(
        &self,
        protocol: NetworkProtocolNumber,
        enable: bool,
    ) -> Result<(), StackError> {
        let mut state = self.core.mu.write().unwrap();

        let mut done_once = false;
        for (id, nic) in &state.nics {
            if let Err(err) = nic.set_forwarding(protocol, enable) {
                // Forwarding support is expected to be uniform across NICs.
                if done_once {
                    panic!(
                        "nic(id={}).set_forwarding({}, {enable}): {err}",
                        id.0, protocol.0
                    );
                }
                return Err(err);
            }
            done_once = true;
        }

        if enable {
            state.default_forwarding_enabled.insert(protocol);
        } else {
            state.default_forwarding_enabled.remove(&protocol);
        }
        Ok(())
    }

    pub fn set_nic_multicast_forwarding(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
        enable: bool,
    ) -> Result<bool, StackError> {
        self.get_nic(id)?.set_multicast_forwarding(protocol, enable)
    }

    pub fn nic_multicast_forwarding(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<bool, StackError> {
        self.get_nic(id)?.multicast_forwarding(protocol)
    }

    fn multicast_forwarding_protocol(
        &self,
        protocol: NetworkProtocolNumber,
    ) -> Result<Arc<dyn NetworkProtocol>, StackError> {
        self.core
            .net_protocols()
            .get(&protocol)
            .cloned()
            .ok_or(StackError::UnknownProtocol)
    }

    /// Enable multicast forwarding for a protocol. Returns whether it was
    /// already enabled.
    pub fn enable_multicast_forwarding_for_protocol(
        &self,
        protocol: NetworkProtocolNumber,
        dispatcher: Arc<dyn MulticastForwardingEventDispatcher>,
    ) -> Result<bool, StackError> {
        with_multicast_protocol(&self.multicast_forwarding_protocol(protocol)?, |p| {
            p.enable_multicast_forwarding(dispatcher)
        })
    }

    pub fn disable_multicast_forwarding_for_protocol(
        &self,
        protocol: NetworkProtocolNumber,
    ) -> Result<(), StackError> {
        with_multicast_protocol(&self.multicast_forwarding_protocol(protocol)?, |p| {
            p.disable_multicast_forwarding();
            Ok(())
        })
    }

    pub fn add_multicast_route(
        &self,
        protocol: NetworkProtocolNumber,
        addresses: UnicastSourceAndMulticastDestination,
        route: MulticastRoute,
    ) -> Result<(), StackError> {
        with_multicast_protocol(&self.multicast_forwarding_protocol(protocol)?, |p| {
            p.add_multicast_route(addresses, route)
        })
    }

    pub fn remove_multicast_route(
        &self,
        protocol: NetworkProtocolNumber,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<(), StackError> {
        with_multicast_protocol(&self.multicast_forwarding_protocol(protocol)?, |p| {
            p.remove_multicast_route(addresses)
        })
    }

    pub fn multicast_route_last_used_time(
        &self,
        protocol: NetworkProtocolNumber,
        addresses: &UnicastSourceAndMulticastDestination,
    ) -> Result<netstack_core::MonotonicTime, StackError> {
        with_multicast_protocol(&self.multicast_forwarding_protocol(protocol)?, |p| {
            p.multicast_route_last_used_time(addresses)
        })
    }

    // -- Route table --

    /// Replace the route table.
    pub fn set_route_table(&self, table: Vec<RouteEntry>) {
        self.core.route_table.write().unwrap().set(table);
    }

    /// A snapshot of the route table in use.
    #[must_use]
    pub fn get_route_table(&self) -> Vec<RouteEntry> {
        self.core.route_table.read().unwrap().snapshot()
    }

    /// Append a route, keeping the table ordered by prefix length.
    pub fn add_route(&self, route: RouteEntry) {
        self.core.route_table.write().unwrap().add(route);
    }

    /// Remove matching routes; returns how many were removed.
    pub fn remove_routes<F>(&self, matcher: F) -> usize
    where
        F: Fn(&RouteEntry) -> bool,
    {
        self.core.route_table.write().unwrap().remove(matcher)
    }

    /// Replace the route sharing `route`'s lookup key, inserting it when no
    /// match exists.
    pub fn replace_route(&self, route: RouteEntry) {
        self.core.route_table.write().unwrap().replace(route);
    }

    // -- Addresses --

    pub fn add_protocol_address(
        &self,
        id: NicId,
        protocol_address: ProtocolAddress,
        properties: AddressProperties,
    ) -> Result<(), StackError> {
        self.get_nic(id)?.add_address(protocol_address, properties)
    }

    pub fn remove_address(&self, id: NicId, addr: &Address) -> Result<(), StackError> {
        self.get_nic(id)?.remove_address(addr)
    }

    pub fn set_address_lifetimes(
        &self,
        id: NicId,
        addr: &Address,
        lifetimes: AddressLifetimes,
    ) -> Result<(), StackError> {
        self.get_nic(id)?.set_address_lifetimes(addr, lifetimes)
    }

    /// All permanent protocol addresses, keyed by NIC.
    #[must_use]
    pub fn all_addresses(&self) -> HashMap<NicId, Vec<ProtocolAddress>> {
        let state = self.core.mu.read().unwrap();
        state
            .nics
            .iter()
            .map(|(&id, nic)| (id, nic.all_permanent_addresses()))
            .collect()
    }

    /// The first primary address for the NIC and protocol; the zero value
    /// when the NIC holds no address for the protocol.
    pub fn get_main_nic_address(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<AddressWithPrefix, StackError> {
        let nic = self.get_nic(id)?;
        nic.primary_address(protocol)
    }

    /// The NIC owning `addr`, or the unspecified id when absent.
    ///
    /// With an explicit NIC and IPv4, only the interface is checked,
    /// matching host behavior.
    #[must_use]
    pub fn check_local_address(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        addr: &Address,
    ) -> NicId {
        let state = self.core.mu.read().unwrap();
        if !nic_id.is_unspecified() {
            let Some(nic) = state.nics.get(&nic_id) else {
                return NicId::UNSPECIFIED;
            };
            if protocol == NetworkProtocolNumber::IPV4 {
                return nic_id;
            }
            if nic.has_address(protocol, addr) {
                return nic_id;
            }
            return NicId::UNSPECIFIED;
        }
        for nic in state.nics.values() {
            if nic.has_address(protocol, addr) {
                return nic.id();
            }
        }
        NicId::UNSPECIFIED
    }

    /// Whether `addr` is a subnet-local broadcast address on the NIC (or on
    /// any NIC when unspecified).
    #[must_use]
    pub fn is_subnet_broadcast(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        addr: &Address,
    ) -> bool {
        let state = self.core.mu.read().unwrap();
        if !nic_id.is_unspecified() {
            return state
                .nics
                .get(&nic_id)
                .is_some_and(|nic| nic.is_subnet_broadcast(protocol, addr));
        }
        state
            .nics
            .values()
            .any(|nic| nic.is_subnet_broadcast(protocol, addr))
    }

    pub fn set_promiscuous_mode(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        self.get_nic(id)?.set_promiscuous(enable);
        Ok(())
    }

    /// Enable or disable address spoofing, allowing endpoints to bind any
    /// address on the NIC.
    pub fn set_spoofing(&self, id: NicId, enable: bool) -> Result<(), StackError> {
        self.get_nic(id)?.set_spoofing(enable);
        Ok(())
    }

    // -- Multicast groups --

    pub fn join_group(
        &self,
        protocol: NetworkProtocolNumber,
        nic_id: NicId,
        multicast_addr: &Address,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?.join_group(protocol, multicast_addr)
    }

    pub fn leave_group(
        &self,
        protocol: NetworkProtocolNumber,
        nic_id: NicId,
        multicast_addr: &Address,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?.leave_group(protocol, multicast_addr)
    }

    pub fn is_in_group(&self, nic_id: NicId, multicast_addr: &Address) -> Result<bool, StackError> {
        Ok(self.get_nic(nic_id)?.is_in_group(multicast_addr))
    }

    // -- Neighbors --

    /// Resolve a network address to a link address on the given NIC.
    ///
    /// `on_resolve` runs immediately when resolution is not required;
    /// otherwise it is queued, resolution is triggered asynchronously, and
    /// `WouldBlock` is returned.
    pub fn get_link_address(
        &self,
        nic_id: NicId,
        addr: &Address,
        local_addr: &Address,
        protocol: NetworkProtocolNumber,
        on_resolve: LinkResolutionCallback,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?
            .get_link_address(addr, local_addr, protocol, on_resolve)
    }

    /// Report an asynchronous link-resolution outcome. Called by protocol
    /// glue when a reply or timeout arrives.
    pub fn complete_link_resolution(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        addr: &Address,
        result: Result<LinkAddress, StackError>,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?
            .handle_link_resolution(protocol, addr, result);
        Ok(())
    }

    pub fn neighbors(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<Vec<NeighborEntry>, StackError> {
        self.get_nic(nic_id)?.neighbors(protocol)
    }

    pub fn add_static_neighbor(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        addr: Address,
        link_addr: LinkAddress,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?
            .add_static_neighbor(protocol, addr, link_addr)
    }

    pub fn remove_neighbor(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        addr: &Address,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?.remove_neighbor(protocol, addr)
    }

    pub fn clear_neighbors(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<(), StackError> {
        self.get_nic(nic_id)?.clear_neighbors(protocol)
    }

    pub fn nud_configurations(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
    ) -> Result<NudConfigurations, StackError> {
        self.get_nic(id)?.nud_configs(protocol)
    }

    /// Set per-interface NUD configurations; invalid values are replaced by
    /// defaults.
    pub fn set_nud_configurations(
        &self,
        id: NicId,
        protocol: NetworkProtocolNumber,
        configs: NudConfigurations,
    ) -> Result<(), StackError> {
        self.get_nic(id)?.set_nud_configs(protocol, configs)
    }

    // -- Packet endpoints --

    /// Register `ep` to receive all traffic of `protocol` on the NIC; with
    /// the unspecified id, on every NIC.
    pub fn register_packet_endpoint(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        ep: Arc<dyn PacketEndpoint>,
    ) -> Result<(), StackError> {
        let state = self.core.mu.write().unwrap();
        if nic_id.is_unspecified() {
            for nic in state.nics.values() {
                nic.register_packet_endpoint(protocol, ep.clone());
            }
            return Ok(());
        }
        let nic = state.nics.get(&nic_id).ok_or(StackError::UnknownNicId)?;
        nic.register_packet_endpoint(protocol, ep);
        Ok(())
    }

    pub fn unregister_packet_endpoint(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        ep: &Arc<dyn PacketEndpoint>,
    ) {
        let state = self.core.mu.write().unwrap();
        if nic_id.is_unspecified() {
            for nic in state.nics.values() {
                nic.unregister_packet_endpoint(protocol, ep);
            }
            return;
        }
        if let Some(nic) = state.nics.get(&nic_id) {
            nic.unregister_packet_endpoint(protocol, ep);
        }
    }

    /// Write a payload on the NIC toward the given remote link address.
    pub fn write_packet_to_remote(
        &self,
        nic_id: NicId,
        remote: LinkAddress,
        protocol: NetworkProtocolNumber,
        payload: &[u8],
    ) -> Result<(), StackError> {
        let nic = {
            let state = self.core.mu.read().unwrap();
            state
                .nics
                .get(&nic_id)
                .cloned()
                .ok_or(StackError::UnknownDevice)?
        };
        let mut pkt = PacketBuffer::with_reserve(
            usize::from(nic.link().max_header_length()),
            payload,
        );
        pkt.network_protocol = Some(protocol);
        pkt.remote_link_address = Some(remote);
        nic.write_packet(pkt)
    }

    /// Write data to the NIC with the link header already in the payload.
    pub fn write_raw_packet(
        &self,
        nic_id: NicId,
        protocol: NetworkProtocolNumber,
        payload: &[u8],
    ) -> Result<(), StackError> {
        let nic = self.get_nic(nic_id)?;
        let mut pkt = PacketBuffer::with_payload(payload.to_vec());
        pkt.network_protocol = Some(protocol);
        nic.write_packet(pkt)
    }

    // -- Transport demuxer delegation --

    /// Register a transport endpoint for packet delivery. NIC-scoped ids
    /// have precedence over global ones.
    pub fn register_transport_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_to_device: NicId,
    ) -> Result<(), StackError> {
        self.core
            .demuxer()
            .register_endpoint(net_protos, protocol, id, ep, flags, bind_to_device)
    }

    /// Run the registration conflict check without committing.
    pub fn check_register_transport_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: TransportEndpointId,
        flags: PortFlags,
        bind_to_device: NicId,
    ) -> Result<(), StackError> {
        self.core
            .demuxer()
            .check_endpoint(net_protos, protocol, id, flags, bind_to_device)
    }

    /// Remove a registration; a no-op for endpoints never registered.
    pub fn unregister_transport_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        bind_to_device: NicId,
    ) {
        self.core
            .demuxer()
            .unregister_endpoint(net_protos, protocol, id, ep, bind_to_device);
    }

    /// Unregister the endpoint and move it into the cleanup set.
    pub fn start_transport_endpoint_cleanup(
        &self,
        net_protos: &[NetworkProtocolNumber],
        protocol: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        bind_to_device: NicId,
    ) {
        self.core
            .cleanup_endpoints
            .lock()
            .unwrap()
            .insert(EndpointRef(ep.clone()));
        self.core
            .demuxer()
            .unregister_endpoint(net_protos, protocol, id, ep, bind_to_device);
    }

    /// Remove the endpoint from the cleanup set.
    pub fn complete_transport_endpoint_cleanup(&self, ep: &Arc<dyn TransportEndpoint>) {
        self.core
            .cleanup_endpoints
            .lock()
            .unwrap()
            .remove(&EndpointRef(ep.clone()));
    }

    /// The endpoint most closely matching `id`, if any.
    pub fn find_transport_endpoint(
        &self,
        net_proto: NetworkProtocolNumber,
        trans_proto: TransportProtocolNumber,
        id: TransportEndpointId,
        nic_id: NicId,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        self.core
            .demuxer()
            .find_transport_endpoint(net_proto, trans_proto, id, nic_id)
    }

    pub fn register_raw_transport_endpoint(
        &self,
        net_proto: NetworkProtocolNumber,
        trans_proto: TransportProtocolNumber,
        ep: Arc<dyn RawTransportEndpoint>,
    ) -> Result<(), StackError> {
        self.core
            .demuxer()
            .register_raw_endpoint(net_proto, trans_proto, ep)
    }

    pub fn unregister_raw_transport_endpoint(
        &self,
        net_proto: NetworkProtocolNumber,
        trans_proto: TransportProtocolNumber,
        ep: &Arc<dyn RawTransportEndpoint>,
    ) {
        self.core
            .demuxer()
            .unregister_raw_endpoint(net_proto, trans_proto, ep);
    }

    /// Every endpoint currently registered with the demuxer.
    #[must_use]
    pub fn registered_endpoints(&self) -> Vec<Arc<dyn TransportEndpoint>> {
        self.core.demuxer().transport_endpoints()
    }

    /// Endpoints currently in the cleanup state.
    #[must_use]
    pub fn cleanup_endpoints(&self) -> Vec<Arc<dyn TransportEndpoint>> {
        let set = self.core.cleanup_endpoints.lock().unwrap();
        set.iter().map(|e| e.0.clone()).collect()
    }

    /// Rebuild the cleanup set after a restore.
    pub fn restore_cleanup_endpoints(&self, endpoints: Vec<Arc<dyn TransportEndpoint>>) {
        let mut set = self.core.cleanup_endpoints.lock().unwrap();
        for ep in endpoints {
            set.insert(EndpointRef(ep));
        }
    }
}

fn validate_buffer_range(range: BufferSizeRange) -> Result<(), StackError> {
    if range.min == 0 || range.min > range.default || range.default > range.max {
        return Err(StackError::InvalidOptionValue);
    }
    Ok(())
}

fn with_multicast_protocol<T>(
    proto: &Arc<dyn NetworkProtocol>,
    f: impl FnOnce(&dyn MulticastForwardingNetworkProtocol) -> Result<T, StackError>,
) -> Result<T, StackError> {
    match proto.multicast_forwarding() {
        Some(p) => f(p),
        None => Err(StackError::NotSupported),
    }
}
