//! End-to-end scenarios for the stack orchestration surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use netstack_core::{
    Address, LinkAddress, NetworkProtocolNumber, NicId, ProtocolAddress, StackError,
    TransportProtocolNumber,
};
use netstack_link::{
    ChannelConfig, ChannelEndpoint, CoordinatorLink, LinkCapabilities, LinkEndpoint,
    LoopbackEndpoint, NetworkDispatcher, OnCloseAction,
};
use netstack_stack::testutil::{
    FakeNetworkProtocol, FakeNetworkProtocolConfig, FakeRawFactory, FakeRestoredEndpoint,
    FakeResumableEndpoint, FakeTransportEndpoint, FakeTransportProtocol,
};
use netstack_stack::{
    AddressProperties, BufferSizeRange, MulticastForwardingEventDispatcher, MulticastPacketContext,
    MulticastRoute, NetworkProtocol, PacketLooping, PortFlags, RouteEntry, Stack, StackOptions,
    TransportEndpoint, TransportEndpointId, TransportProtocol,
};

const IPV4: NetworkProtocolNumber = NetworkProtocolNumber::IPV4;
const UDP: TransportProtocolNumber = TransportProtocolNumber::UDP;
const TCP: TransportProtocolNumber = TransportProtocolNumber::TCP;

fn v4(a: u8, b: u8, c: u8, d: u8) -> Address {
    Address::from_v4([a, b, c, d])
}

fn subnet(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> netstack_core::Subnet {
    netstack_core::Subnet::new(v4(a, b, c, d), prefix)
}

struct TestSetup {
    stack: Stack,
    net_proto: Arc<FakeNetworkProtocol>,
    trans_proto: Arc<FakeTransportProtocol>,
}

fn new_test_stack(config: FakeNetworkProtocolConfig) -> TestSetup {
    let net_proto = FakeNetworkProtocol::new(IPV4, config);
    let trans_proto = FakeTransportProtocol::new(UDP);

    let net_factory = net_proto.clone();
    let trans_factory = trans_proto.clone();
    let stack = Stack::new(StackOptions {
        network_protocols: vec![Box::new(move |_| net_factory as Arc<dyn NetworkProtocol>)],
        transport_protocols: vec![Box::new(move |_| {
            trans_factory as Arc<dyn TransportProtocol>
        })],
        ..Default::default()
    });
    TestSetup {
        stack,
        net_proto,
        trans_proto,
    }
}

fn default_setup() -> TestSetup {
    new_test_stack(FakeNetworkProtocolConfig {
        supports_forwarding: true,
        ..Default::default()
    })
}

fn channel() -> Arc<ChannelEndpoint> {
    ChannelEndpoint::new(ChannelConfig::default())
}

fn add_v4_address(stack: &Stack, nic: NicId, addr: Address, prefix: u8) {
    stack
        .add_protocol_address(
            nic,
            ProtocolAddress {
                protocol: IPV4,
                address_with_prefix: addr.with_prefix(prefix),
            },
            AddressProperties::default(),
        )
        .unwrap();
}

// === S1: unknown protocol ===

#[test]
fn new_endpoint_with_unregistered_protocol_fails() {
    let net_proto = FakeNetworkProtocol::forwarding_capable(IPV4);
    let stack = Stack::new(StackOptions {
        network_protocols: vec![Box::new(move |_| net_proto as Arc<dyn NetworkProtocol>)],
        ..Default::default()
    });
    assert_eq!(
        stack.new_endpoint(TCP, IPV4).err(),
        Some(StackError::UnknownProtocol)
    );
}

// === S2: duplicate NIC name ===

#[test]
fn duplicate_nic_name_is_rejected() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack
        .create_nic_with_options(
            NicId::new(1),
            channel(),
            netstack_stack::NicOptions {
                name: "eth0".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    let err = stack
        .create_nic_with_options(
            NicId::new(2),
            channel(),
            netstack_stack::NicOptions {
                name: "eth0".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert_eq!(err, StackError::DuplicateNicId);

    // A different name is fine, and lookups by name resolve.
    stack
        .create_nic_with_options(
            NicId::new(2),
            channel(),
            netstack_stack::NicOptions {
                name: "eth1".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(stack.get_link_endpoint_by_name("eth1").is_some());
    assert!(stack.get_link_endpoint_by_name("eth9").is_none());
    assert_eq!(stack.find_nic_name_from_id(NicId::new(2)), "eth1");
}

// === S3: route purge on NIC removal ===

#[test]
fn remove_nic_purges_its_routes() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(7), channel()).unwrap();
    let r1 = RouteEntry::directly_connected(subnet(10, 0, 0, 0, 8), NicId::new(7));
    let r2 = RouteEntry::directly_connected(subnet(192, 168, 1, 0, 24), NicId::new(9));
    stack.add_route(r1);
    stack.add_route(r2);

    stack.remove_nic(NicId::new(7)).unwrap();

    assert!(!stack.has_nic(NicId::new(7)));
    assert_eq!(stack.get_route_table(), vec![r2]);

    // Property 1: no route through the removed NIC survives.
    assert!(stack.get_route_table().iter().all(|r| r.nic != NicId::new(7)));
    assert_eq!(
        stack.remove_nic(NicId::new(7)),
        Err(StackError::UnknownNicId)
    );
}

// === S4: longest-prefix ordering ===

#[test]
fn route_table_orders_by_decreasing_prefix() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.add_route(RouteEntry::directly_connected(
        subnet(0, 0, 0, 0, 0),
        NicId::new(1),
    ));
    assert_eq!(prefixes(stack), vec![0]);

    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(2),
    ));
    assert_eq!(prefixes(stack), vec![8, 0]);

    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 1, 0, 0, 16),
        NicId::new(3),
    ));
    assert_eq!(prefixes(stack), vec![16, 8, 0]);
}

fn prefixes(stack: &Stack) -> Vec<u8> {
    stack
        .get_route_table()
        .iter()
        .map(|r| r.destination.prefix())
        .collect()
}

#[test]
fn set_route_table_round_trips() {
    let setup = default_setup();
    let stack = &setup.stack;

    let routes = vec![
        RouteEntry::directly_connected(subnet(0, 0, 0, 0, 0), NicId::new(1)),
        RouteEntry::directly_connected(subnet(10, 0, 0, 0, 8), NicId::new(2)),
    ];
    stack.set_route_table(routes);
    assert_eq!(prefixes(stack), vec![8, 0]);

    // Round-trip law: add then remove restores the previous table.
    let before = stack.get_route_table();
    let extra = RouteEntry::directly_connected(subnet(172, 16, 0, 0, 12), NicId::new(5));
    stack.add_route(extra);
    assert_eq!(stack.remove_routes(|r| *r == extra), 1);
    assert_eq!(stack.get_route_table(), before);
}

// === S5: raw endpoints without a raw factory ===

#[test]
fn raw_endpoint_requires_raw_factory() {
    let setup = default_setup();
    assert_eq!(
        setup
            .stack
            .new_raw_endpoint(UDP, IPV4, true)
            .err(),
        Some(StackError::NotPermitted)
    );
    assert_eq!(
        setup.stack.new_packet_endpoint(true, IPV4).err(),
        Some(StackError::NotPermitted)
    );

    let net_proto = FakeNetworkProtocol::forwarding_capable(IPV4);
    let with_factory = Stack::new(StackOptions {
        network_protocols: vec![Box::new(move |_| net_proto as Arc<dyn NetworkProtocol>)],
        raw_factory: Some(Arc::new(FakeRawFactory)),
        ..Default::default()
    });
    assert!(with_factory.new_raw_endpoint(UDP, IPV4, false).is_ok());
    assert!(with_factory.new_packet_endpoint(true, IPV4).is_ok());
}

// === S6: direct route to an enabled NIC ===

#[test]
fn find_route_direct_to_multicast_remote() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);

    let route = stack
        .find_route(NicId::new(1), &v4(10, 0, 0, 1), &v4(224, 0, 0, 1), IPV4, false)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(1));
    assert!(route.gateway.is_empty());
    assert_eq!(route.local_address, v4(10, 0, 0, 1));
    assert_eq!(route.remote_address, v4(224, 0, 0, 1));
    assert_eq!(route.looping, PacketLooping::Out);
}

// === NIC lifecycle ===

#[test]
fn create_nic_with_zero_id_fails() {
    let setup = default_setup();
    assert_eq!(
        setup.stack.create_nic(NicId::UNSPECIFIED, channel()),
        Err(StackError::InvalidNicId)
    );
}

#[test]
fn create_nic_duplicate_id_fails() {
    let setup = default_setup();
    setup.stack.create_nic(NicId::new(1), channel()).unwrap();
    assert_eq!(
        setup.stack.create_nic(NicId::new(1), channel()),
        Err(StackError::DuplicateNicId)
    );
}

#[test]
fn nic_enable_disable_cycle() {
    let setup = default_setup();
    let stack = &setup.stack;
    let ep = channel();

    stack
        .create_nic_with_options(
            NicId::new(1),
            ep.clone(),
            netstack_stack::NicOptions {
                disabled: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(stack.has_nic(NicId::new(1)));
    assert!(!stack.check_nic(NicId::new(1)));
    assert!(!ep.is_attached());

    stack.enable_nic(NicId::new(1)).unwrap();
    assert!(stack.check_nic(NicId::new(1)));
    assert!(ep.is_attached());
    // Idempotent.
    stack.enable_nic(NicId::new(1)).unwrap();

    // The protocol endpoint tracks the enabled state.
    let net_ep = setup.net_proto.endpoint(NicId::new(1)).unwrap();
    assert!(net_ep.enabled.load(Ordering::SeqCst));

    stack.disable_nic(NicId::new(1)).unwrap();
    assert!(!stack.check_nic(NicId::new(1)));
    assert!(!net_ep.enabled.load(Ordering::SeqCst));

    assert_eq!(
        stack.enable_nic(NicId::new(9)),
        Err(StackError::UnknownNicId)
    );
}

#[test]
fn link_close_removes_the_nic() {
    let setup = default_setup();
    let stack = &setup.stack;
    let ep = channel();

    stack.create_nic(NicId::new(3), ep.clone()).unwrap();
    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(3),
    ));

    ep.close();

    assert!(!stack.has_nic(NicId::new(3)));
    assert!(stack.get_route_table().is_empty());
}

#[test]
fn next_nic_id_is_monotonic() {
    let setup = default_setup();
    let a = setup.stack.next_nic_id();
    let b = setup.stack.next_nic_id();
    assert!(b > a);
}

#[test]
fn nic_info_reports_state() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack
        .create_nic_with_options(
            NicId::new(1),
            channel(),
            netstack_stack::NicOptions {
                name: "eth0".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 24);

    let info = stack.get_nic_info(NicId::new(1)).unwrap();
    assert_eq!(info.name, "eth0");
    assert!(info.flags.up);
    assert!(info.flags.running);
    assert!(!info.flags.loopback);
    assert_eq!(info.protocol_addresses.len(), 1);
    assert_eq!(info.forwarding.get(&IPV4), Some(&false));

    assert_eq!(
        stack.get_nic_info(NicId::new(9)).err(),
        Some(StackError::NoSuchFile)
    );

    let all = stack.nic_info();
    assert_eq!(all.len(), 1);

    let loopback_nic = LoopbackEndpoint::new();
    stack.create_nic(NicId::new(2), loopback_nic).unwrap();
    assert!(stack.get_nic_info(NicId::new(2)).unwrap().flags.loopback);
}

// === Forwarding ===

#[test]
fn forwarding_default_applies_to_new_nics() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    assert!(!stack.nic_forwarding(NicId::new(1), IPV4).unwrap());

    stack
        .set_forwarding_default_and_all_nics(IPV4, true)
        .unwrap();
    assert!(stack.nic_forwarding(NicId::new(1), IPV4).unwrap());

    // Newly created NICs inherit the default.
    stack.create_nic(NicId::new(2), channel()).unwrap();
    assert!(stack.nic_forwarding(NicId::new(2), IPV4).unwrap());

    // set_nic_forwarding reports the previous value.
    assert!(stack.set_nic_forwarding(NicId::new(2), IPV4, false).unwrap());
    assert!(!stack.set_nic_forwarding(NicId::new(2), IPV4, true).unwrap());
}

#[test]
fn forwarding_unsupported_protocol() {
    let setup = new_test_stack(FakeNetworkProtocolConfig::default());
    let stack = &setup.stack;
    stack.create_nic(NicId::new(1), channel()).unwrap();

    assert_eq!(
        stack.set_nic_forwarding(NicId::new(1), IPV4, true),
        Err(StackError::NotSupported)
    );
    assert_eq!(
        stack.set_nic_forwarding(NicId::new(1), NetworkProtocolNumber::IPV6, true),
        Err(StackError::UnknownProtocol)
    );
}

// === Demuxer through the stack (property 3) ===

#[test]
fn transport_registration_is_visible_until_unregistered() {
    let setup = default_setup();
    let stack = &setup.stack;

    let ep: Arc<dyn TransportEndpoint> = FakeTransportEndpoint::new();
    let id = TransportEndpointId {
        local_port: 4242,
        local_address: v4(10, 0, 0, 1),
        ..Default::default()
    };

    stack
        .register_transport_endpoint(
            &[IPV4],
            UDP,
            id,
            &ep,
            PortFlags::default(),
            NicId::UNSPECIFIED,
        )
        .unwrap();
    assert!(stack
        .find_transport_endpoint(IPV4, UDP, id, NicId::new(1))
        .is_some());
    assert_eq!(stack.registered_endpoints().len(), 1);

    stack.unregister_transport_endpoint(&[IPV4], UDP, id, &ep, NicId::UNSPECIFIED);
    assert!(stack
        .find_transport_endpoint(IPV4, UDP, id, NicId::new(1))
        .is_none());
}

#[test]
fn cleanup_set_tracks_endpoint_teardown() {
    let setup = default_setup();
    let stack = &setup.stack;

    let ep: Arc<dyn TransportEndpoint> = FakeTransportEndpoint::new();
    let id = TransportEndpointId {
        local_port: 53,
        ..Default::default()
    };
    stack
        .register_transport_endpoint(
            &[IPV4],
            UDP,
            id,
            &ep,
            PortFlags::default(),
            NicId::UNSPECIFIED,
        )
        .unwrap();

    stack.start_transport_endpoint_cleanup(&[IPV4], UDP, id, &ep, NicId::UNSPECIFIED);
    assert!(stack
        .find_transport_endpoint(IPV4, UDP, id, NicId::new(1))
        .is_none());
    assert_eq!(stack.cleanup_endpoints().len(), 1);

    stack.complete_transport_endpoint_cleanup(&ep);
    assert!(stack.cleanup_endpoints().is_empty());

    // Restoring the set rebuilds membership.
    stack.restore_cleanup_endpoints(vec![ep]);
    assert_eq!(stack.cleanup_endpoints().len(), 1);
}

// === Teardown (property 4) ===

#[test]
fn close_and_wait_tear_everything_down() {
    let setup = default_setup();
    let stack = &setup.stack;
    let link = channel();

    stack.create_nic(NicId::new(1), link.clone()).unwrap();

    let ep = FakeTransportEndpoint::new();
    let as_trait: Arc<dyn TransportEndpoint> = ep.clone();
    stack
        .register_transport_endpoint(
            &[IPV4],
            UDP,
            TransportEndpointId {
                local_port: 99,
                ..Default::default()
            },
            &as_trait,
            PortFlags::default(),
            NicId::UNSPECIFIED,
        )
        .unwrap();

    stack.destroy();

    assert!(ep.aborted.load(Ordering::SeqCst));
    assert!(ep.waited.load(Ordering::SeqCst));
    assert!(setup.trans_proto.closed.load(Ordering::SeqCst));
    assert!(setup.trans_proto.waited.load(Ordering::SeqCst));
    assert!(setup.net_proto.closed.load(Ordering::SeqCst));
    assert!(!stack.has_nic(NicId::new(1)));
    assert!(link.is_closed());
}

// === Identity (property 5) ===

#[test]
fn seed_and_ts_offset_secret_are_stable() {
    let setup = default_setup();
    let stack = &setup.stack;
    let seed = stack.seed();
    let secret = stack.ts_offset_secret();

    stack.create_nic(NicId::new(1), channel()).unwrap();
    stack.remove_nic(NicId::new(1)).unwrap();

    assert_eq!(stack.seed(), seed);
    assert_eq!(stack.ts_offset_secret(), secret);
}

// === FindRoute ===

#[test]
fn find_route_uses_gateway_from_table() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 24);
    stack.add_route(RouteEntry::via_gateway(
        subnet(0, 0, 0, 0, 0),
        v4(10, 0, 0, 254),
        NicId::new(1),
    ));

    let route = stack
        .find_route(NicId::UNSPECIFIED, &Address::empty(), &v4(8, 8, 8, 8), IPV4, false)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(1));
    assert_eq!(route.gateway, v4(10, 0, 0, 254));
    assert_eq!(route.local_address, v4(10, 0, 0, 1));
}

#[test]
fn find_route_prefers_more_specific_entry() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    stack.create_nic(NicId::new(2), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);
    add_v4_address(stack, NicId::new(2), v4(10, 1, 0, 1), 16);

    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(1),
    ));
    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 1, 0, 0, 16),
        NicId::new(2),
    ));

    let route = stack
        .find_route(NicId::UNSPECIFIED, &Address::empty(), &v4(10, 1, 2, 3), IPV4, false)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(2));

    let route = stack
        .find_route(NicId::UNSPECIFIED, &Address::empty(), &v4(10, 9, 2, 3), IPV4, false)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(1));
}

#[test]
fn find_route_failures() {
    let setup = default_setup();
    let stack = &setup.stack;

    assert_eq!(
        stack.find_route(
            NicId::UNSPECIFIED,
            &Address::empty(),
            &v4(8, 8, 8, 8),
            NetworkProtocolNumber::IPV6,
            false
        ),
        Err(StackError::UnknownProtocol)
    );

    // No NICs, route needed: host unreachable.
    assert_eq!(
        stack.find_route(NicId::UNSPECIFIED, &Address::empty(), &v4(8, 8, 8, 8), IPV4, false),
        Err(StackError::HostUnreachable)
    );

    // Multicast with an explicit NIC that has no address: network
    // unreachable.
    stack.create_nic(NicId::new(1), channel()).unwrap();
    assert_eq!(
        stack.find_route(NicId::new(1), &Address::empty(), &v4(224, 0, 0, 1), IPV4, false),
        Err(StackError::NetworkUnreachable)
    );

    // Disabled NICs do not carry direct routes.
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);
    stack.disable_nic(NicId::new(1)).unwrap();
    assert_eq!(
        stack.find_route(NicId::new(1), &Address::empty(), &v4(224, 0, 0, 1), IPV4, false),
        Err(StackError::NetworkUnreachable)
    );
}

#[test]
fn find_route_multicast_loop_flag() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);

    let route = stack
        .find_route(NicId::new(1), &Address::empty(), &v4(224, 0, 0, 1), IPV4, true)
        .unwrap();
    assert_eq!(route.looping, PacketLooping::OutAndLoop);
}

#[test]
fn find_route_handle_local() {
    let net_proto = FakeNetworkProtocol::forwarding_capable(IPV4);
    let stack = Stack::new(StackOptions {
        network_protocols: vec![Box::new(move |_| net_proto as Arc<dyn NetworkProtocol>)],
        handle_local: true,
        ..Default::default()
    });

    stack.create_nic(NicId::new(1), channel()).unwrap();
    stack.create_nic(NicId::new(2), channel()).unwrap();
    add_v4_address(&stack, NicId::new(1), v4(10, 0, 0, 1), 24);
    add_v4_address(&stack, NicId::new(2), v4(10, 0, 1, 1), 24);

    // Remote owned by the stack: the route never leaves it.
    let route = stack
        .find_route(NicId::UNSPECIFIED, &v4(10, 0, 0, 1), &v4(10, 0, 1, 1), IPV4, false)
        .unwrap();
    assert_eq!(route.looping, PacketLooping::Loop);
    assert_eq!(route.local_address_nic, NicId::new(1));
    assert_eq!(route.outgoing_nic, NicId::new(2));
    assert!(route.gateway.is_empty());
}

#[test]
fn find_route_cross_nic_with_forwarding() {
    let setup = default_setup();
    let stack = &setup.stack;

    // NIC 1 owns an address; NIC 2 is the route's egress and forwards.
    stack.create_nic(NicId::new(1), channel()).unwrap();
    stack.create_nic(NicId::new(2), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(192, 168, 1, 1), 24);
    stack
        .set_nic_forwarding(NicId::new(2), IPV4, true)
        .unwrap();
    stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(2),
    ));

    // Forwarded traffic (no NIC, no local address) may pair NIC 1's
    // address with NIC 2's egress.
    let route = stack
        .find_route(NicId::UNSPECIFIED, &Address::empty(), &v4(10, 1, 2, 3), IPV4, false)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(2));
    assert_eq!(route.local_address_nic, NicId::new(1));
    assert_eq!(route.local_address, v4(192, 168, 1, 1));

    // Locally generated traffic with an explicit NIC that has no usable
    // address reports host unreachable.
    assert_eq!(
        stack.find_route(NicId::new(2), &v4(172, 16, 0, 1), &v4(10, 1, 2, 3), IPV4, false),
        Err(StackError::HostUnreachable)
    );
}

#[test]
fn new_route_for_multicast_validates_nic() {
    let setup = default_setup();
    let stack = &setup.stack;

    assert!(stack
        .new_route_for_multicast(NicId::new(1), &v4(224, 0, 0, 5), IPV4)
        .is_none());

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);
    let route = stack
        .new_route_for_multicast(NicId::new(1), &v4(224, 0, 0, 5), IPV4)
        .unwrap();
    assert_eq!(route.outgoing_nic, NicId::new(1));
    assert!(route.gateway.is_empty());
}

// === Spoofing and local address checks ===

#[test]
fn spoofing_allows_unowned_local_addresses() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);

    // Without spoofing, an unowned local address cannot form a route.
    assert!(stack
        .find_route(NicId::new(1), &v4(172, 16, 0, 9), &v4(224, 0, 0, 1), IPV4, false)
        .is_err());

    stack.set_spoofing(NicId::new(1), true).unwrap();
    let route = stack
        .find_route(NicId::new(1), &v4(172, 16, 0, 9), &v4(224, 0, 0, 1), IPV4, false)
        .unwrap();
    assert_eq!(route.local_address, v4(172, 16, 0, 9));
}

#[test]
fn check_local_address_semantics() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.create_nic(NicId::new(1), channel()).unwrap();
    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 8);

    // Stack-wide search finds the owning NIC.
    assert_eq!(
        stack.check_local_address(NicId::UNSPECIFIED, IPV4, &v4(10, 0, 0, 1)),
        NicId::new(1)
    );
    assert_eq!(
        stack.check_local_address(NicId::UNSPECIFIED, IPV4, &v4(10, 0, 0, 2)),
        NicId::UNSPECIFIED
    );
    // With an explicit NIC, IPv4 checks the interface only.
    assert_eq!(
        stack.check_local_address(NicId::new(1), IPV4, &v4(10, 0, 0, 2)),
        NicId::new(1)
    );
    assert_eq!(
        stack.check_local_address(NicId::new(9), IPV4, &v4(10, 0, 0, 1)),
        NicId::UNSPECIFIED
    );
}

// === Multicast groups ===

#[test]
fn multicast_group_membership() {
    let setup = default_setup();
    let stack = &setup.stack;
    stack.create_nic(NicId::new(1), channel()).unwrap();

    let group = v4(224, 0, 0, 9);
    assert_eq!(
        stack.join_group(IPV4, NicId::new(1), &v4(10, 0, 0, 1)),
        Err(StackError::BadAddress)
    );

    stack.join_group(IPV4, NicId::new(1), &group).unwrap();
    stack.join_group(IPV4, NicId::new(1), &group).unwrap();
    assert!(stack.is_in_group(NicId::new(1), &group).unwrap());

    stack.leave_group(IPV4, NicId::new(1), &group).unwrap();
    assert!(stack.is_in_group(NicId::new(1), &group).unwrap());
    stack.leave_group(IPV4, NicId::new(1), &group).unwrap();
    assert!(!stack.is_in_group(NicId::new(1), &group).unwrap());

    assert_eq!(
        stack.leave_group(IPV4, NicId::new(1), &group),
        Err(StackError::BadLocalAddress)
    );
}

// === Multicast forwarding protocol family ===

struct NullMulticastDispatcher;

impl MulticastForwardingEventDispatcher for NullMulticastDispatcher {
    fn on_missing_route(&self, _context: MulticastPacketContext) {}
    fn on_unexpected_input_interface(&self, _context: MulticastPacketContext, _expected: NicId) {}
}

#[test]
fn multicast_forwarding_requires_capability() {
    let setup = default_setup();
    assert_eq!(
        setup
            .stack
            .enable_multicast_forwarding_for_protocol(IPV4, Arc::new(NullMulticastDispatcher)),
        Err(StackError::NotSupported)
    );
    assert_eq!(
        setup
            .stack
            .enable_multicast_forwarding_for_protocol(
                NetworkProtocolNumber::IPV6,
                Arc::new(NullMulticastDispatcher)
            ),
        Err(StackError::UnknownProtocol)
    );
}

#[test]
fn multicast_forwarding_routes() {
    let setup = new_test_stack(FakeNetworkProtocolConfig {
        supports_forwarding: true,
        supports_multicast_forwarding: true,
        with_multicast_protocol: true,
        ..Default::default()
    });
    let stack = &setup.stack;

    assert!(!stack
        .enable_multicast_forwarding_for_protocol(IPV4, Arc::new(NullMulticastDispatcher))
        .unwrap());
    // Second enable reports it was already on.
    assert!(stack
        .enable_multicast_forwarding_for_protocol(IPV4, Arc::new(NullMulticastDispatcher))
        .unwrap());

    let key = netstack_stack::UnicastSourceAndMulticastDestination {
        source: v4(10, 0, 0, 1),
        destination: v4(224, 0, 0, 1),
    };
    stack
        .add_multicast_route(
            IPV4,
            key,
            MulticastRoute {
                expected_input_interface: NicId::new(1),
                outgoing_interfaces: vec![],
            },
        )
        .unwrap();
    assert!(stack.multicast_route_last_used_time(IPV4, &key).is_ok());
    stack.remove_multicast_route(IPV4, &key).unwrap();
    assert!(stack.multicast_route_last_used_time(IPV4, &key).is_err());

    stack.disable_multicast_forwarding_for_protocol(IPV4).unwrap();

    // Per-NIC multicast forwarding bit.
    stack.create_nic(NicId::new(1), channel()).unwrap();
    assert!(!stack
        .set_nic_multicast_forwarding(NicId::new(1), IPV4, true)
        .unwrap());
    assert!(stack.nic_multicast_forwarding(NicId::new(1), IPV4).unwrap());
}

// === Link address resolution ===

#[test]
fn get_link_address_paths() {
    let setup = new_test_stack(FakeNetworkProtocolConfig {
        supports_forwarding: true,
        with_resolver: true,
        ..Default::default()
    });
    let stack = &setup.stack;

    let link = ChannelEndpoint::new(ChannelConfig {
        resolution_required: true,
        ..Default::default()
    });
    stack.create_nic(NicId::new(1), link).unwrap();

    let mac = LinkAddress::new([2, 0, 0, 0, 0, 9]);
    setup
        .net_proto
        .resolver
        .add_static_mapping(v4(224, 0, 0, 1), mac);

    // Static mapping resolves immediately.
    let resolved = Arc::new(Mutex::new(None));
    let resolved2 = resolved.clone();
    stack
        .get_link_address(
            NicId::new(1),
            &v4(224, 0, 0, 1),
            &v4(10, 0, 0, 1),
            IPV4,
            Box::new(move |result| {
                *resolved2.lock().unwrap() = Some(result);
            }),
        )
        .unwrap();
    assert_eq!(*resolved.lock().unwrap(), Some(Ok(mac)));

    // Unknown address: queued, probe sent, completion fires the callback.
    let async_result = Arc::new(Mutex::new(None));
    let async_result2 = async_result.clone();
    let err = stack
        .get_link_address(
            NicId::new(1),
            &v4(10, 0, 0, 7),
            &v4(10, 0, 0, 1),
            IPV4,
            Box::new(move |result| {
                *async_result2.lock().unwrap() = Some(result);
            }),
        )
        .unwrap_err();
    assert_eq!(err, StackError::WouldBlock);
    assert_eq!(
        setup.net_proto.resolver.probes.lock().unwrap().as_slice(),
        &[(NicId::new(1), v4(10, 0, 0, 7))]
    );
    assert!(async_result.lock().unwrap().is_none());

    let neighbor_mac = LinkAddress::new([2, 0, 0, 0, 0, 7]);
    stack
        .complete_link_resolution(NicId::new(1), IPV4, &v4(10, 0, 0, 7), Ok(neighbor_mac))
        .unwrap();
    assert_eq!(*async_result.lock().unwrap(), Some(Ok(neighbor_mac)));

    // The resolved neighbor is visible in the table.
    let neighbors = stack.neighbors(NicId::new(1), IPV4).unwrap();
    assert!(neighbors.iter().any(|n| n.link_addr == neighbor_mac));
}

#[test]
fn static_neighbors() {
    let setup = new_test_stack(FakeNetworkProtocolConfig {
        supports_forwarding: true,
        with_resolver: true,
        ..Default::default()
    });
    let stack = &setup.stack;

    let link = ChannelEndpoint::new(ChannelConfig {
        resolution_required: true,
        ..Default::default()
    });
    stack.create_nic(NicId::new(1), link).unwrap();

    let mac = LinkAddress::new([2, 0, 0, 0, 0, 1]);
    stack
        .add_static_neighbor(NicId::new(1), IPV4, v4(10, 0, 0, 9), mac)
        .unwrap();
    assert_eq!(stack.neighbors(NicId::new(1), IPV4).unwrap().len(), 1);

    stack
        .remove_neighbor(NicId::new(1), IPV4, &v4(10, 0, 0, 9))
        .unwrap();
    assert_eq!(
        stack.remove_neighbor(NicId::new(1), IPV4, &v4(10, 0, 0, 9)),
        Err(StackError::BadAddress)
    );

    stack
        .add_static_neighbor(NicId::new(1), IPV4, v4(10, 0, 0, 9), mac)
        .unwrap();
    stack.clear_neighbors(NicId::new(1), IPV4).unwrap();
    assert!(stack.neighbors(NicId::new(1), IPV4).unwrap().is_empty());
}

#[test]
fn neighbor_operations_require_resolution_capable_link() {
    let setup = default_setup();
    let stack = &setup.stack;
    // The default channel config does not require resolution.
    stack.create_nic(NicId::new(1), channel()).unwrap();
    assert_eq!(
        stack.neighbors(NicId::new(1), IPV4),
        Err(StackError::NotSupported)
    );
}

// === Save / restore ===

#[test]
fn pause_resume_restore_sequence() {
    let setup = default_setup();
    let stack = &setup.stack;

    stack.pause();
    assert_eq!(setup.trans_proto.paused.load(Ordering::SeqCst), 1);

    let resumable = FakeResumableEndpoint::new();
    stack.register_resumable_endpoint(resumable.clone());
    stack.resume();
    assert_eq!(resumable.resumed.load(Ordering::SeqCst), 1);
    assert_eq!(setup.trans_proto.resumed.load(Ordering::SeqCst), 1);

    // Without save/restore enabled, restore falls back to resume.
    let restored = FakeRestoredEndpoint::new();
    stack.register_restored_endpoint(restored.clone());
    stack.restore();
    assert_eq!(restored.restored.load(Ordering::SeqCst), 1);
    assert_eq!(setup.trans_proto.resumed.load(Ordering::SeqCst), 2);
    assert_eq!(setup.trans_proto.restored.load(Ordering::SeqCst), 0);

    // With save/restore enabled, protocols get the restore path.
    stack.enable_save_restore();
    assert!(stack.is_save_restore_enabled());
    stack.restore();
    assert_eq!(setup.trans_proto.restored.load(Ordering::SeqCst), 1);
}

#[test]
fn replace_config_substitutes_transient_state() {
    let live = default_setup();
    let loaded = default_setup();

    loaded
        .stack
        .create_nic_with_options(
            NicId::new(5),
            channel(),
            netstack_stack::NicOptions {
                name: "restored0".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    loaded.stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(5),
    ));

    live.stack.replace_config(&loaded.stack);

    assert!(live.stack.has_nic(NicId::new(5)));
    assert_eq!(live.stack.get_route_table().len(), 1);
    assert_eq!(live.stack.find_nic_name_from_id(NicId::new(5)), "restored0");

    // The id generator was advanced past the restored ids.
    assert!(live.stack.next_nic_id() > NicId::new(1));
}

// === SetNICStack ===

#[test]
fn set_nic_stack_moves_nic_to_peer() {
    let a = default_setup();
    let b = default_setup();
    let link = channel();

    a.stack
        .create_nic_with_options(
            NicId::new(1),
            link.clone(),
            netstack_stack::NicOptions {
                name: "veth0".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    a.stack.add_route(RouteEntry::directly_connected(
        subnet(10, 0, 0, 0, 8),
        NicId::new(1),
    ));

    let new_id = a.stack.set_nic_stack(NicId::new(1), &b.stack).unwrap();

    assert!(!a.stack.has_nic(NicId::new(1)));
    assert!(a.stack.get_route_table().is_empty());
    assert!(b.stack.has_nic(new_id));
    assert_eq!(b.stack.find_nic_name_from_id(new_id), "veth0");
    // The link endpoint is not closed by the move.
    assert!(!link.is_closed());
    assert!(link.is_attached());

    // Moving within the same stack is a no-op returning the same id.
    assert_eq!(
        b.stack.set_nic_stack(new_id, &b.stack).unwrap(),
        new_id
    );
}

// === Coordinator NICs ===

struct BondEndpoint {
    inner: Arc<ChannelEndpoint>,
    ports: Mutex<Vec<NicId>>,
}

impl BondEndpoint {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: channel(),
            ports: Mutex::new(Vec::new()),
        })
    }
}

impl CoordinatorLink for BondEndpoint {
    fn add_port(&self, id: NicId) -> Result<(), StackError> {
        self.ports.lock().unwrap().push(id);
        Ok(())
    }

    fn del_port(&self, id: NicId) -> Result<(), StackError> {
        self.ports.lock().unwrap().retain(|&p| p != id);
        Ok(())
    }
}

impl LinkEndpoint for BondEndpoint {
    fn mtu(&self) -> u32 {
        self.inner.mtu()
    }

    fn set_mtu(&self, mtu: u32) {
        self.inner.set_mtu(mtu);
    }

    fn max_header_length(&self) -> u16 {
        self.inner.max_header_length()
    }

    fn link_address(&self) -> LinkAddress {
        self.inner.link_address()
    }

    fn set_link_address(&self, addr: LinkAddress) {
        self.inner.set_link_address(addr);
    }

    fn capabilities(&self) -> LinkCapabilities {
        self.inner.capabilities()
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        self.inner.attach(dispatcher);
    }

    fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    fn write_packet(&self, pkt: netstack_core::PacketBuffer) -> Result<(), StackError> {
        self.inner.write_packet(pkt)
    }

    fn set_on_close_action(&self, action: Option<OnCloseAction>) {
        self.inner.set_on_close_action(action);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn coordinator(&self) -> Option<&dyn CoordinatorLink> {
        Some(self)
    }
}

#[test]
fn coordinator_wiring() {
    let setup = default_setup();
    let stack = &setup.stack;

    let bond = BondEndpoint::new();
    stack.create_nic(NicId::new(1), bond.clone()).unwrap();
    stack.create_nic(NicId::new(2), channel()).unwrap();
    stack.create_nic(NicId::new(3), channel()).unwrap();

    stack.set_nic_coordinator(NicId::new(2), NicId::new(1)).unwrap();
    assert_eq!(bond.ports.lock().unwrap().as_slice(), &[NicId::new(2)]);

    // A coordinator cannot be subordinated.
    assert_eq!(
        stack.set_nic_coordinator(NicId::new(1), NicId::new(1)),
        Err(StackError::NoSuchFile)
    );
    // The target must be coordinator-capable.
    assert_eq!(
        stack.set_nic_coordinator(NicId::new(3), NicId::new(2)),
        Err(StackError::NotSupported)
    );
    // Unknown ids fail.
    assert_eq!(
        stack.set_nic_coordinator(NicId::new(9), NicId::new(1)),
        Err(StackError::UnknownNicId)
    );

    // Removing a subordinate detaches it from the coordinator.
    stack.remove_nic(NicId::new(2)).unwrap();
    assert!(bond.ports.lock().unwrap().is_empty());
}

// === Packet endpoints and delivery ===

#[test]
fn packet_endpoints_tap_inbound_traffic() {
    use netstack_stack::testutil::FakePacketEndpoint;

    let setup = default_setup();
    let stack = &setup.stack;
    let link = channel();
    stack.create_nic(NicId::new(1), link.clone()).unwrap();

    let tap = FakePacketEndpoint::new();
    let as_trait: Arc<dyn netstack_stack::PacketEndpoint> = tap.clone();
    stack
        .register_packet_endpoint(NicId::UNSPECIFIED, IPV4, as_trait.clone())
        .unwrap();

    let mut pkt = netstack_core::PacketBuffer::with_payload(vec![1, 2, 3]);
    pkt.network_protocol = Some(IPV4);
    assert!(link.inject(IPV4, pkt.clone()));
    assert_eq!(tap.packets.load(Ordering::SeqCst), 1);

    // The network endpoint saw the packet too.
    let net_ep = setup.net_proto.endpoint(NicId::new(1)).unwrap();
    assert_eq!(net_ep.received.load(Ordering::SeqCst), 1);

    stack.unregister_packet_endpoint(NicId::UNSPECIFIED, IPV4, &as_trait);
    assert!(link.inject(IPV4, pkt));
    assert_eq!(tap.packets.load(Ordering::SeqCst), 1);
    assert_eq!(net_ep.received.load(Ordering::SeqCst), 2);

    assert_eq!(stack.stats().packets_received.value(), 2);
    assert_eq!(stack.stats().packets_delivered.value(), 2);
}

#[test]
fn disabled_nic_drops_inbound_packets() {
    let setup = default_setup();
    let stack = &setup.stack;
    let link = channel();
    stack.create_nic(NicId::new(1), link.clone()).unwrap();
    stack.disable_nic(NicId::new(1)).unwrap();

    let mut pkt = netstack_core::PacketBuffer::with_payload(vec![1]);
    pkt.network_protocol = Some(IPV4);
    assert!(link.inject(IPV4, pkt));

    let net_ep = setup.net_proto.endpoint(NicId::new(1)).unwrap();
    assert_eq!(net_ep.received.load(Ordering::SeqCst), 0);
    assert_eq!(stack.stats().packets_received.value(), 0);
}

#[tokio::test]
async fn write_paths_reach_the_link() {
    let setup = default_setup();
    let stack = &setup.stack;
    let link = channel();
    stack.create_nic(NicId::new(1), link.clone()).unwrap();

    stack
        .write_packet_to_remote(
            NicId::new(1),
            LinkAddress::new([2, 0, 0, 0, 0, 2]),
            IPV4,
            b"ping",
        )
        .unwrap();
    let pkt = link.recv().await.unwrap();
    assert_eq!(pkt.payload(), b"ping");
    assert_eq!(pkt.network_protocol, Some(IPV4));

    stack.write_raw_packet(NicId::new(1), IPV4, b"raw").unwrap();
    let pkt = link.recv().await.unwrap();
    assert_eq!(pkt.payload(), b"raw");

    assert_eq!(
        stack.write_packet_to_remote(NicId::new(9), LinkAddress::default(), IPV4, b"x"),
        Err(StackError::UnknownDevice)
    );
    assert_eq!(
        stack.write_raw_packet(NicId::new(9), IPV4, b"x"),
        Err(StackError::UnknownNicId)
    );
}

// === Options ===

#[test]
fn buffer_size_options_validate() {
    let setup = default_setup();
    let stack = &setup.stack;

    let range = BufferSizeRange {
        min: 1 << 10,
        default: 1 << 12,
        max: 1 << 20,
    };
    stack.set_send_buffer_size(range).unwrap();
    assert_eq!(stack.send_buffer_size(), range);

    assert_eq!(
        stack.set_receive_buffer_size(BufferSizeRange {
            min: 1024,
            default: 512,
            max: 2048,
        }),
        Err(StackError::InvalidOptionValue)
    );
}

#[test]
fn tcp_send_buffer_limits_error_paths() {
    // TCP absent entirely.
    let setup = default_setup();
    assert_eq!(
        setup.stack.tcp_send_buffer_limits(),
        Err(StackError::UnknownProtocol)
    );

    // TCP present but without the reporting capability.
    let net_proto = FakeNetworkProtocol::forwarding_capable(IPV4);
    let tcp = FakeTransportProtocol::new(TCP);
    let stack = Stack::new(StackOptions {
        network_protocols: vec![Box::new(move |_| net_proto as Arc<dyn NetworkProtocol>)],
        transport_protocols: vec![Box::new(move |_| tcp as Arc<dyn TransportProtocol>)],
        ..Default::default()
    });
    assert_eq!(
        stack.tcp_send_buffer_limits(),
        Err(StackError::NotSupported)
    );
}

#[test]
fn protocol_option_forwarding_checks_registration() {
    let setup = default_setup();
    let stack = &setup.stack;

    assert_eq!(
        stack.set_network_protocol_option(NetworkProtocolNumber::IPV6, &0u32),
        Err(StackError::UnknownProtocol)
    );
    // The fake protocol does not implement options.
    assert_eq!(
        stack.set_network_protocol_option(IPV4, &0u32),
        Err(StackError::NotSupported)
    );
    assert_eq!(
        stack.set_transport_protocol_option(TCP, &0u32),
        Err(StackError::UnknownProtocol)
    );
}

#[test]
fn parse_packet_buffer_transport_reports_unknown_protocol() {
    let setup = default_setup();
    let mut pkt = netstack_core::PacketBuffer::with_payload(vec![0; 8]);
    assert_eq!(
        setup.stack.parse_packet_buffer_transport(TCP, &mut pkt),
        netstack_stack::ParseResult::UnknownTransportProtocol
    );
    // The fake UDP protocol's parse always fails.
    assert_eq!(
        setup.stack.parse_packet_buffer_transport(UDP, &mut pkt),
        netstack_stack::ParseResult::TransportLayerParseError
    );
}

// === Address bookkeeping through the stack ===

#[test]
fn address_management() {
    let setup = default_setup();
    let stack = &setup.stack;
    stack.create_nic(NicId::new(1), channel()).unwrap();

    add_v4_address(stack, NicId::new(1), v4(10, 0, 0, 1), 24);
    assert_eq!(
        stack.get_main_nic_address(NicId::new(1), IPV4).unwrap(),
        v4(10, 0, 0, 1).with_prefix(24)
    );

    let all = stack.all_addresses();
    assert_eq!(all[&NicId::new(1)].len(), 1);

    assert!(stack.is_subnet_broadcast(NicId::new(1), IPV4, &v4(10, 0, 0, 255)));
    assert!(!stack.is_subnet_broadcast(NicId::new(1), IPV4, &v4(10, 0, 0, 7)));

    stack
        .set_address_lifetimes(
            NicId::new(1),
            &v4(10, 0, 0, 1),
            netstack_stack::AddressLifetimes {
                deprecated: true,
                ..Default::default()
            },
        )
        .unwrap();

    stack.remove_address(NicId::new(1), &v4(10, 0, 0, 1)).unwrap();
    assert_eq!(
        stack.remove_address(NicId::new(1), &v4(10, 0, 0, 1)),
        Err(StackError::BadLocalAddress)
    );
    assert_eq!(
        stack.add_protocol_address(
            NicId::new(9),
            ProtocolAddress {
                protocol: IPV4,
                address_with_prefix: v4(10, 0, 0, 1).with_prefix(24),
            },
            AddressProperties::default(),
        ),
        Err(StackError::UnknownNicId)
    );
}

// === NUD configuration plumbing ===

#[test]
fn nud_configuration_round_trip() {
    let setup = default_setup();
    let stack = &setup.stack;
    stack.create_nic(NicId::new(1), channel()).unwrap();

    let mut configs = stack.nud_configurations(NicId::new(1), IPV4).unwrap();
    configs.max_unicast_probes = 7;
    stack
        .set_nud_configurations(NicId::new(1), IPV4, configs)
        .unwrap();
    assert_eq!(
        stack
            .nud_configurations(NicId::new(1), IPV4)
            .unwrap()
            .max_unicast_probes,
        7
    );

    // Invalid (zero) fields are replaced with defaults.
    configs.max_unicast_probes = 0;
    stack
        .set_nud_configurations(NicId::new(1), IPV4, configs)
        .unwrap();
    assert_eq!(
        stack
            .nud_configurations(NicId::new(1), IPV4)
            .unwrap()
            .max_unicast_probes,
        netstack_stack::NudConfigurations::default().max_unicast_probes
    );
}

// === Default transport handler registration ===

#[test]
fn transport_protocol_handler_is_settable() {
    let setup = default_setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    setup.stack.set_transport_protocol_handler(
        UDP,
        Some(Arc::new(move |_id, _pkt| {
            calls2.fetch_add(1, Ordering::SeqCst);
            true
        })),
    );
    // Setting a handler for an unregistered protocol is a no-op.
    setup.stack.set_transport_protocol_handler(TCP, None);
}
