//! Route construction: the `find_route` decision tree.
//!
//! A constructed [`Route`] pairs an outgoing NIC with a local address
//! endpoint (possibly on another NIC when forwarding) and records whether
//! packets should be looped back internally.

use netstack_core::{Address, NetworkProtocolNumber, NicId, StackError};

use crate::nic::addresses::AssignedAddress;
use crate::nic::Nic;
use crate::route::RouteEntry;
use crate::stack::{Stack, StackState};

/// Where packets using a route go: out the link, looped back internally, or
/// both (multicast loop).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketLooping {
    Out,
    Loop,
    OutAndLoop,
}

/// A route produced by [`Stack::find_route`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Route {
    pub net_proto: NetworkProtocolNumber,
    pub local_address: Address,
    pub remote_address: Address,
    /// Empty for directly connected destinations.
    pub gateway: Address,
    pub outgoing_nic: NicId,
    /// NIC owning the local address; differs from `outgoing_nic` only for
    /// forwarding-enabled cross-NIC routes.
    pub local_address_nic: NicId,
    pub looping: PacketLooping,
    /// Route MTU; zero means "use the link MTU".
    pub mtu: u32,
}

struct RouteArgs<'a> {
    net_proto: NetworkProtocolNumber,
    gateway: Address,
    assigned: &'a AssignedAddress,
    remote_addr: &'a Address,
    outgoing_nic: NicId,
    local_address_nic: NicId,
    multicast_loop: bool,
    mtu: u32,
}

impl Stack {
    fn make_route(&self, args: RouteArgs<'_>) -> Route {
        let local = args.assigned.address_with_prefix.address;
        let remote = if args.remote_addr.is_empty() {
            local
        } else {
            *args.remote_addr
        };
        let looping = if self.handle_local() && !local.is_empty() && remote == local {
            PacketLooping::Loop
        } else if args.multicast_loop && remote.is_multicast() {
            PacketLooping::OutAndLoop
        } else {
            PacketLooping::Out
        };
        Route {
            net_proto: args.net_proto,
            local_address: local,
            remote_address: remote,
            gateway: args.gateway,
            outgoing_nic: args.outgoing_nic,
            local_address_nic: args.local_address_nic,
            looping,
            mtu: args.mtu,
        }
    }

    /// Validate the assigned address against an explicit local address and
    /// build the route. Returns None on a local-address mismatch.
    #[allow(clippy::too_many_arguments)]
    fn construct_and_validate_route(
        &self,
        net_proto: NetworkProtocolNumber,
        assigned: &AssignedAddress,
        local_address_nic: NicId,
        outgoing_nic: NicId,
        gateway: &Address,
        local_addr: &Address,
        remote_addr: &Address,
        multicast_loop: bool,
        mtu: u32,
    ) -> Option<Route> {
        if !local_addr.is_empty() && assigned.address_with_prefix.address != *local_addr {
            return None;
        }
        Some(self.make_route(RouteArgs {
            net_proto,
            gateway: *gateway,
            assigned,
            remote_addr,
            outgoing_nic,
            local_address_nic,
            multicast_loop,
            mtu,
        }))
    }

    /// Address-endpoint selection: explicit local addresses may be spoofed,
    /// otherwise the NIC's primary selection runs.
    fn get_address_endpoint(
        nic: &Nic,
        local_addr: &Address,
        remote_addr: &Address,
        src_hint: &Address,
        net_proto: NetworkProtocolNumber,
    ) -> Option<AssignedAddress> {
        if local_addr.is_empty() {
            nic.primary_assigned(net_proto, remote_addr, src_hint)
        } else {
            nic.find_assigned(net_proto, local_addr, true)
        }
    }

    /// A local route from one candidate NIC: both the local and the remote
    /// address belong to this stack, so packets never leave it.
    fn find_local_route_from_nic(
        &self,
        state: &StackState,
        local_nic: &std::sync::Arc<Nic>,
        local_addr: &Address,
        remote_addr: &Address,
        net_proto: NetworkProtocolNumber,
    ) -> Option<Route> {
        let assigned = local_nic.find_assigned(net_proto, local_addr, false)?;

        // Prefer delivering on the NIC that owns the local address.
        let outgoing = if local_nic.has_address(net_proto, remote_addr) {
            Some(local_nic.clone())
        } else {
            state
                .nics
                .values()
                .find(|nic| nic.has_address(net_proto, remote_addr))
                .cloned()
        }?;

        // Subnet broadcasts must go out the link.
        if assigned
            .address_with_prefix
            .subnet()
            .is_broadcast(remote_addr)
        {
            return None;
        }

        Some(Route {
            net_proto,
            local_address: assigned.address_with_prefix.address,
            remote_address: *remote_addr,
            gateway: Address::empty(),
            outgoing_nic: outgoing.id(),
            local_address_nic: local_nic.id(),
            looping: PacketLooping::Loop,
            mtu: 0,
        })
    }

    fn find_local_route(
        &self,
        state: &StackState,
        local_nic_id: NicId,
        local_addr: &Address,
        remote_addr: &Address,
        net_proto: NetworkProtocolNumber,
    ) -> Option<Route> {
        let local_addr = if local_addr.is_empty() {
            remote_addr
        } else {
            local_addr
        };

        if local_nic_id.is_unspecified() {
            return state.nics.values().find_map(|nic| {
                self.find_local_route_from_nic(state, nic, local_addr, remote_addr, net_proto)
            });
        }
        let nic = state.nics.get(&local_nic_id)?;
        self.find_local_route_from_nic(state, nic, local_addr, remote_addr, net_proto)
    }

    /// Find a route out `outgoing_nic` whose local address may live on any
    /// interface (the forwarding case).
    #[allow(clippy::too_many_arguments)]
    fn find_route_with_local_addr_from_any_interface(
        &self,
        state: &StackState,
        outgoing_nic: &Nic,
        local_addr: &Address,
        remote_addr: &Address,
        src_hint: &Address,
        gateway: &Address,
        net_proto: NetworkProtocolNumber,
        multicast_loop: bool,
        mtu: u32,
    ) -> Option<Route> {
        for nic in state.nics.values() {
            let Some(assigned) =
                Self::get_address_endpoint(nic, local_addr, remote_addr, src_hint, net_proto)
            else {
                continue;
            };
            if let Some(route) = self.construct_and_validate_route(
                net_proto,
                &assigned,
                nic.id(),
                outgoing_nic.id(),
                gateway,
                local_addr,
                remote_addr,
                multicast_loop,
                mtu,
            ) {
                return Some(route);
            }
        }
        None
    }

    /// A route usable for forwarding multicast packets out `nic_id`, or
    /// None if validation fails.
    pub fn new_route_for_multicast(
        &self,
        nic_id: NicId,
        remote_addr: &Address,
        net_proto: NetworkProtocolNumber,
    ) -> Option<Route> {
        let state = self.core.mu.read().unwrap();
        let nic = state.nics.get(&nic_id)?;
        if !nic.is_enabled() {
            return None;
        }
        let assigned = Self::get_address_endpoint(
            nic,
            &Address::empty(),
            remote_addr,
            &Address::empty(),
            net_proto,
        )?;
        self.construct_and_validate_route(
            net_proto,
            &assigned,
            nic.id(),
            nic.id(),
            &Address::empty(),
            &Address::empty(),
            remote_addr,
            false,
            0,
        )
    }

    /// Create a route to `remote_addr` leaving through the given NIC and
    /// local address, when provided.
    ///
    /// With no NIC specified the route leaves through the NIC holding the
    /// local address, unless forwarding lets locally generated traffic pick
    /// a cross-NIC pairing. With no local address the stack selects one;
    /// with no remote address the local address is used as the remote.
    pub fn find_route(
        &self,
        id: NicId,
        local_addr: &Address,
        remote_addr: &Address,
        net_proto: NetworkProtocolNumber,
        multicast_loop: bool,
    ) -> Result<Route, StackError> {
        let state = self.core.mu.read().unwrap();

        if !self.check_network_protocol(net_proto) {
            return Err(StackError::UnknownProtocol);
        }

        let is_link_local =
            remote_addr.is_v6_link_local_unicast() || remote_addr.is_v6_link_local_multicast();
        let is_local_broadcast = remote_addr.is_v4_broadcast();
        let is_multicast = remote_addr.is_multicast();
        let is_loopback = remote_addr.is_loopback();
        let need_route = !(is_local_broadcast || is_multicast || is_link_local || is_loopback);

        if self.handle_local() && !is_multicast && !is_local_broadcast {
            if let Some(route) =
                self.find_local_route(&state, id, local_addr, remote_addr, net_proto)
            {
                return Ok(route);
            }
        }

        // An explicit NIC and no route needed: go straight out that
        // interface if it is present and enabled.
        if !id.is_unspecified() && !need_route {
            if let Some(nic) = state.nics.get(&id) {
                if nic.is_enabled() {
                    if let Some(assigned) = Self::get_address_endpoint(
                        nic,
                        local_addr,
                        remote_addr,
                        &Address::empty(),
                        net_proto,
                    ) {
                        return Ok(self.make_route(RouteArgs {
                            net_proto,
                            gateway: Address::empty(),
                            assigned: &assigned,
                            remote_addr,
                            outgoing_nic: nic.id(),
                            local_address_nic: nic.id(),
                            multicast_loop,
                            mtu: 0,
                        }));
                    }
                }
            }
            if is_loopback {
                return Err(StackError::BadLocalAddress);
            }
            return Err(StackError::NetworkUnreachable);
        }

        let only_global_addresses = !local_addr.is_v6_link_local_unicast() && !is_link_local;

        // Walk the route table. When forwarding is enabled on a matched NIC
        // and the traffic is locally generated, remember the first usable
        // entry and keep looking for one whose local address lives on the
        // outgoing interface.
        let mut chosen_route: Option<RouteEntry> = None;
        let table_route = {
            let table = self.core.route_table.read().unwrap();
            let mut found = None;
            for entry in table.iter() {
                if remote_addr.is_empty() {
                    if entry.destination.prefix() != 0 {
                        continue;
                    }
                } else if !entry.matches(remote_addr) {
                    continue;
                }

                let Some(nic) = state.nics.get(&entry.nic) else {
                    continue;
                };
                if !nic.is_enabled() {
                    continue;
                }

                if id.is_unspecified() || id == entry.nic {
                    if let Some(assigned) = Self::get_address_endpoint(
                        nic,
                        local_addr,
                        remote_addr,
                        &entry.source_hint,
                        net_proto,
                    ) {
                        let gateway = if need_route {
                            entry.gateway
                        } else {
                            Address::empty()
                        };
                        let Some(route) = self.construct_and_validate_route(
                            net_proto,
                            &assigned,
                            nic.id(),
                            nic.id(),
                            &gateway,
                            local_addr,
                            remote_addr,
                            multicast_loop,
                            entry.mtu,
                        ) else {
                            panic!(
                                "non-forwarding route validation failed: entry = {entry:?}, \
                                 id = {id}, localAddr = {local_addr}, remoteAddr = {remote_addr}"
                            );
                        };
                        found = Some(route);
                        break;
                    }
                }

                let locally_generated = !id.is_unspecified() || !local_addr.is_empty();
                if only_global_addresses
                    && chosen_route.is_none()
                    && is_nic_forwarding(nic, net_proto)
                {
                    if locally_generated {
                        chosen_route = Some(*entry);
                        continue;
                    }
                    if let Some(route) = self.find_route_with_local_addr_from_any_interface(
                        &state,
                        nic,
                        local_addr,
                        remote_addr,
                        &entry.source_hint,
                        &entry.gateway,
                        net_proto,
                        multicast_loop,
                        entry.mtu,
                    ) {
                        found = Some(route);
                        break;
                    }
                }
            }
            found
        };
        if let Some(route) = table_route {
            return Ok(route);
        }

        if let Some(chosen) = chosen_route {
            // chosen_route is only set when forwarding is enabled on its NIC.
            let Some(nic) = state.nics.get(&chosen.nic) else {
                panic!("chosen route must have a valid NIC with id = {}", chosen.nic);
            };
            let gateway = if need_route {
                chosen.gateway
            } else {
                Address::empty()
            };

            if !id.is_unspecified() {
                if let Some(local_nic) = state.nics.get(&id) {
                    if let Some(assigned) = Self::get_address_endpoint(
                        local_nic,
                        local_addr,
                        remote_addr,
                        &chosen.source_hint,
                        net_proto,
                    ) {
                        if let Some(route) = self.construct_and_validate_route(
                            net_proto,
                            &assigned,
                            local_nic.id(),
                            nic.id(),
                            &gateway,
                            local_addr,
                            remote_addr,
                            multicast_loop,
                            chosen.mtu,
                        ) {
                            return Ok(route);
                        }
                    }
                }
                return Err(StackError::HostUnreachable);
            }

            if let Some(route) = self.find_route_with_local_addr_from_any_interface(
                &state,
                nic,
                local_addr,
                remote_addr,
                &chosen.source_hint,
                &gateway,
                net_proto,
                multicast_loop,
                chosen.mtu,
            ) {
                return Ok(route);
            }
        }

        if need_route {
            return Err(StackError::HostUnreachable);
        }
        if remote_addr.is_v6_loopback() {
            return Err(StackError::BadLocalAddress);
        }
        Err(StackError::NetworkUnreachable)
    }
}

fn is_nic_forwarding(nic: &Nic, proto: NetworkProtocolNumber) -> bool {
    match nic.forwarding(proto) {
        Ok(enabled) => enabled,
        Err(StackError::UnknownProtocol) => {
            panic!("expected network protocol {} on NIC {}", proto.0, nic.id())
        }
        // Not every network protocol supports forwarding.
        Err(StackError::NotSupported) => false,
        Err(err) => panic!("nic(id={}).forwarding({}): {err}", nic.id().0, proto.0),
    }
}
