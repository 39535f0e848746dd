//! Builds a live stack from a [`HostConfig`].

use std::collections::HashMap;
use std::sync::Arc;

use netstack_core::{NetworkProtocolNumber, NicId, ProtocolAddress};
use netstack_link::{ChannelConfig, ChannelEndpoint, LoopbackEndpoint};
use netstack_stack::{
    AddressProperties, NetworkProtocol, NicOptions, RouteEntry, Stack, StackOptions,
};

use crate::config::{parse_address, parse_address_with_prefix, parse_subnet, HostConfig};
use crate::error::HostError;
use crate::ip::MinimalIpv4;

/// A built stack plus handles to its channel interfaces.
pub struct BuiltStack {
    pub stack: Stack,
    /// Channel endpoints by interface name, for injecting and draining
    /// frames.
    pub channels: HashMap<String, Arc<ChannelEndpoint>>,
}

impl std::fmt::Debug for BuiltStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltStack")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Construct a stack, its interfaces, and its route table from `config`.
pub fn build(config: &HostConfig) -> Result<BuiltStack, HostError> {
    let stack = Stack::new(StackOptions {
        network_protocols: vec![Box::new(|_| {
            Arc::new(MinimalIpv4::new()) as Arc<dyn NetworkProtocol>
        })],
        handle_local: config.stack.handle_local,
        ..Default::default()
    });

    if config.stack.forwarding {
        stack.set_forwarding_default_and_all_nics(NetworkProtocolNumber::IPV4, true)?;
    }

    let mut ids_by_name: HashMap<String, NicId> = HashMap::new();
    let mut channels = HashMap::new();

    for entry in &config.interfaces.loopback {
        let id = stack.next_nic_id();
        stack.create_nic_with_options(
            id,
            LoopbackEndpoint::new(),
            NicOptions {
                name: entry.name.clone(),
                ..Default::default()
            },
        )?;
        add_addresses(&stack, id, &entry.addresses)?;
        ids_by_name.insert(entry.name.clone(), id);
        tracing::info!(nic = id.0, name = %entry.name, "loopback interface up");
    }

    for entry in &config.interfaces.channel {
        let id = stack.next_nic_id();
        let endpoint = ChannelEndpoint::new(ChannelConfig {
            mtu: entry.mtu,
            ..Default::default()
        });
        stack.create_nic_with_options(
            id,
            endpoint.clone(),
            NicOptions {
                name: entry.name.clone(),
                ..Default::default()
            },
        )?;
        add_addresses(&stack, id, &entry.addresses)?;
        ids_by_name.insert(entry.name.clone(), id);
        channels.insert(entry.name.clone(), endpoint);
        tracing::info!(nic = id.0, name = %entry.name, mtu = entry.mtu, "channel interface up");
    }

    for entry in &config.routes {
        let destination = parse_subnet(&entry.destination)?;
        let nic = *ids_by_name.get(&entry.interface).ok_or_else(|| {
            HostError::Config(format!("route references unknown interface {:?}", entry.interface))
        })?;
        let route = match &entry.gateway {
            Some(gateway) => RouteEntry::via_gateway(destination, parse_address(gateway)?, nic),
            None => RouteEntry::directly_connected(destination, nic),
        };
        stack.add_route(route);
    }

    Ok(BuiltStack { stack, channels })
}

fn add_addresses(stack: &Stack, id: NicId, addresses: &[String]) -> Result<(), HostError> {
    for spec in addresses {
        let (address, prefix_len) = parse_address_with_prefix(spec)?;
        stack.add_protocol_address(
            id,
            ProtocolAddress {
                protocol: NetworkProtocolNumber::IPV4,
                address_with_prefix: address.with_prefix(prefix_len),
            },
            AddressProperties::default(),
        )?;
    }
    Ok(())
}
