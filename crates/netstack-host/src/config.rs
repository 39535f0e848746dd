//! TOML-based configuration for the host stack.

use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use netstack_core::{Address, Subnet};

use crate::error::HostError;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub stack: StackSection,
    #[serde(default)]
    pub interfaces: InterfacesSection,
    #[serde(default)]
    pub routes: Vec<RouteEntrySection>,
}

impl HostConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HostError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, HostError> {
        toml::from_str(s).map_err(|e| HostError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[stack]` section.
#[derive(Debug, Deserialize)]
pub struct StackSection {
    /// Handle packets destined to the stack's own addresses internally.
    #[serde(default)]
    pub handle_local: bool,
    /// Network protocols whose forwarding is on by default.
    #[serde(default)]
    pub forwarding: bool,
}

impl Default for StackSection {
    fn default() -> Self {
        Self {
            handle_local: false,
            forwarding: false,
        }
    }
}

/// The `[interfaces]` section.
#[derive(Debug, Default, Deserialize)]
pub struct InterfacesSection {
    #[serde(default)]
    pub loopback: Vec<LoopbackEntry>,
    #[serde(default)]
    pub channel: Vec<ChannelEntry>,
}

/// A `[[interfaces.loopback]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackEntry {
    pub name: String,
    /// Addresses in `a.b.c.d/len` form.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// A `[[interfaces.channel]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub addresses: Vec<String>,
}

fn default_mtu() -> u32 {
    1500
}

/// A `[[routes]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntrySection {
    /// Destination block in `a.b.c.d/len` form.
    pub destination: String,
    /// Gateway address, omitted for directly connected destinations.
    pub gateway: Option<String>,
    /// Name of the outgoing interface.
    pub interface: String,
}

/// Parse an `addr/prefix` string into an address and prefix length.
pub fn parse_address_with_prefix(s: &str) -> Result<(Address, u8), HostError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| HostError::Config(format!("missing prefix length in {s:?}")))?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|e| HostError::Config(format!("bad address {addr:?}: {e}")))?;
    let address = Address::from(ip);
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| HostError::Config(format!("bad prefix length in {s:?}: {e}")))?;
    if usize::from(prefix) > address.bit_len() {
        return Err(HostError::Config(format!("prefix too long in {s:?}")));
    }
    Ok((address, prefix))
}

/// Parse a destination block into a subnet.
pub fn parse_subnet(s: &str) -> Result<Subnet, HostError> {
    let (address, prefix) = parse_address_with_prefix(s)?;
    Ok(Subnet::new(address, prefix))
}

/// Parse a plain address.
pub fn parse_address(s: &str) -> Result<Address, HostError> {
    let ip: IpAddr = s
        .parse()
        .map_err(|e| HostError::Config(format!("bad address {s:?}: {e}")))?;
    Ok(Address::from(ip))
}
