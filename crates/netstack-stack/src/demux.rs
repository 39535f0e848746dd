//! The transport demuxer: maps 4-tuple ids to registered transport
//! endpoints.
//!
//! Registrations are scoped by network protocols, a transport protocol, the
//! endpoint id, port flags, and an optional NIC binding. Lookups resolve the
//! most specific match: exact 4-tuple first, then listeners (wildcard
//! remote), then wildcard-local, with NIC-scoped registrations beating
//! equally specific global ones.
//!
//! Buckets are per `(netProto, transProto)` pair and internally serialized;
//! a lookup may run concurrently with registrations and sees either the old
//! or the new state of the touched bucket.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use netstack_core::{Address, NetworkProtocolNumber, NicId, StackError, TransportProtocolNumber};

use crate::proto::{EndpointRef, RawTransportEndpoint, TransportEndpoint};

/// The demuxer key: local and remote halves of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[must_use]
pub struct TransportEndpointId {
    pub local_port: u16,
    pub local_address: Address,
    pub remote_port: u16,
    pub remote_address: Address,
}

impl TransportEndpointId {
    /// This id with the remote half wildcarded (a listener key).
    fn with_wildcard_remote(mut self) -> Self {
        self.remote_address = Address::empty();
        self.remote_port = 0;
        self
    }

    /// This id with only the local port retained.
    fn with_wildcard_local(mut self) -> Self {
        self = self.with_wildcard_remote();
        self.local_address = Address::empty();
        self
    }
}

/// Socket-style sharing flags attached to a registration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// SO_REUSEADDR: the most recent registration wins delivery.
    pub most_recent: bool,
    /// SO_REUSEPORT: registrations share the id and load-balance delivery.
    pub load_balanced: bool,
    /// Binding only conflicts with the exact same tuple.
    pub tuple_only: bool,
}

impl PortFlags {
    /// The effective behavior of this flag combination: load balancing
    /// subsumes most-recent semantics.
    #[must_use]
    pub fn effective(self) -> PortFlags {
        let mut e = self;
        if e.load_balanced && e.most_recent {
            e.most_recent = false;
        }
        e
    }
}

/// A group of endpoints registered under the same id and NIC binding.
///
/// More than one member means the group is load balanced: delivery hashes
/// the 4-tuple with the stack seed to pick a member.
struct MultiPortEndpoint {
    members: Vec<(EndpointRef, PortFlags)>,
}

impl MultiPortEndpoint {
    fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Flags common to every member's effective flags.
    fn shared_flags(&self) -> PortFlags {
        let mut shared = PortFlags {
            most_recent: true,
            load_balanced: true,
            tuple_only: true,
        };
        for (_, flags) in &self.members {
            let e = flags.effective();
            shared.most_recent &= e.most_recent;
            shared.load_balanced &= e.load_balanced;
            shared.tuple_only &= e.tuple_only;
        }
        shared
    }

    /// Whether a new registration with `flags` may join this group.
    fn can_accept(&self, flags: PortFlags) -> bool {
        if self.members.is_empty() {
            return true;
        }
        flags.effective().load_balanced && self.shared_flags().load_balanced
    }

    fn select(&self, id: &TransportEndpointId, seed: u32) -> Option<Arc<dyn TransportEndpoint>> {
        match self.members.len() {
            0 => None,
            1 => Some(self.members[0].0 .0.clone()),
            n => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                seed.hash(&mut hasher);
                id.hash(&mut hasher);
                let index = (hasher.finish() % n as u64) as usize;
                Some(self.members[index].0 .0.clone())
            }
        }
    }

    /// Remove `ep` by identity; returns whether a member was removed.
    fn remove(&mut self, ep: &Arc<dyn TransportEndpoint>) -> bool {
        let before = self.members.len();
        self.members
            .retain(|(member, _)| !Arc::ptr_eq(&member.0, ep));
        self.members.len() != before
    }
}

/// Registrations for one id, split by NIC binding. A NIC-scoped entry has
/// precedence over the global (unspecified-NIC) one.
struct EndpointsByNic {
    by_nic: HashMap<NicId, MultiPortEndpoint>,
}

impl EndpointsByNic {
    fn new() -> Self {
        Self {
            by_nic: HashMap::new(),
        }
    }

    fn check(&self, flags: PortFlags, bind_nic: NicId) -> Result<(), StackError> {
        match self.by_nic.get(&bind_nic) {
            Some(group) if !group.can_accept(flags) => Err(StackError::AddressInUse),
            _ => Ok(()),
        }
    }

    fn register(
        &mut self,
        ep: &Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_nic: NicId,
    ) -> Result<(), StackError> {
        let group = self.by_nic.entry(bind_nic).or_insert_with(MultiPortEndpoint::new);
        if !group.can_accept(flags) {
            return Err(StackError::AddressInUse);
        }
        group.members.push((EndpointRef(ep.clone()), flags));
        Ok(())
    }

    fn unregister(&mut self, ep: &Arc<dyn TransportEndpoint>, bind_nic: NicId) -> bool {
        let Some(group) = self.by_nic.get_mut(&bind_nic) else {
            return false;
        };
        let removed = group.remove(ep);
        if group.members.is_empty() {
            self.by_nic.remove(&bind_nic);
        }
        removed
    }

    fn lookup(
        &self,
        id: &TransportEndpointId,
        nic: NicId,
        seed: u32,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        if !nic.is_unspecified() {
            if let Some(ep) = self.by_nic.get(&nic).and_then(|g| g.select(id, seed)) {
                return Some(ep);
            }
        }
        self.by_nic
            .get(&NicId::UNSPECIFIED)
            .and_then(|g| g.select(id, seed))
    }

    fn is_empty(&self) -> bool {
        self.by_nic.is_empty()
    }

    fn endpoints(&self) -> impl Iterator<Item = &EndpointRef> {
        self.by_nic.values().flat_map(|g| g.members.iter().map(|(e, _)| e))
    }
}

struct BucketState {
    endpoints: HashMap<TransportEndpointId, EndpointsByNic>,
    raw: Vec<Arc<dyn RawTransportEndpoint>>,
}

/// Registrations for one `(netProto, transProto)` pair.
struct Bucket {
    state: RwLock<BucketState>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            state: RwLock::new(BucketState {
                endpoints: HashMap::new(),
                raw: Vec::new(),
            }),
        }
    }
}

/// The stack-wide transport demuxer.
///
/// The bucket set is fixed at stack construction from the registered
/// protocol pairs; registration against an unknown pair fails with
/// `UnknownProtocol`.
pub(crate) struct TransportDemuxer {
    buckets: HashMap<(NetworkProtocolNumber, TransportProtocolNumber), Bucket>,
    seed: u32,
}

impl TransportDemuxer {
    pub(crate) fn new(
        net_protos: &[NetworkProtocolNumber],
        trans_protos: &[TransportProtocolNumber],
        seed: u32,
    ) -> Self {
        let mut buckets = HashMap::new();
        for &net in net_protos {
            for &trans in trans_protos {
                buckets.insert((net, trans), Bucket::new());
            }
        }
        Self { buckets, seed }
    }

    fn bucket(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
    ) -> Result<&Bucket, StackError> {
        self.buckets
            .get(&(net, trans))
            .ok_or(StackError::UnknownProtocol)
    }

    /// Register `ep` under `id` for every listed network protocol, rolling
    /// back on the first failure.
    pub(crate) fn register_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_nic: NicId,
    ) -> Result<(), StackError> {
        for (done, &net) in net_protos.iter().enumerate() {
            if let Err(err) = self.single_register(net, trans, id, ep, flags, bind_nic) {
                for &prev in &net_protos[..done] {
                    self.single_unregister(prev, trans, id, ep, bind_nic);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// The conflict check of `register_endpoint`, without committing.
    pub(crate) fn check_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        flags: PortFlags,
        bind_nic: NicId,
    ) -> Result<(), StackError> {
        for &net in net_protos {
            let bucket = self.bucket(net, trans)?;
            let state = bucket.state.read().unwrap();
            if let Some(by_nic) = state.endpoints.get(&id) {
                by_nic.check(flags, bind_nic)?;
            }
        }
        Ok(())
    }

    /// Remove the registration; a no-op when `ep` was never registered.
    pub(crate) fn unregister_endpoint(
        &self,
        net_protos: &[NetworkProtocolNumber],
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        bind_nic: NicId,
    ) {
        for &net in net_protos {
            self.single_unregister(net, trans, id, ep, bind_nic);
        }
    }

    fn single_register(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        flags: PortFlags,
        bind_nic: NicId,
    ) -> Result<(), StackError> {
        let bucket = self.bucket(net, trans)?;
        let mut state = bucket.state.write().unwrap();
        state
            .endpoints
            .entry(id)
            .or_insert_with(EndpointsByNic::new)
            .register(ep, flags, bind_nic)
    }

    fn single_unregister(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: &Arc<dyn TransportEndpoint>,
        bind_nic: NicId,
    ) {
        let Ok(bucket) = self.bucket(net, trans) else {
            return;
        };
        let mut state = bucket.state.write().unwrap();
        if let Some(by_nic) = state.endpoints.get_mut(&id) {
            by_nic.unregister(ep, bind_nic);
            if by_nic.is_empty() {
                state.endpoints.remove(&id);
            }
        }
    }

    /// The most specific endpoint registered for `id`, or None.
    pub(crate) fn find_transport_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        nic: NicId,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        let bucket = self.buckets.get(&(net, trans))?;
        let state = bucket.state.read().unwrap();
        let candidates = [
            id,
            id.with_wildcard_remote(),
            id.with_wildcard_local(),
        ];
        for candidate in candidates {
            if let Some(by_nic) = state.endpoints.get(&candidate) {
                if let Some(ep) = by_nic.lookup(&id, nic, self.seed) {
                    return Some(ep);
                }
            }
        }
        None
    }

    /// Register a raw endpoint accepting all packets of `trans` on `net`.
    pub(crate) fn register_raw_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        ep: Arc<dyn RawTransportEndpoint>,
    ) -> Result<(), StackError> {
        let bucket = self.bucket(net, trans)?;
        bucket.state.write().unwrap().raw.push(ep);
        Ok(())
    }

    pub(crate) fn unregister_raw_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        ep: &Arc<dyn RawTransportEndpoint>,
    ) {
        let Ok(bucket) = self.bucket(net, trans) else {
            return;
        };
        let mut state = bucket.state.write().unwrap();
        state.raw.retain(|member| !Arc::ptr_eq(member, ep));
    }

    /// Every endpoint currently registered, deduplicated by identity.
    pub(crate) fn transport_endpoints(&self) -> Vec<Arc<dyn TransportEndpoint>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for bucket in self.buckets.values() {
            let state = bucket.state.read().unwrap();
            for by_nic in state.endpoints.values() {
                for ep in by_nic.endpoints() {
                    if seen.insert(ep.clone()) {
                        out.push(ep.0.clone());
                    }
                }
            }
        }
        out
    }
}
