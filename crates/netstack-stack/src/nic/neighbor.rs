//! Per-NIC neighbor cache and NUD configuration.
//!
//! The cache stores resolved and static link addresses and queues callbacks
//! for addresses under resolution. Resolution itself (ARP, NDP) is a
//! protocol concern; completion arrives through the NIC. Callbacks returned
//! by cache methods must be invoked after the cache lock is released — they
//! may call back into the stack.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use netstack_core::{Address, LinkAddress, MonotonicTime, NicId, StackError};

/// Neighbor unreachability detection timing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NudConfigurations {
    pub base_reachable_time: Duration,
    pub retransmit_timer: Duration,
    pub max_multicast_probes: u32,
    pub max_unicast_probes: u32,
}

impl Default for NudConfigurations {
    fn default() -> Self {
        Self {
            base_reachable_time: Duration::from_secs(30),
            retransmit_timer: Duration::from_secs(1),
            max_multicast_probes: 3,
            max_unicast_probes: 3,
        }
    }
}

impl NudConfigurations {
    /// Replace invalid (zero) fields with defaults.
    #[must_use]
    pub fn sanitized(self) -> Self {
        let defaults = Self::default();
        Self {
            base_reachable_time: if self.base_reachable_time.is_zero() {
                defaults.base_reachable_time
            } else {
                self.base_reachable_time
            },
            retransmit_timer: if self.retransmit_timer.is_zero() {
                defaults.retransmit_timer
            } else {
                self.retransmit_timer
            },
            max_multicast_probes: if self.max_multicast_probes == 0 {
                defaults.max_multicast_probes
            } else {
                self.max_multicast_probes
            },
            max_unicast_probes: if self.max_unicast_probes == 0 {
                defaults.max_unicast_probes
            } else {
                self.max_unicast_probes
            },
        }
    }
}

/// Sink for neighbor table events.
pub trait NudDispatcher: Send + Sync {
    fn on_neighbor_added(&self, nic: NicId, entry: &NeighborEntry);
    fn on_neighbor_changed(&self, nic: NicId, entry: &NeighborEntry);
    fn on_neighbor_removed(&self, nic: NicId, entry: &NeighborEntry);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeighborState {
    /// Resolution in flight.
    Incomplete,
    /// Resolved dynamically.
    Reachable,
    /// Installed by the operator; never expires.
    Static,
}

/// One IP-to-link-address association.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NeighborEntry {
    pub addr: Address,
    pub link_addr: LinkAddress,
    pub state: NeighborState,
    pub updated_at: MonotonicTime,
}

/// Callback invoked when a link-address resolution completes.
pub type LinkResolutionCallback = Box<dyn FnOnce(Result<LinkAddress, StackError>) + Send>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<Address, NeighborEntry>,
    pending: HashMap<Address, Vec<LinkResolutionCallback>>,
}

/// The neighbor cache for one protocol on one NIC.
#[derive(Default)]
pub(crate) struct NeighborCache {
    state: Mutex<CacheState>,
}

/// Outcome of a cache mutation: the event to dispatch (if any) and the
/// callbacks to invoke outside the lock.
pub(crate) struct CacheUpdate {
    pub(crate) added: Option<NeighborEntry>,
    pub(crate) changed: Option<NeighborEntry>,
    pub(crate) removed: Option<NeighborEntry>,
    pub(crate) callbacks: Vec<(LinkResolutionCallback, Result<LinkAddress, StackError>)>,
}

impl CacheUpdate {
    fn none() -> Self {
        Self {
            added: None,
            changed: None,
            removed: None,
            callbacks: Vec::new(),
        }
    }
}

impl NeighborCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A usable link address for `addr`, if resolved.
    pub(crate) fn lookup(&self, addr: &Address) -> Option<LinkAddress> {
        let state = self.state.lock().unwrap();
        state.entries.get(addr).and_then(|e| match e.state {
            NeighborState::Reachable | NeighborState::Static => Some(e.link_addr),
            NeighborState::Incomplete => None,
        })
    }

    /// Install a static association, completing any pending resolution.
    pub(crate) fn add_static(
        &self,
        addr: Address,
        link_addr: LinkAddress,
        now: MonotonicTime,
    ) -> CacheUpdate {
        let mut state = self.state.lock().unwrap();
        let entry = NeighborEntry {
            addr,
            link_addr,
            state: NeighborState::Static,
            updated_at: now,
        };
        let previous = state.entries.insert(addr, entry);
        let callbacks = state
            .pending
            .remove(&addr)
            .unwrap_or_default()
            .into_iter()
            .map(|cb| (cb, Ok(link_addr)))
            .collect();

        let mut update = CacheUpdate::none();
        update.callbacks = callbacks;
        match previous {
            None => update.added = Some(entry),
            Some(prev) if prev != entry => update.changed = Some(entry),
            Some(_) => {}
        }
        update
    }

    /// Remove an association. Fails with `BadAddress` when absent.
    pub(crate) fn remove(&self, addr: &Address) -> Result<CacheUpdate, StackError> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entries.remove(addr).ok_or(StackError::BadAddress)?;
        let mut update = CacheUpdate::none();
        update.removed = Some(entry);
        Ok(update)
    }

    /// Remove every association; returns one update per removed entry.
    pub(crate) fn clear(&self) -> Vec<NeighborEntry> {
        let mut state = self.state.lock().unwrap();
        state.entries.drain().map(|(_, e)| e).collect()
    }

    pub(crate) fn entries(&self) -> Vec<NeighborEntry> {
        self.state.lock().unwrap().entries.values().copied().collect()
    }

    /// Queue a callback for `addr`. Returns the update plus whether this is
    /// the first waiter (the caller should send a probe).
    pub(crate) fn enqueue(
        &self,
        addr: Address,
        callback: LinkResolutionCallback,
        now: MonotonicTime,
    ) -> (CacheUpdate, bool) {
        let mut state = self.state.lock().unwrap();
        let waiters = state.pending.entry(addr).or_default();
        waiters.push(callback);
        let first = waiters.len() == 1;

        let mut update = CacheUpdate::none();
        if first {
            let entry = NeighborEntry {
                addr,
                link_addr: LinkAddress::default(),
                state: NeighborState::Incomplete,
                updated_at: now,
            };
            if state.entries.insert(addr, entry).is_none() {
                update.added = Some(entry);
            }
        }
        (update, first)
    }

    /// Complete an outstanding resolution.
    pub(crate) fn complete(
        &self,
        addr: &Address,
        result: Result<LinkAddress, StackError>,
        now: MonotonicTime,
    ) -> CacheUpdate {
        let mut state = self.state.lock().unwrap();
        let callbacks: Vec<_> = state
            .pending
            .remove(addr)
            .unwrap_or_default()
            .into_iter()
            .map(|cb| (cb, result))
            .collect();

        let mut update = CacheUpdate::none();
        update.callbacks = callbacks;
        match result {
            Ok(link_addr) => {
                let entry = NeighborEntry {
                    addr: *addr,
                    link_addr,
                    state: NeighborState::Reachable,
                    updated_at: now,
                };
                let previous = state.entries.insert(*addr, entry);
                match previous {
                    None => update.added = Some(entry),
                    Some(prev) if prev != entry => update.changed = Some(entry),
                    Some(_) => {}
                }
            }
            Err(_) => {
                if let Some(entry) = state.entries.get(addr).copied() {
                    if entry.state == NeighborState::Incomplete {
                        state.entries.remove(addr);
                        update.removed = Some(entry);
                    }
                }
            }
        }
        update
    }

    /// Fail every pending resolution (NIC teardown).
    pub(crate) fn fail_pending(&self) -> Vec<(LinkResolutionCallback, Result<LinkAddress, StackError>)> {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<Vec<LinkResolutionCallback>> =
            state.pending.drain().map(|(_, cbs)| cbs).collect();
        pending
            .into_iter()
            .flatten()
            .map(|cb| (cb, Err(StackError::Aborted)))
            .collect()
    }
}
