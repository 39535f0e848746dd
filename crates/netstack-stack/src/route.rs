//! The route table: an ordered container of routes, longest prefix first.

use core::fmt;

use netstack_core::{Address, NicId, Subnet};

/// A route table entry: destination block, optional gateway, outgoing NIC,
/// optional source hint and MTU.
#[derive(Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct RouteEntry {
    pub destination: Subnet,
    pub gateway: Address,
    pub nic: NicId,
    /// Preferred source address for traffic using this route, if any.
    pub source_hint: Address,
    /// Route MTU; zero means "use the link MTU".
    pub mtu: u32,
}

impl RouteEntry {
    /// A gatewayless route to `destination` through `nic`.
    pub fn directly_connected(destination: Subnet, nic: NicId) -> Self {
        Self {
            destination,
            gateway: Address::empty(),
            nic,
            source_hint: Address::empty(),
            mtu: 0,
        }
    }

    /// A route to `destination` via `gateway` through `nic`.
    pub fn via_gateway(destination: Subnet, gateway: Address, nic: NicId) -> Self {
        Self {
            gateway,
            ..Self::directly_connected(destination, nic)
        }
    }

    /// Whether this entry applies to `addr`.
    #[must_use]
    pub fn matches(&self, addr: &Address) -> bool {
        self.destination.contains(addr)
    }

    /// Whether two entries share the lookup key (destination and NIC).
    #[must_use]
    pub fn same_lookup_key(&self, other: &RouteEntry) -> bool {
        self.destination == other.destination && self.nic == other.nic
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {} nic {}", self.destination, self.gateway, self.nic)
    }
}

/// Routes ordered by decreasing destination prefix length.
///
/// The table has no internal lock; the stack is its only owner and guards it
/// with the route lock, acquired after the NIC lock when both are needed.
#[derive(Default)]
#[must_use]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Replace the entire table. Entries are re-inserted one by one so the
    /// prefix ordering invariant holds regardless of input order.
    pub fn set(&mut self, routes: Vec<RouteEntry>) {
        self.entries.clear();
        for route in routes {
            self.add(route);
        }
    }

    /// Insert `route` before the first entry with a strictly smaller prefix,
    /// preserving insertion order among entries of equal prefix length.
    pub fn add(&mut self, route: RouteEntry) {
        let prefix = route.destination.prefix();
        let at = self
            .entries
            .iter()
            .position(|e| e.destination.prefix() < prefix)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, route);
    }

    /// Remove every entry matching `predicate`; returns how many were
    /// removed. Surviving entries keep their order.
    pub fn remove<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&RouteEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(e));
        before - self.entries.len()
    }

    /// Remove every entry equal to `route` by lookup key, then insert
    /// `route`.
    pub fn replace(&mut self, route: RouteEntry) {
        self.remove(|e| e.same_lookup_key(&route));
        self.add(route);
    }

    /// A copy safe to iterate without holding the table's lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        self.entries.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netstack_core::Address;

    fn subnet(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> Subnet {
        Subnet::new(Address::from_v4([a, b, c, d]), prefix)
    }

    fn route(prefix: u8, nic: u32) -> RouteEntry {
        RouteEntry::directly_connected(subnet(10, 0, 0, 0, prefix), NicId::new(nic))
    }

    fn prefixes(table: &RouteTable) -> Vec<u8> {
        table.iter().map(|e| e.destination.prefix()).collect()
    }

    #[test]
    fn add_keeps_longest_prefix_first() {
        let mut table = RouteTable::new();
        table.add(RouteEntry::directly_connected(
            subnet(0, 0, 0, 0, 0),
            NicId::new(1),
        ));
        assert_eq!(prefixes(&table), vec![0]);

        table.add(RouteEntry::directly_connected(
            subnet(10, 0, 0, 0, 8),
            NicId::new(2),
        ));
        assert_eq!(prefixes(&table), vec![8, 0]);

        table.add(RouteEntry::directly_connected(
            subnet(10, 1, 0, 0, 16),
            NicId::new(3),
        ));
        assert_eq!(prefixes(&table), vec![16, 8, 0]);
    }

    #[test]
    fn equal_prefix_entries_keep_insertion_order() {
        let mut table = RouteTable::new();
        let first = RouteEntry::directly_connected(subnet(10, 0, 0, 0, 8), NicId::new(1));
        let second = RouteEntry::directly_connected(subnet(11, 0, 0, 0, 8), NicId::new(2));
        table.add(first);
        table.add(second);

        let snapshot = table.snapshot();
        assert_eq!(snapshot[0].nic, NicId::new(1));
        assert_eq!(snapshot[1].nic, NicId::new(2));
    }

    #[test]
    fn set_reorders_input() {
        let mut table = RouteTable::new();
        table.set(vec![route(0, 1), route(16, 2), route(8, 3)]);
        assert_eq!(prefixes(&table), vec![16, 8, 0]);
    }

    #[test]
    fn remove_returns_count_and_keeps_order() {
        let mut table = RouteTable::new();
        table.set(vec![route(8, 1), route(16, 2), route(24, 1), route(0, 3)]);

        let removed = table.remove(|e| e.nic == NicId::new(1));
        assert_eq!(removed, 2);
        assert_eq!(prefixes(&table), vec![16, 0]);

        // Removing nothing reports zero.
        assert_eq!(table.remove(|e| e.nic == NicId::new(9)), 0);
    }

    #[test]
    fn replace_swaps_matching_lookup_key() {
        let mut table = RouteTable::new();
        let original = RouteEntry::directly_connected(subnet(10, 0, 0, 0, 8), NicId::new(1));
        table.add(original);

        let replacement = RouteEntry::via_gateway(
            subnet(10, 0, 0, 0, 8),
            Address::from_v4([10, 0, 0, 254]),
            NicId::new(1),
        );
        table.replace(replacement);

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.snapshot()[0].gateway,
            Address::from_v4([10, 0, 0, 254])
        );

        // A different lookup key is inserted alongside.
        table.replace(RouteEntry::directly_connected(
            subnet(10, 0, 0, 0, 8),
            NicId::new(2),
        ));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn add_then_remove_round_trips() {
        let mut table = RouteTable::new();
        table.set(vec![route(8, 1), route(0, 2)]);
        let before = table.snapshot();

        let extra = RouteEntry::directly_connected(subnet(172, 16, 0, 0, 12), NicId::new(7));
        table.add(extra);
        table.remove(|e| *e == extra);

        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn matches_respects_destination() {
        let entry = route(8, 1);
        assert!(entry.matches(&Address::from_v4([10, 1, 2, 3])));
        assert!(!entry.matches(&Address::from_v4([11, 0, 0, 1])));
        assert!(!entry.matches(&Address::empty()));
    }
}
