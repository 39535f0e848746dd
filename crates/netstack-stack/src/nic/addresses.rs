//! The per-NIC, per-protocol address book.
//!
//! Each address carries a primary classification, a temporary flag, and
//! lifetime metadata. Primary selection walks the book in order: `First`
//! entries are inserted at the front, `Never` entries are skipped, and
//! deprecated entries are used only when nothing else qualifies.

use netstack_core::{Address, AddressWithPrefix, MonotonicTime, StackError};

/// How an address participates in primary (source) selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimaryEndpointBehavior {
    /// Eligible for primary selection in insertion order.
    #[default]
    CanBePrimary,
    /// Eligible and preferred over existing entries.
    First,
    /// Never selected as a primary address.
    Never,
}

/// Informational lifetimes attached to an address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddressLifetimes {
    /// Deprecated addresses are not used for new outbound traffic unless no
    /// preferred address exists.
    pub deprecated: bool,
    /// When the address stops being preferred; `None` is infinite.
    pub preferred_until: Option<MonotonicTime>,
    /// When the address stops being valid; `None` is infinite.
    pub valid_until: Option<MonotonicTime>,
}

/// Properties supplied when adding an address.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddressProperties {
    pub behavior: PrimaryEndpointBehavior,
    /// Temporary addresses are excluded from the permanent listing.
    pub temporary: bool,
    pub lifetimes: AddressLifetimes,
}

/// The result of an address lookup: enough to build a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct AssignedAddress {
    pub address_with_prefix: AddressWithPrefix,
    pub deprecated: bool,
    pub temporary: bool,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    awp: AddressWithPrefix,
    behavior: PrimaryEndpointBehavior,
    temporary: bool,
    lifetimes: AddressLifetimes,
}

impl Entry {
    fn assigned(&self) -> AssignedAddress {
        AssignedAddress {
            address_with_prefix: self.awp,
            deprecated: self.lifetimes.deprecated,
            temporary: self.temporary,
        }
    }
}

/// Ordered address set for one protocol on one NIC.
#[derive(Default)]
pub(crate) struct AddressBook {
    entries: Vec<Entry>,
}

impl AddressBook {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        awp: AddressWithPrefix,
        props: AddressProperties,
    ) -> Result<(), StackError> {
        if awp.address.is_empty() {
            return Err(StackError::BadAddress);
        }
        if self.entries.iter().any(|e| e.awp.address == awp.address) {
            return Err(StackError::DuplicateAddress);
        }
        let entry = Entry {
            awp,
            behavior: props.behavior,
            temporary: props.temporary,
            lifetimes: props.lifetimes,
        };
        match props.behavior {
            PrimaryEndpointBehavior::First => self.entries.insert(0, entry),
            _ => self.entries.push(entry),
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, addr: &Address) -> Result<(), StackError> {
        let at = self
            .entries
            .iter()
            .position(|e| e.awp.address == *addr)
            .ok_or(StackError::BadLocalAddress)?;
        self.entries.remove(at);
        Ok(())
    }

    pub(crate) fn set_lifetimes(
        &mut self,
        addr: &Address,
        lifetimes: AddressLifetimes,
    ) -> Result<(), StackError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.awp.address == *addr)
            .ok_or(StackError::BadLocalAddress)?;
        entry.lifetimes = lifetimes;
        Ok(())
    }

    pub(crate) fn has(&self, addr: &Address) -> bool {
        self.entries.iter().any(|e| e.awp.address == *addr)
    }

    pub(crate) fn find(&self, addr: &Address) -> Option<AssignedAddress> {
        self.entries
            .iter()
            .find(|e| e.awp.address == *addr)
            .map(Entry::assigned)
    }

    /// The first primary address: non-deprecated entries win, deprecated
    /// ones are a fallback.
    pub(crate) fn primary_address(&self) -> Option<AddressWithPrefix> {
        self.primary_assigned(&Address::empty(), &Address::empty())
            .map(|a| a.address_with_prefix)
    }

    /// Select a primary address for reaching `remote`, honoring an optional
    /// source hint.
    pub(crate) fn primary_assigned(
        &self,
        remote: &Address,
        src_hint: &Address,
    ) -> Option<AssignedAddress> {
        let candidates = || {
            self.entries
                .iter()
                .filter(|e| e.behavior != PrimaryEndpointBehavior::Never)
        };

        if !src_hint.is_empty() {
            if let Some(e) = candidates().find(|e| e.awp.address == *src_hint) {
                return Some(e.assigned());
            }
        }

        // Prefer an address on the remote's subnet, then any preferred
        // address, then a deprecated one.
        if !remote.is_empty() {
            if let Some(e) = candidates()
                .find(|e| !e.lifetimes.deprecated && e.awp.subnet().contains(remote))
            {
                return Some(e.assigned());
            }
        }
        if let Some(e) = candidates().find(|e| !e.lifetimes.deprecated) {
            return Some(e.assigned());
        }
        candidates().next().map(Entry::assigned)
    }

    /// All non-temporary addresses.
    pub(crate) fn permanent(&self) -> Vec<AddressWithPrefix> {
        self.entries
            .iter()
            .filter(|e| !e.temporary)
            .map(|e| e.awp)
            .collect()
    }

    /// Addresses eligible for primary selection.
    pub(crate) fn primary_candidates(&self) -> Vec<AddressWithPrefix> {
        self.entries
            .iter()
            .filter(|e| e.behavior != PrimaryEndpointBehavior::Never)
            .map(|e| e.awp)
            .collect()
    }

    /// Whether `addr` is the subnet broadcast of any assigned block.
    pub(crate) fn is_subnet_broadcast(&self, addr: &Address) -> bool {
        self.entries
            .iter()
            .any(|e| e.awp.subnet().is_broadcast(addr))
    }
}
