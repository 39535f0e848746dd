//! Counter bundles for stack- and NIC-level statistics.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing event counter.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counter({})", self.value())
    }
}

/// Stack-wide counters.
///
/// A freshly zeroed set is installed when the integrator does not supply one.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Packets delivered up from link endpoints.
    pub packets_received: Counter,
    /// Packets handed to a network endpoint.
    pub packets_delivered: Counter,
    /// Packets dropped before delivery (disabled NIC, no endpoint).
    pub packets_dropped: Counter,
    /// Packets for a network protocol the stack does not carry.
    pub unknown_protocol_received: Counter,
    /// Outbound packets written to a link endpoint.
    pub packets_sent: Counter,
    /// ICMP messages suppressed by the rate limiter.
    pub icmp_rate_limited: Counter,
}

/// Per-NIC counters.
#[derive(Debug, Default)]
pub struct NicStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    /// Packets that arrived while the NIC was disabled.
    pub disabled_rx_packets: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::default();
        assert_eq!(c.value(), 0);
        c.increment();
        c.add(4);
        assert_eq!(c.value(), 5);
    }

    #[test]
    fn stats_start_zeroed() {
        let stats = StackStats::default();
        assert_eq!(stats.packets_received.value(), 0);
        assert_eq!(stats.packets_dropped.value(), 0);
    }
}
