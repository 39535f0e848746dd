//! Generic conformance assertions for [`LinkEndpoint`] implementations.
//!
//! These helpers validate invariants that every link endpoint should satisfy
//! regardless of its backing (channel, loopback, a real device).
//!
//! # Usage
//!
//! ```rust,ignore
//! use netstack_link::testing;
//!
//! let ep = MyEndpoint::new(config);
//! testing::assert_not_attached_initially(&*ep);
//! testing::assert_attach_detach(ep.clone());
//! testing::assert_close_action_runs_once(&*ep);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use netstack_core::{NetworkProtocolNumber, PacketBuffer};

use crate::traits::{LinkEndpoint, NetworkDispatcher};

/// A dispatcher that only counts deliveries.
pub struct NullDispatcher {
    delivered: AtomicUsize,
}

impl NullDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl NetworkDispatcher for NullDispatcher {
    fn deliver_network_packet(&self, _protocol: NetworkProtocolNumber, _pkt: PacketBuffer) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }
}

/// Assert that a freshly constructed endpoint is not attached.
pub fn assert_not_attached_initially(ep: &dyn LinkEndpoint) {
    assert!(
        !ep.is_attached(),
        "endpoint should not be attached before attach()"
    );
}

/// Assert that attach and detach toggle `is_attached`.
pub fn assert_attach_detach(ep: &dyn LinkEndpoint) {
    let dispatcher = NullDispatcher::new();
    ep.attach(Some(dispatcher));
    assert!(ep.is_attached(), "is_attached() should be true after attach");
    ep.attach(None);
    assert!(
        !ep.is_attached(),
        "is_attached() should be false after detach"
    );
}

/// Assert that the endpoint reports a positive MTU.
pub fn assert_mtu_positive(ep: &dyn LinkEndpoint) {
    assert!(ep.mtu() > 0, "MTU must be positive");
}

/// Assert that the registered close action fires exactly once across
/// repeated `close()` calls.
pub fn assert_close_action_runs_once(ep: &dyn LinkEndpoint) {
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    ep.set_on_close_action(Some(Box::new(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    })));
    ep.close();
    ep.close();
    assert_eq!(
        fired.load(Ordering::SeqCst),
        1,
        "close action must run exactly once"
    );
}
