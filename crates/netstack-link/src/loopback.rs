//! A loopback link endpoint.
//!
//! Every outbound packet is immediately redelivered to the attached
//! dispatcher as an inbound one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use netstack_core::{LinkAddress, PacketBuffer, StackError};

use crate::traits::{LinkCapabilities, LinkEndpoint, NetworkDispatcher, OnCloseAction};

const DEFAULT_LOOPBACK_MTU: u32 = 65536;

pub struct LoopbackEndpoint {
    mtu: AtomicU32,
    dispatcher: Mutex<Option<Arc<dyn NetworkDispatcher>>>,
    on_close: Mutex<Option<OnCloseAction>>,
    closed: AtomicBool,
}

impl LoopbackEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mtu: AtomicU32::new(DEFAULT_LOOPBACK_MTU),
            dispatcher: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

impl LinkEndpoint for LoopbackEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    fn max_header_length(&self) -> u16 {
        0
    }

    fn link_address(&self) -> LinkAddress {
        LinkAddress::default()
    }

    fn set_link_address(&self, _addr: LinkAddress) {}

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities {
            resolution_required: false,
            loopback: true,
        }
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        *self.dispatcher.lock().unwrap() = dispatcher;
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.lock().unwrap().is_some()
    }

    fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StackError::InvalidEndpointState);
        }
        let dispatcher = self.dispatcher.lock().unwrap().clone();
        if let (Some(dispatcher), Some(protocol)) = (dispatcher, pkt.network_protocol) {
            dispatcher.deliver_network_packet(protocol, pkt);
        }
        Ok(())
    }

    fn set_on_close_action(&self, action: Option<OnCloseAction>) {
        *self.on_close.lock().unwrap() = action;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let action = self.on_close.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }
}
