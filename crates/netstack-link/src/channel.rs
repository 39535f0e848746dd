//! A queue-backed link endpoint.
//!
//! Outbound packets land in an unbounded queue that a test or integrator
//! drains; inbound packets are injected with [`ChannelEndpoint::inject`].
//! This is the endpoint used throughout the stack's own tests and by the
//! host binary's in-memory interfaces.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use netstack_core::{LinkAddress, NetworkProtocolNumber, PacketBuffer, StackError};

use crate::traits::{LinkCapabilities, LinkEndpoint, NetworkDispatcher, OnCloseAction};

/// Configuration for a [`ChannelEndpoint`].
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub mtu: u32,
    pub link_address: LinkAddress,
    /// Whether sends require neighbor resolution first.
    pub resolution_required: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            link_address: LinkAddress::default(),
            resolution_required: false,
        }
    }
}

/// Link endpoint that queues outbound packets for inspection.
pub struct ChannelEndpoint {
    mtu: AtomicU32,
    link_addr: Mutex<LinkAddress>,
    resolution_required: bool,
    dispatcher: Mutex<Option<Arc<dyn NetworkDispatcher>>>,
    on_close: Mutex<Option<OnCloseAction>>,
    closed: AtomicBool,
    tx: mpsc::UnboundedSender<PacketBuffer>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PacketBuffer>>,
}

impl ChannelEndpoint {
    pub fn new(config: ChannelConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            mtu: AtomicU32::new(config.mtu),
            link_addr: Mutex::new(config.link_address),
            resolution_required: config.resolution_required,
            dispatcher: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Await the next packet written to the link.
    pub async fn recv(&self) -> Option<PacketBuffer> {
        self.rx.lock().await.recv().await
    }

    /// Pop a written packet without waiting.
    pub fn try_recv(&self) -> Option<PacketBuffer> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Deliver an inbound packet up to the attached dispatcher.
    ///
    /// Returns false if nothing is attached (the packet is dropped).
    pub fn inject(&self, protocol: NetworkProtocolNumber, pkt: PacketBuffer) -> bool {
        let dispatcher = self.dispatcher.lock().unwrap().clone();
        match dispatcher {
            Some(d) => {
                d.deliver_network_packet(protocol, pkt);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl LinkEndpoint for ChannelEndpoint {
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
        *self.link_addr.lock().unwrap()
    }

    fn set_link_address(&self, addr: LinkAddress) {
        *self.link_addr.lock().unwrap() = addr;
    }

    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities {
            resolution_required: self.resolution_required,
            loopback: false,
        }
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        *self.dispatcher.lock().unwrap() = dispatcher;
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.lock().unwrap().is_some()
    }

    fn write_packet(&self, pkt: PacketBuffer) -> Result<(), StackError> {
        if self.is_closed() {
            return Err(StackError::InvalidEndpointState);
        }
        // The receiver lives as long as self, so send cannot fail here.
        self.tx
            .send(pkt)
            .map_err(|_| StackError::InvalidEndpointState)
    }

    fn set_on_close_action(&self, action: Option<OnCloseAction>) {
        *self.on_close.lock().unwrap() = action;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("channel link endpoint closed");
        let action = self.on_close.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }
}
