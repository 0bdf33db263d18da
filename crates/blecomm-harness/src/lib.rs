//! In-memory link harness.
//!
//! [`TestNet`] plays the part of the radio: every registered endpoint gets a
//! fixed address, broadcasting and scanning feed discovery events, and
//! attribute traffic between linked endpoints is delivered over the nodes'
//! [`LinkEvent`] channels. This lets integration tests drive two (or more)
//! full engines against each other with no hardware underneath.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use blecomm_core::errors::ConnectionError;
use blecomm_core::link::{AttributeId, Link, LinkEvent, TransportControl};
use blecomm_core::{Event, Peer, PeerAddress, Result};

// ----------------------------------------------------------------------------
// Net State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Node {
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
    /// `Some` while the node is broadcasting this unique name.
    broadcasting: Option<String>,
    scanning: bool,
}

#[derive(Default)]
struct NetState {
    nodes: HashMap<PeerAddress, Node>,
    /// Established hardware links, stored with both orderings.
    links: Vec<(PeerAddress, PeerAddress)>,
}

impl NetState {
    fn send(&self, address: &PeerAddress, event: LinkEvent) {
        if let Some(tx) = self.nodes.get(address).and_then(|n| n.events.as_ref()) {
            let _ = tx.send(event);
        }
    }

    fn linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        self.links
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn unlink(&mut self, a: &PeerAddress, b: &PeerAddress) -> bool {
        let before = self.links.len();
        self.links
            .retain(|(x, y)| !((x == a && y == b) || (x == b && y == a)));
        self.links.len() != before
    }

    /// Announce every active broadcaster to every scanning node.
    fn announce_broadcasters(&self) {
        for (address, node) in &self.nodes {
            let Some(name) = &node.broadcasting else { continue };
            let peer = Peer::new(name.clone(), Some(address.clone()));
            for (other, other_node) in &self.nodes {
                if other != address && other_node.scanning {
                    self.send(other, LinkEvent::PeerFound { peer: peer.clone() });
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// TestNet
// ----------------------------------------------------------------------------

/// A simulated radio shared by every endpoint in a test.
#[derive(Clone, Default)]
pub struct TestNet {
    state: Arc<Mutex<NetState>>,
}

impl TestNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint at a fixed address. Pass the returned endpoint as
    /// both the [`Link`] and the [`TransportControl`] of a runtime, then
    /// [`attach`](TestNet::attach) the runtime's link event sender.
    pub fn endpoint(&self, address: &str) -> Arc<MemEndpoint> {
        let address = PeerAddress::from(address);
        self.lock().nodes.entry(address.clone()).or_default();
        Arc::new(MemEndpoint { address, state: self.state.clone() })
    }

    /// Wire a spawned runtime's link event channel to its endpoint.
    pub fn attach(&self, address: &str, events: mpsc::UnboundedSender<LinkEvent>) {
        let address = PeerAddress::from(address);
        self.lock().nodes.entry(address).or_default().events = Some(events);
    }

    /// Sever a hardware link out from under both sides, the way walking out
    /// of range does.
    pub fn drop_link(&self, a: &str, b: &str) {
        let a = PeerAddress::from(a);
        let b = PeerAddress::from(b);
        let mut state = self.lock();
        debug!(%a, %b, "dropping link");
        state.send(&a, LinkEvent::HardwareDisconnected { address: b.clone() });
        state.send(&b, LinkEvent::HardwareDisconnected { address: a.clone() });
        state.unlink(&a, &b);
        // Scanners keep seeing the advertisements of whoever still broadcasts.
        state.announce_broadcasters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// One node's view of the [`TestNet`]; implements both link traits.
pub struct MemEndpoint {
    address: PeerAddress,
    state: Arc<Mutex<NetState>>,
}

impl MemEndpoint {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Link for MemEndpoint {
    async fn open_link(&self, peer: &Peer) -> Result<()> {
        let target = peer
            .address()
            .cloned()
            .ok_or(ConnectionError::PeerNotFound)?;
        let mut state = self.lock();
        if !state.nodes.contains_key(&target) {
            return Err(ConnectionError::PeerNotFound.into());
        }
        if !state.linked(&self.address, &target) {
            state.links.push((self.address.clone(), target.clone()));
        }
        state.send(&self.address, LinkEvent::HardwareConnected { address: target.clone() });
        state.send(&target, LinkEvent::HardwareConnected { address: self.address.clone() });
        Ok(())
    }

    async fn close_link(&self, address: &PeerAddress) -> Result<()> {
        let mut state = self.lock();
        if state.unlink(&self.address, address) {
            state.send(&self.address, LinkEvent::HardwareDisconnected { address: address.clone() });
            state.send(address, LinkEvent::HardwareDisconnected { address: self.address.clone() });
        }
        Ok(())
    }

    async fn subscribe(&self, _address: &PeerAddress, _attribute: AttributeId) -> Result<()> {
        Ok(())
    }

    async fn write_attribute(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
    ) -> Result<()> {
        let state = self.lock();
        if !state.linked(&self.address, address) {
            return Err(ConnectionError::PeerNotFound.into());
        }
        state.send(address, LinkEvent::InboundWrite {
            address: self.address.clone(),
            attribute,
            value,
        });
        Ok(())
    }

    async fn read_attribute(&self, address: &PeerAddress, attribute: AttributeId) -> Result<()> {
        let state = self.lock();
        if !state.linked(&self.address, address) {
            return Err(ConnectionError::PeerNotFound.into());
        }
        state.send(address, LinkEvent::ReadRequest { address: self.address.clone(), attribute });
        Ok(())
    }

    async fn notify_attribute(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<()> {
        let state = self.lock();
        if !state.linked(&self.address, address) {
            return Err(ConnectionError::PeerNotFound.into());
        }
        state.send(address, LinkEvent::Notification {
            address: self.address.clone(),
            attribute,
            value,
        });
        if confirm {
            state.send(&self.address, LinkEvent::NotificationResult {
                address: address.clone(),
                attribute,
                ok: true,
            });
        }
        Ok(())
    }

    async fn respond_write(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        ok: bool,
        value: Vec<u8>,
    ) -> Result<()> {
        self.lock().send(address, LinkEvent::WriteResult {
            address: self.address.clone(),
            attribute,
            ok,
            value,
        });
        Ok(())
    }

    async fn respond_read(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
    ) -> Result<()> {
        self.lock().send(address, LinkEvent::ReadResult {
            address: self.address.clone(),
            attribute,
            ok: true,
            value,
        });
        Ok(())
    }

    async fn request_mtu(&self, address: &PeerAddress, mtu: usize) -> Result<()> {
        // The simulated radio grants whatever is asked.
        self.lock()
            .send(&self.address, LinkEvent::MtuChanged { address: address.clone(), mtu });
        Ok(())
    }
}

#[async_trait]
impl TransportControl for MemEndpoint {
    async fn start_broadcast(&self, unique_name: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.broadcasting = Some(unique_name.to_string());
        }
        state.announce_broadcasters();
        Ok(())
    }

    async fn stop_broadcast(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.broadcasting = None;
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.scanning = true;
        }
        state.announce_broadcasters();
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&self.address) {
            node.scanning = false;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Event Helpers
// ----------------------------------------------------------------------------

/// Wait for the first event the predicate accepts, or panic after the
/// timeout with the events seen so far.
pub async fn expect_event(
    events: &mut broadcast::Receiver<Event>,
    what: &str,
    predicate: impl Fn(&Event) -> bool,
) -> Event {
    let mut seen = Vec::new();
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => break event,
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting for {what}")
                }
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for {what}; saw {seen:?}"),
    }
}
