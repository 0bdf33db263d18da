//! The boundary between the engine and the platform GATT stack.
//!
//! The engine never touches a radio. A [`Link`] moves attribute traffic for
//! established hardware links, a [`TransportControl`] starts and stops
//! broadcasting and scanning, and everything the platform observes comes back
//! into the engine as a [`LinkEvent`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::effects::TimerToken;
use crate::errors::Result;
use crate::types::{Peer, PeerAddress};

/// Wire symbol confirming a request (connection or resume).
pub const ACCEPT: &[u8] = b"0";
/// Wire symbol refusing a request.
pub const REJECT: &[u8] = b"1";

// ----------------------------------------------------------------------------
// Attributes
// ----------------------------------------------------------------------------

/// The attributes (GATT characteristics) the protocol multiplexes over.
///
/// `*Send` attributes are notified acceptor-to-initiator, `*Receive`
/// attributes are written initiator-to-acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeId {
    ConnectionRequest,
    ConnectionResponse,
    ConnectionResumedSend,
    ConnectionResumedReceive,
    MtuRequest,
    MtuResponse,
    MessageSend,
    MessageReceive,
    DataSend,
    DataReceive,
    ReadResponseMessage,
    ReadResponseData,
    NameUpdateSend,
    NameUpdateReceive,
    DisconnectionSend,
    DisconnectionReceive,
}

impl AttributeId {
    /// Attributes an initiator subscribes to after hardware connect.
    pub const NOTIFY_SET: [AttributeId; 7] = [
        AttributeId::ConnectionResponse,
        AttributeId::ConnectionResumedSend,
        AttributeId::MtuResponse,
        AttributeId::MessageSend,
        AttributeId::DataSend,
        AttributeId::NameUpdateSend,
        AttributeId::DisconnectionSend,
    ];
}

// ----------------------------------------------------------------------------
// Link Events
// ----------------------------------------------------------------------------

/// Everything the platform reports back to the engine.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A hardware link came up (either side).
    HardwareConnected { address: PeerAddress },
    /// A hardware link went down (either side).
    HardwareDisconnected { address: PeerAddress },
    /// Initiator side: a subscribed attribute was notified.
    Notification { address: PeerAddress, attribute: AttributeId, value: Vec<u8> },
    /// Initiator side: outcome of an attribute write, with the acceptor's
    /// response payload.
    WriteResult { address: PeerAddress, attribute: AttributeId, ok: bool, value: Vec<u8> },
    /// Initiator side: outcome of an attribute read.
    ReadResult { address: PeerAddress, attribute: AttributeId, ok: bool, value: Vec<u8> },
    /// Acceptor side: a peer wrote an attribute.
    InboundWrite { address: PeerAddress, attribute: AttributeId, value: Vec<u8> },
    /// Acceptor side: a peer is reading an attribute.
    ReadRequest { address: PeerAddress, attribute: AttributeId },
    /// Acceptor side: outcome of a confirmed notification.
    NotificationResult { address: PeerAddress, attribute: AttributeId, ok: bool },
    /// The negotiated attribute payload limit changed.
    MtuChanged { address: PeerAddress, mtu: usize },
    /// Scan result: a nearby peer broadcasting its unique name.
    PeerFound { peer: Peer },
    /// Scan result: a previously found peer went out of range.
    PeerLost { peer: Peer },
    /// An armed timer elapsed.
    TimerFired(TimerToken),
}

// ----------------------------------------------------------------------------
// Link and Transport Control Traits
// ----------------------------------------------------------------------------

/// Attribute-level I/O on hardware links.
///
/// Implementations report outcomes asynchronously through their [`LinkEvent`]
/// stream; the methods themselves only fail when the request cannot be
/// submitted at all.
#[async_trait]
pub trait Link: Send + Sync {
    /// Open a hardware link to a discovered peer.
    async fn open_link(&self, peer: &Peer) -> Result<()>;

    /// Tear down the hardware link.
    async fn close_link(&self, address: &PeerAddress) -> Result<()>;

    /// Subscribe to notifications of an attribute (initiator side).
    async fn subscribe(&self, address: &PeerAddress, attribute: AttributeId) -> Result<()>;

    /// Write an attribute (initiator side).
    async fn write_attribute(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Read an attribute (initiator side).
    async fn read_attribute(&self, address: &PeerAddress, attribute: AttributeId) -> Result<()>;

    /// Notify subscribers of an attribute (acceptor side).
    async fn notify_attribute(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
        confirm: bool,
    ) -> Result<()>;

    /// Answer an inbound attribute write (acceptor side).
    async fn respond_write(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        ok: bool,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Answer an inbound attribute read (acceptor side).
    async fn respond_read(
        &self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Ask the platform for a larger attribute payload limit.
    async fn request_mtu(&self, address: &PeerAddress, mtu: usize) -> Result<()>;

    /// Platform hook invoked after hardware connect. Defaults to a no-op;
    /// stacks that cache stale attribute tables can override it.
    async fn refresh_device_cache(&self, _address: &PeerAddress) -> Result<()> {
        Ok(())
    }
}

/// Broadcast and scan control.
#[async_trait]
pub trait TransportControl: Send + Sync {
    /// Start broadcasting the given unique name to nearby peers.
    async fn start_broadcast(&self, unique_name: &str) -> Result<()>;

    async fn stop_broadcast(&self) -> Result<()>;

    /// Start scanning for broadcasting peers.
    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;
}
