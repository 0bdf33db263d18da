//! Application-facing events.

use serde::{Deserialize, Serialize};

use crate::protocol::fragment::Message;
use crate::types::{Peer, Role};

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Why a connection attempt or resumption did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The remote peer refused the connection request.
    Rejected,
    /// The connection did not complete in time.
    Timeout,
    /// The remote peer refused to resume a lost connection.
    ResumeRejected,
}

/// Everything the engine reports to the application, delivered through a
/// single subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    AdvertiseStarted,
    AdvertiseStopped,
    DiscoveryStarted,
    DiscoveryStopped,

    /// A broadcasting peer appeared in scan results.
    PeerFound(Peer),
    /// A previously found peer went out of range.
    PeerLost(Peer),
    /// A connected peer changed its name.
    PeerUpdated { previous: Peer, current: Peer },

    /// A nearby peer asked to connect; answer with accept or reject.
    ConnectionRequested(Peer),
    ConnectionSuccess(Peer, Role),
    ConnectionFailed { peer: Peer, reason: FailureReason },

    /// The link dropped; the engine is trying to reconnect. Outbound traffic
    /// is queued until the connection resumes or times out.
    ConnectionLost(Peer),
    ConnectionResumed(Peer),

    MessageReceived { message: Message, role: Role },
    DataReceived { message: Message, role: Role },

    /// A peer is gone for good, deliberately or after reconnection failed.
    Disconnected { peer: Peer, peers_left: usize },
    /// A disconnect was requested for a peer with no channel.
    DisconnectionFailed(Peer),
}
