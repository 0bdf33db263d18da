//! Effects the engine asks its driver to perform.
//!
//! The engine is a synchronous state machine; every externally visible action
//! leaves it as an [`Effect`]. The runtime driver executes them against the
//! [`Link`](crate::link::Link) and
//! [`TransportControl`](crate::link::TransportControl) implementations,
//! manages timer tasks, and forwards [`Event`]s to subscribers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::link::AttributeId;
use crate::types::{Peer, PeerAddress, Role};

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

/// The timers a channel arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Hardware connect to full connection.
    ConnectionComplete,
    /// Link loss to re-established link.
    Reconnection,
    /// In-flight message fragment awaiting acknowledgement.
    MessageAck,
    /// In-flight data fragment awaiting acknowledgement.
    DataAck,
}

/// Identifies one arming of one timer.
///
/// The generation is bumped on every arm and cancel, so a fire that raced a
/// cancellation carries a stale token and is discarded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerToken {
    pub role: Role,
    pub channel: u64,
    pub kind: TimerKind,
    pub generation: u64,
}

// ----------------------------------------------------------------------------
// Effects
// ----------------------------------------------------------------------------

/// An action for the runtime driver.
#[derive(Debug, Clone)]
pub enum Effect {
    StartBroadcast { unique_name: String },
    StopBroadcast,
    StartScan,
    StopScan,

    OpenLink { peer: Peer },
    CloseLink { address: PeerAddress },
    Subscribe { address: PeerAddress, attribute: AttributeId },
    WriteAttribute { address: PeerAddress, attribute: AttributeId, value: Vec<u8> },
    ReadAttribute { address: PeerAddress, attribute: AttributeId },
    NotifyAttribute { address: PeerAddress, attribute: AttributeId, value: Vec<u8>, confirm: bool },
    RespondWrite { address: PeerAddress, attribute: AttributeId, ok: bool, value: Vec<u8> },
    RespondRead { address: PeerAddress, attribute: AttributeId, value: Vec<u8> },
    RequestMtu { address: PeerAddress, mtu: usize },
    RefreshDeviceCache { address: PeerAddress },

    StartTimer { token: TimerToken, duration: Duration },
    CancelTimer { token: TimerToken },

    Emit(Event),
}
