//! Peer-to-peer communication engine over a BLE GATT style link.
//!
//! This crate implements connection establishment with explicit accept/reject,
//! reconnection supervision after link loss, and reliable ordered delivery of
//! arbitrarily large messages over a small-MTU attribute pipe. Platform GATT
//! mechanics live behind the [`Link`] and [`TransportControl`] traits; the
//! engine itself is a synchronous state machine driven by [`LinkEvent`]s that
//! emits [`Effect`]s, with a tokio runtime driver in [`runtime`].

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel;
pub mod communicator;
pub mod config;
pub mod effects;
pub mod errors;
pub mod events;
pub mod link;
pub mod pending;
pub mod protocol;
pub mod role;
pub mod runtime;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use communicator::Communicator;
pub use config::CommConfig;
pub use effects::{Effect, TimerKind, TimerToken};
pub use errors::{CommError, ConnectionError, FragmentError, Result, SequenceError};
pub use events::{Event, FailureReason};
pub use link::{AttributeId, Link, LinkEvent, TransportControl};
pub use protocol::fragment::Message;
pub use runtime::{CommunicatorHandle, RuntimeBuilder};
pub use types::{ChannelKind, Peer, PeerAddress, Role};
