//! Error types for the communication engine.

use crate::types::ChannelKind;

// ----------------------------------------------------------------------------
// Layered Error Types
// ----------------------------------------------------------------------------

/// Errors from sequence number encoding and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("Symbol {0:#04x} is outside the supported alphabet")]
    UnsupportedSymbol(u8),

    #[error("Expected {expected} symbols, got {actual}")]
    WrongWidth { expected: usize, actual: usize },
}

/// Errors from the fragment wire codec and reassembly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("Fragment too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown fragment kind symbol {0:#04x}")]
    UnknownKind(u8),

    #[error("Malformed fragment: {0}")]
    Malformed(String),

    #[error("Duplicate fragment for completed message")]
    Duplicate,

    #[error("Empty payload")]
    EmptyPayload,

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

/// Errors from connection management.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection rejected by remote peer")]
    Rejected,

    #[error("Connection timed out")]
    Timeout,

    #[error("No pending connection request for this peer")]
    NoPendingRequest,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Transport write failed on {kind:?} pipe")]
    WriteFailure { kind: ChannelKind },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Top-level error type for the communication engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    #[error("Already started")]
    AlreadyStarted,

    #[error("Already stopped")]
    AlreadyStopped,

    #[error("Transport not supported on this platform")]
    UnsupportedTransport,

    #[error("Engine not started")]
    NotReady,

    #[error("Engine shut down")]
    Destroyed,

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Fragment error: {0}")]
    Fragment(#[from] FragmentError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl CommError {
    /// Create a malformed fragment error.
    pub fn malformed_fragment(msg: impl Into<String>) -> Self {
        CommError::Fragment(FragmentError::Malformed(msg.into()))
    }

    /// Create a transport write failure error.
    pub fn write_failure(kind: ChannelKind) -> Self {
        CommError::Connection(ConnectionError::WriteFailure { kind })
    }
}

pub type Result<T> = core::result::Result<T, CommError>;
