//! Engine configuration.

use std::time::Duration;

use crate::protocol::fragment::HEADER_LEN;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the communication engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommConfig {
    /// Display name broadcast to nearby peers. Restricted to the supported
    /// symbol alphabet, at most 18 symbols.
    pub name: String,
    /// Maximum payload bytes per wire fragment (excluding the 8 byte header).
    pub fragment_payload_size: usize,
    /// Maximum time between hardware connect and full connection.
    pub connection_complete_timeout: Duration,
    /// Maximum time a lost link may spend reconnecting before the peer is
    /// declared disconnected.
    pub reconnection_timeout: Duration,
    /// Maximum time to wait for the acknowledgement of an in-flight fragment
    /// before retrying it.
    pub ack_timeout: Duration,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            name: "blecomm".to_string(),
            fragment_payload_size: 504,
            connection_complete_timeout: Duration::from_secs(5),
            reconnection_timeout: Duration::from_secs(50),
            ack_timeout: Duration::from_secs(2),
        }
    }
}

impl CommConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Minimum attribute payload size the link must support.
    pub fn required_mtu(&self) -> usize {
        self.fragment_payload_size + HEADER_LEN
    }

    /// Set the maximum fragment payload size.
    pub fn with_fragment_payload_size(mut self, size: usize) -> Self {
        self.fragment_payload_size = size;
        self
    }

    /// Set the connection completion timeout.
    pub fn with_connection_complete_timeout(mut self, timeout: Duration) -> Self {
        self.connection_complete_timeout = timeout;
        self
    }

    /// Set the reconnection timeout.
    pub fn with_reconnection_timeout(mut self, timeout: Duration) -> Self {
        self.reconnection_timeout = timeout;
        self
    }

    /// Set the fragment acknowledgement timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}
