//! Core types: peer identity, lifecycle flags, roles.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Number of random symbols appended to a display name to form a unique name.
pub const UNIQUE_SUFFIX_LEN: usize = 2;

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Opaque transport address of a peer (for BLE, the device MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ----------------------------------------------------------------------------
// Roles and Pipes
// ----------------------------------------------------------------------------

/// Which end of a connection this side plays for a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Initiator: discovers peers and requests connections.
    Client,
    /// Acceptor: broadcasts its presence and accepts or rejects requests.
    Server,
}

/// The two independent outbound pipes of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Small text-style messages.
    Message,
    /// Bulk binary data.
    Data,
}

// ----------------------------------------------------------------------------
// Peer
// ----------------------------------------------------------------------------

/// A remote peer and its connection lifecycle flags.
///
/// The unique name is the display name plus a short random suffix; it stays
/// stable when the transport address changes across reconnections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    unique_name: String,
    address: Option<PeerAddress>,
    hardware_connected: bool,
    connected: bool,
    reconnecting: bool,
    requesting_reconnection: bool,
    disconnecting: bool,
}

impl Peer {
    pub fn new(unique_name: impl Into<String>, address: Option<PeerAddress>) -> Self {
        Self {
            unique_name: unique_name.into(),
            address,
            hardware_connected: false,
            connected: false,
            reconnecting: false,
            requesting_reconnection: false,
            disconnecting: false,
        }
    }

    /// A peer known only by its transport address, before it has introduced
    /// itself with a connection request.
    pub fn from_address(address: PeerAddress) -> Self {
        Self::new(String::new(), Some(address))
    }

    /// Display name: the unique name with the random suffix stripped.
    pub fn name(&self) -> &str {
        let n = self.unique_name.len();
        if n >= UNIQUE_SUFFIX_LEN {
            // Names are alphabet symbols in practice, but an unvalidated one
            // must not panic on a char boundary.
            self.unique_name
                .get(..n - UNIQUE_SUFFIX_LEN)
                .unwrap_or(&self.unique_name)
        } else {
            &self.unique_name
        }
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn set_unique_name(&mut self, unique_name: impl Into<String>) {
        self.unique_name = unique_name.into();
    }

    pub fn address(&self) -> Option<&PeerAddress> {
        self.address.as_ref()
    }

    pub fn set_address(&mut self, address: Option<PeerAddress>) {
        self.address = address;
    }

    /// Canonical identity rule: compare by address when both sides carry one,
    /// otherwise by unique name.
    pub fn matches(&self, other: &Peer) -> bool {
        match (&self.address, &other.address) {
            (Some(a), Some(b)) => a == b,
            _ => {
                !self.unique_name.is_empty() && self.unique_name == other.unique_name
            }
        }
    }

    pub fn is_hardware_connected(&self) -> bool {
        self.hardware_connected
    }

    pub fn set_hardware_connected(&mut self, value: bool) {
        self.hardware_connected = value;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, value: bool) {
        self.connected = value;
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn set_reconnecting(&mut self, reconnecting: bool, requesting: bool) {
        self.reconnecting = reconnecting;
        self.requesting_reconnection = requesting;
    }

    pub fn is_requesting_reconnection(&self) -> bool {
        self.requesting_reconnection
    }

    pub fn set_requesting_reconnection(&mut self, value: bool) {
        self.requesting_reconnection = value;
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    pub fn set_disconnecting(&mut self, value: bool) {
        self.disconnecting = value;
    }

    /// Connected and not in the middle of a reconnection. Gates all traffic.
    pub fn is_fully_connected(&self) -> bool {
        self.connected && !self.reconnecting
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_strips_unique_suffix() {
        let peer = Peer::new("aliceXY", None);
        assert_eq!(peer.name(), "alice");
        assert_eq!(peer.unique_name(), "aliceXY");
    }

    #[test]
    fn name_survives_multibyte_unique_names() {
        // The suffix boundary falls inside the two-byte character.
        let peer = Peer::new("\u{e9}a", None);
        assert_eq!(peer.name(), "\u{e9}a");
    }

    #[test]
    fn identity_prefers_address() {
        let a = Peer::new("aliceXY", Some(PeerAddress::from("00:11")));
        let mut b = Peer::new("aliceXY", Some(PeerAddress::from("22:33")));
        assert!(!a.matches(&b));

        // Same peer rediscovered at a new address still matches by name once
        // one side lacks an address.
        b.set_address(None);
        assert!(a.matches(&b));
    }

    #[test]
    fn nameless_peers_never_match_by_name() {
        let a = Peer::from_address(PeerAddress::from("00:11"));
        let b = Peer::new(String::new(), None);
        assert!(!a.matches(&b));
    }

    #[test]
    fn fully_connected_requires_not_reconnecting() {
        let mut peer = Peer::new("bobZZ", None);
        peer.set_connected(true);
        assert!(peer.is_fully_connected());
        peer.set_reconnecting(true, false);
        assert!(!peer.is_fully_connected());
        peer.set_reconnecting(false, true);
        assert!(peer.is_fully_connected());
    }
}
