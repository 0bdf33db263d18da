//! Connection supervision roles.
//!
//! Every engine plays both roles at once: [`ClientRole`] initiates
//! connections to discovered peers, [`ServerRole`] accepts or rejects
//! incoming ones. Each role owns its channels; the facade routes link events
//! to the right role and merges their outputs.

pub mod client;
pub mod server;

pub use client::ClientRole;
pub use server::ServerRole;

use crate::effects::Effect;
use crate::pending::Ticket;
use crate::types::{ChannelKind, Peer};

/// Byproducts of handling one input inside a role.
///
/// Effects go straight to the driver; the other fields need facade-level
/// bookkeeping (fan-out accounting, peers-left counting, broadcast and scan
/// supervision) before they turn into effects and events of their own.
#[derive(Debug, Default)]
pub struct Output {
    pub effects: Vec<Effect>,
    /// Message tickets whose share of the fan-out is settled.
    pub delivered: Vec<(ChannelKind, Ticket)>,
    /// Peers whose link just dropped and entered reconnection.
    pub lost: Vec<Peer>,
    /// Peers whose connection just resumed.
    pub resumed: Vec<Peer>,
    /// Peers that are gone for good.
    pub disconnected: Vec<Peer>,
}

impl Output {
    pub fn from_effects(effects: Vec<Effect>) -> Self {
        Self { effects, ..Self::default() }
    }

    pub fn merge(&mut self, other: Output) {
        self.effects.extend(other.effects);
        self.delivered.extend(other.delivered);
        self.lost.extend(other.lost);
        self.resumed.extend(other.resumed);
        self.disconnected.extend(other.disconnected);
    }
}
