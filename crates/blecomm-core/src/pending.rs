//! Per-channel outbound queues with a single in-flight fragment.

use std::collections::VecDeque;

use tracing::trace;

use crate::protocol::fragment::{AckToken, Fragment};

// ----------------------------------------------------------------------------
// Tickets
// ----------------------------------------------------------------------------

/// Completion handle for one queued message on one channel. The facade uses
/// tickets to count fan-out deliveries across channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(pub u64);

// ----------------------------------------------------------------------------
// Pending Queue
// ----------------------------------------------------------------------------

/// A message queued for sending: its remaining fragments and its ticket.
#[derive(Debug)]
pub struct OutboundMessage {
    ticket: Ticket,
    fragments: VecDeque<Fragment>,
}

impl OutboundMessage {
    pub fn new(ticket: Ticket, fragments: Vec<Fragment>) -> Self {
        Self { ticket, fragments: fragments.into() }
    }
}

/// Result of matching an acknowledgement against the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Token did not match the in-flight fragment; nothing changed.
    Ignored,
    /// Fragment confirmed, more fragments of the same message remain.
    SendNext,
    /// The final fragment was confirmed; the message is fully delivered.
    MessageComplete(Ticket),
}

/// FIFO of outbound messages for one pipe of one channel.
///
/// At most one fragment is in flight; the next goes out only once the
/// previous one's acknowledgement (matching id and sequence number) arrives.
/// Pausing gates dispatch without disturbing in-flight bookkeeping.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<OutboundMessage>,
    paused: bool,
    in_flight: bool,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.queue.push_back(message);
    }

    /// Take the next fragment to send, marking it in flight. Returns `None`
    /// while paused, while a fragment is already in flight, or when empty.
    pub fn next_to_send(&mut self) -> Option<Fragment> {
        if self.paused || self.in_flight {
            return None;
        }
        let fragment = self.queue.front()?.fragments.front()?.clone();
        self.in_flight = true;
        Some(fragment)
    }

    /// The in-flight fragment, for retransmission. `None` while paused.
    pub fn retry(&self) -> Option<Fragment> {
        if self.paused || !self.in_flight {
            return None;
        }
        self.queue.front()?.fragments.front().cloned()
    }

    /// The in-flight fragment regardless of pause state, for serving reads.
    pub fn in_flight_fragment(&self) -> Option<&Fragment> {
        if !self.in_flight {
            return None;
        }
        self.queue.front()?.fragments.front()
    }

    /// Match an acknowledgement against the in-flight fragment.
    pub fn on_ack(&mut self, token: AckToken) -> AckOutcome {
        if !self.in_flight {
            return AckOutcome::Ignored;
        }
        let matches = self
            .queue
            .front()
            .and_then(|m| m.fragments.front())
            .map(|f| f.ack_token() == token)
            .unwrap_or(false);
        if !matches {
            trace!(?token, "unmatched acknowledgement ignored");
            return AckOutcome::Ignored;
        }
        self.in_flight = false;
        if let Some(message) = self.queue.front_mut() {
            message.fragments.pop_front();
            if message.fragments.is_empty() {
                let ticket = message.ticket;
                self.queue.pop_front();
                return AckOutcome::MessageComplete(ticket);
            }
        }
        AckOutcome::SendNext
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything, returning the tickets of all queued messages so the
    /// caller can settle their fan-out accounting.
    pub fn clear(&mut self) -> Vec<Ticket> {
        self.paused = false;
        self.in_flight = false;
        self.queue.drain(..).map(|m| m.ticket).collect()
    }
}
