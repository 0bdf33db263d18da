//! Per-peer channel: lifecycle flags, outbound queues, reassembly, timers.
//!
//! A channel exists from the moment a hardware link is associated with a peer
//! until the peer is gone for good. The connection roles drive it; the channel
//! itself owns the mechanics shared by both: fragment dispatch with one
//! in-flight fragment per pipe, acknowledgement matching, retries, and the
//! four generation-counted timers.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::CommConfig;
use crate::effects::{Effect, TimerKind, TimerToken};
use crate::link::AttributeId;
use crate::pending::{AckOutcome, OutboundMessage, PendingQueue, Ticket};
use crate::protocol::assembler::Reassembler;
use crate::protocol::fragment::{split_payload, AckToken, Fragment};
use crate::protocol::sequence::MessageId;
use crate::types::{ChannelKind, Peer, Role};

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

const TIMER_KINDS: [TimerKind; 4] = [
    TimerKind::ConnectionComplete,
    TimerKind::Reconnection,
    TimerKind::MessageAck,
    TimerKind::DataAck,
];

#[derive(Debug, Default, Clone, Copy)]
struct TimerSlot {
    generation: u64,
    armed: bool,
}

/// The four cancellable timers of a channel.
///
/// Arming or cancelling bumps the slot generation, so a fire that raced a
/// cancellation arrives with a stale token and is rejected by [`TimerSet::accept`].
#[derive(Debug, Default)]
struct TimerSet {
    slots: [TimerSlot; 4],
}

impl TimerSet {
    fn slot_index(kind: TimerKind) -> usize {
        TIMER_KINDS.iter().position(|&k| k == kind).unwrap_or(0)
    }

    fn arm(&mut self, role: Role, channel: u64, kind: TimerKind, duration: Duration) -> Effect {
        let slot = &mut self.slots[Self::slot_index(kind)];
        slot.generation += 1;
        slot.armed = true;
        Effect::StartTimer {
            token: TimerToken { role, channel, kind, generation: slot.generation },
            duration,
        }
    }

    /// Cancel is idempotent: cancelling a disarmed timer does nothing.
    fn cancel(&mut self, role: Role, channel: u64, kind: TimerKind) -> Option<Effect> {
        let slot = &mut self.slots[Self::slot_index(kind)];
        if !slot.armed {
            return None;
        }
        let token = TimerToken { role, channel, kind, generation: slot.generation };
        slot.generation += 1;
        slot.armed = false;
        Some(Effect::CancelTimer { token })
    }

    /// True when the token belongs to the current arming; disarms the slot.
    fn accept(&mut self, token: &TimerToken) -> bool {
        let slot = &mut self.slots[Self::slot_index(token.kind)];
        if slot.armed && slot.generation == token.generation {
            slot.armed = false;
            true
        } else {
            false
        }
    }
}

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

/// What an acceptor-side confirmed control notification was for, so its
/// delivery confirmation can be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPurpose {
    ConnectAccept,
    ConnectReject,
    ResumeAccept,
    ResumeReject,
    Disconnect,
}

/// Per-peer connection state shared by both roles.
#[derive(Debug)]
pub struct Channel {
    pub id: u64,
    pub role: Role,
    pub peer: Peer,
    /// Purpose of the control notification currently awaiting confirmation
    /// (acceptor side only).
    pub awaiting_notify: Option<NotifyPurpose>,
    /// Whether the connection request or resume request already went out for
    /// the current hardware session (initiator side only).
    pub handshake_sent: bool,
    messages: PendingQueue,
    data: PendingQueue,
    rx_messages: Reassembler,
    rx_data: Reassembler,
    next_message_id: MessageId,
    timers: TimerSet,
}

impl Channel {
    pub fn new(id: u64, role: Role, peer: Peer) -> Self {
        Self {
            id,
            role,
            peer,
            awaiting_notify: None,
            handshake_sent: false,
            messages: PendingQueue::new(),
            data: PendingQueue::new(),
            rx_messages: Reassembler::new(),
            rx_data: Reassembler::new(),
            next_message_id: MessageId::zero(),
            timers: TimerSet::default(),
        }
    }

    fn queue_mut(&mut self, kind: ChannelKind) -> &mut PendingQueue {
        match kind {
            ChannelKind::Message => &mut self.messages,
            ChannelKind::Data => &mut self.data,
        }
    }

    fn queue(&self, kind: ChannelKind) -> &PendingQueue {
        match kind {
            ChannelKind::Message => &self.messages,
            ChannelKind::Data => &self.data,
        }
    }

    pub fn reassembler_mut(&mut self, kind: ChannelKind) -> &mut Reassembler {
        match kind {
            ChannelKind::Message => &mut self.rx_messages,
            ChannelKind::Data => &mut self.rx_data,
        }
    }

    fn ack_timer(kind: ChannelKind) -> TimerKind {
        match kind {
            ChannelKind::Message => TimerKind::MessageAck,
            ChannelKind::Data => TimerKind::DataAck,
        }
    }

    // ------------------------------------------------------------------
    // Outbound dispatch
    // ------------------------------------------------------------------

    /// Queue a wire payload for sending and dispatch it if the pipe is idle.
    pub fn enqueue(
        &mut self,
        kind: ChannelKind,
        wire_payload: &[u8],
        ticket: Ticket,
        config: &CommConfig,
    ) -> Vec<Effect> {
        let id = self.next_message_id;
        self.next_message_id.increment();
        match split_payload(id, wire_payload, config.fragment_payload_size) {
            Ok(fragments) => {
                self.queue_mut(kind)
                    .enqueue(OutboundMessage::new(ticket, fragments));
                self.kick(kind, config)
            }
            Err(err) => {
                warn!(peer = %self.peer.unique_name(), ?kind, %err, "dropping unsendable payload");
                Vec::new()
            }
        }
    }

    /// Dispatch the next fragment if the pipe allows it. Arms the ack timer.
    pub fn kick(&mut self, kind: ChannelKind, config: &CommConfig) -> Vec<Effect> {
        if !self.peer.is_fully_connected() {
            return Vec::new();
        }
        let fragment = if self.queue(kind).is_in_flight() {
            self.queue(kind).retry()
        } else {
            self.queue_mut(kind).next_to_send()
        };
        match fragment {
            Some(fragment) => self.dispatch(kind, fragment, config),
            None => Vec::new(),
        }
    }

    fn dispatch(&mut self, kind: ChannelKind, fragment: Fragment, config: &CommConfig) -> Vec<Effect> {
        let Some(address) = self.peer.address().cloned() else {
            warn!(peer = %self.peer.unique_name(), "no address to dispatch to");
            return Vec::new();
        };
        let send = match (self.role, kind) {
            (Role::Client, ChannelKind::Message) => Effect::WriteAttribute {
                address,
                attribute: AttributeId::MessageReceive,
                value: fragment.encode(),
            },
            (Role::Client, ChannelKind::Data) => Effect::WriteAttribute {
                address,
                attribute: AttributeId::DataReceive,
                value: fragment.encode(),
            },
            (Role::Server, ChannelKind::Message) => Effect::NotifyAttribute {
                address,
                attribute: AttributeId::MessageSend,
                value: fragment.encode(),
                confirm: true,
            },
            // Data travels acceptor-to-initiator by poke and read: the
            // notification only signals that a fragment is ready on the
            // data attribute.
            (Role::Server, ChannelKind::Data) => Effect::NotifyAttribute {
                address,
                attribute: AttributeId::DataSend,
                value: b"1".to_vec(),
                confirm: true,
            },
        };
        let timer = self.arm_timer(Self::ack_timer(kind), config.ack_timeout);
        vec![send, timer]
    }

    /// The fragment currently being served on the data attribute.
    pub fn in_flight_fragment(&self, kind: ChannelKind) -> Option<&Fragment> {
        self.queue(kind).in_flight_fragment()
    }

    /// Process a protocol acknowledgement for this pipe.
    pub fn on_ack(
        &mut self,
        kind: ChannelKind,
        token: AckToken,
        config: &CommConfig,
    ) -> (AckOutcome, Vec<Effect>) {
        let outcome = self.queue_mut(kind).on_ack(token);
        let mut effects = Vec::new();
        match outcome {
            AckOutcome::Ignored => {}
            AckOutcome::SendNext | AckOutcome::MessageComplete(_) => {
                effects.extend(self.cancel_timer(Self::ack_timer(kind)));
                effects.extend(self.kick(kind, config));
            }
        }
        (outcome, effects)
    }

    /// Retry the in-flight fragment after an ack timeout.
    pub fn on_ack_timeout(&mut self, kind: ChannelKind, config: &CommConfig) -> Vec<Effect> {
        debug!(peer = %self.peer.unique_name(), ?kind, "ack timeout, retrying fragment");
        match self.queue(kind).retry() {
            Some(fragment) => self.dispatch(kind, fragment, config),
            None => Vec::new(),
        }
    }

    /// Retry immediately after a transport write failure.
    pub fn on_write_failure(&mut self, kind: ChannelKind, config: &CommConfig) -> Vec<Effect> {
        debug!(peer = %self.peer.unique_name(), ?kind, "write failed, retrying fragment");
        let mut effects = Vec::new();
        effects.extend(self.cancel_timer(Self::ack_timer(kind)));
        if let Some(fragment) = self.queue(kind).retry() {
            effects.extend(self.dispatch(kind, fragment, config));
        }
        effects
    }

    pub fn pause(&mut self, kind: ChannelKind) {
        self.queue_mut(kind).pause();
    }

    /// Resume a paused pipe and re-dispatch whatever is due.
    pub fn resume(&mut self, kind: ChannelKind, config: &CommConfig) -> Vec<Effect> {
        self.queue_mut(kind).resume();
        self.kick(kind, config)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn arm_timer(&mut self, kind: TimerKind, duration: Duration) -> Effect {
        self.timers.arm(self.role, self.id, kind, duration)
    }

    pub fn cancel_timer(&mut self, kind: TimerKind) -> Option<Effect> {
        self.timers.cancel(self.role, self.id, kind)
    }

    /// Accept a fired timer if its token is current.
    pub fn accept_timer(&mut self, token: &TimerToken) -> bool {
        self.timers.accept(token)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Cancel every timer and drop all queued traffic. Returns the cancel
    /// effects and the tickets whose fan-out share must be settled.
    pub fn teardown(&mut self) -> (Vec<Effect>, Vec<(ChannelKind, Ticket)>) {
        let mut effects = Vec::new();
        for kind in TIMER_KINDS {
            effects.extend(self.cancel_timer(kind));
        }
        let mut tickets: Vec<(ChannelKind, Ticket)> = self
            .messages
            .clear()
            .into_iter()
            .map(|t| (ChannelKind::Message, t))
            .collect();
        tickets.extend(self.data.clear().into_iter().map(|t| (ChannelKind::Data, t)));
        self.rx_messages.clear();
        self.rx_data.clear();
        (effects, tickets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerAddress;

    fn connected_channel(role: Role) -> Channel {
        let mut peer = Peer::new("aliceXY", Some(PeerAddress::from("00:11")));
        peer.set_hardware_connected(true);
        peer.set_connected(true);
        Channel::new(1, role, peer)
    }

    fn config() -> CommConfig {
        CommConfig::default().with_fragment_payload_size(4)
    }

    fn sent_fragment(effects: &[Effect]) -> Fragment {
        for effect in effects {
            match effect {
                Effect::WriteAttribute { value, .. } | Effect::NotifyAttribute { value, .. } => {
                    return Fragment::decode(value).unwrap();
                }
                _ => {}
            }
        }
        panic!("no outbound fragment in {effects:?}");
    }

    #[test]
    fn enqueue_dispatches_write_and_arms_ack_timer() {
        let mut ch = connected_channel(Role::Client);
        let effects = ch.enqueue(ChannelKind::Message, b"m hello", Ticket(1), &config());
        assert!(matches!(
            effects[0],
            Effect::WriteAttribute { attribute: AttributeId::MessageReceive, .. }
        ));
        assert!(matches!(
            effects[1],
            Effect::StartTimer { token: TimerToken { kind: TimerKind::MessageAck, .. }, .. }
        ));
    }

    #[test]
    fn dispatch_gated_while_not_fully_connected() {
        let mut ch = connected_channel(Role::Client);
        ch.peer.set_reconnecting(true, false);
        let effects = ch.enqueue(ChannelKind::Message, b"m hello", Ticket(1), &config());
        assert!(effects.is_empty());

        // Resuming the connection releases the queue.
        ch.peer.set_reconnecting(false, false);
        let effects = ch.kick(ChannelKind::Message, &config());
        assert!(!effects.is_empty());
    }

    #[test]
    fn acks_walk_through_all_fragments() {
        let mut ch = connected_channel(Role::Client);
        let cfg = config();
        let effects = ch.enqueue(ChannelKind::Message, b"m 123456789", Ticket(9), &cfg);

        let mut fragment = sent_fragment(&effects);
        loop {
            let (outcome, effects) = ch.on_ack(ChannelKind::Message, fragment.ack_token(), &cfg);
            match outcome {
                AckOutcome::SendNext => fragment = sent_fragment(&effects),
                AckOutcome::MessageComplete(ticket) => {
                    assert_eq!(ticket, Ticket(9));
                    break;
                }
                AckOutcome::Ignored => panic!("ack should match"),
            }
        }
    }

    #[test]
    fn server_data_pipe_pokes_instead_of_pushing_payload() {
        let mut ch = connected_channel(Role::Server);
        let effects = ch.enqueue(ChannelKind::Data, b"d payload", Ticket(1), &config());
        match &effects[0] {
            Effect::NotifyAttribute { attribute, value, confirm, .. } => {
                assert_eq!(*attribute, AttributeId::DataSend);
                assert_eq!(value, b"1");
                assert!(*confirm);
            }
            other => panic!("expected poke notification, got {other:?}"),
        }
        assert!(ch.in_flight_fragment(ChannelKind::Data).is_some());
    }

    #[test]
    fn stale_timer_token_is_rejected() {
        let mut ch = connected_channel(Role::Client);
        let armed = ch.arm_timer(TimerKind::ConnectionComplete, Duration::from_secs(1));
        let Effect::StartTimer { token, .. } = armed else { panic!() };

        ch.cancel_timer(TimerKind::ConnectionComplete);
        assert!(!ch.accept_timer(&token), "cancelled arming must not fire");

        let rearmed = ch.arm_timer(TimerKind::ConnectionComplete, Duration::from_secs(1));
        let Effect::StartTimer { token: fresh, .. } = rearmed else { panic!() };
        assert!(!ch.accept_timer(&token), "old token stays dead after re-arm");
        assert!(ch.accept_timer(&fresh));
        assert!(!ch.accept_timer(&fresh), "a token fires at most once");
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut ch = connected_channel(Role::Client);
        ch.arm_timer(TimerKind::Reconnection, Duration::from_secs(1));
        assert!(ch.cancel_timer(TimerKind::Reconnection).is_some());
        assert!(ch.cancel_timer(TimerKind::Reconnection).is_none());
    }

    #[test]
    fn ack_timeout_resends_same_fragment() {
        let mut ch = connected_channel(Role::Client);
        let cfg = config();
        let effects = ch.enqueue(ChannelKind::Message, b"m abcdefgh", Ticket(1), &cfg);
        let first = sent_fragment(&effects);

        let retry = ch.on_ack_timeout(ChannelKind::Message, &cfg);
        assert_eq!(sent_fragment(&retry), first);
    }

    #[test]
    fn teardown_cancels_timers_and_returns_tickets() {
        let mut ch = connected_channel(Role::Client);
        let cfg = config();
        ch.arm_timer(TimerKind::Reconnection, Duration::from_secs(1));
        ch.enqueue(ChannelKind::Message, b"m abc", Ticket(3), &cfg);
        ch.enqueue(ChannelKind::Data, b"d def", Ticket(4), &cfg);

        let (effects, tickets) = ch.teardown();
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::CancelTimer { token } if token.kind == TimerKind::Reconnection)));
        assert_eq!(
            tickets,
            vec![(ChannelKind::Message, Ticket(3)), (ChannelKind::Data, Ticket(4))]
        );
    }
}
