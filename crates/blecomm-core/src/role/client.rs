//! Initiator role: connects to discovered peers and supervises reconnection.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::CommConfig;
use crate::effects::{Effect, TimerKind, TimerToken};
use crate::events::{Event, FailureReason};
use crate::link::{AttributeId, ACCEPT};
use crate::pending::Ticket;
use crate::protocol::assembler::Reassembly;
use crate::protocol::fragment::{AckToken, Fragment, Message};
use crate::protocol::sequence::is_symbol_text;
use crate::role::Output;
use crate::types::{ChannelKind, Peer, PeerAddress, Role};

// ----------------------------------------------------------------------------
// Client Role
// ----------------------------------------------------------------------------

/// The initiator side of the engine.
///
/// Connection attempts queue up in a FIFO deque and run strictly one at a
/// time: the head's attempt must succeed, fail, or time out before the next
/// peer's begins. Reconnection attempts re-enter the same deque when the lost
/// peer shows up in scan results again.
#[derive(Debug, Default)]
pub struct ClientRole {
    channels: Vec<Channel>,
    pending_connections: VecDeque<Peer>,
    next_channel_id: u64,
}

impl ClientRole {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    fn index_by_address(&self, address: &PeerAddress) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.peer.address() == Some(address))
    }

    fn index_by_peer(&self, peer: &Peer) -> Option<usize> {
        self.channels.iter().position(|c| c.peer.matches(peer))
    }

    fn index_by_timer(&self, token: &TimerToken) -> Option<usize> {
        self.channels.iter().position(|c| c.id == token.channel)
    }

    pub fn owns_address(&self, address: &PeerAddress) -> bool {
        self.index_by_address(address).is_some()
    }

    pub fn has_reconnecting(&self) -> bool {
        self.channels.iter().any(|c| c.peer.is_reconnecting())
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        self.channels
            .iter()
            .filter(|c| c.peer.is_connected())
            .map(|c| c.peer.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.channels.iter().filter(|c| c.peer.is_connected()).count()
    }

    // ------------------------------------------------------------------
    // Connection deque
    // ------------------------------------------------------------------

    /// Queue a connection attempt to a discovered peer.
    pub fn connect(&mut self, peer: Peer) -> Output {
        if self.pending_connections.iter().any(|p| p.matches(&peer)) {
            debug!(peer = %peer.unique_name(), "connection already queued");
            return Output::default();
        }
        self.pending_connections.push_back(peer);
        if self.pending_connections.len() == 1 {
            Output::from_effects(self.start_head())
        } else {
            Output::default()
        }
    }

    /// Open the link for the head of the deque, creating its channel if this
    /// is a fresh attempt rather than a reconnection.
    fn start_head(&mut self) -> Vec<Effect> {
        let Some(peer) = self.pending_connections.front().cloned() else {
            return Vec::new();
        };
        let peer = match self.index_by_peer(&peer) {
            Some(i) => self.channels[i].peer.clone(),
            None => {
                let id = self.next_channel_id;
                self.next_channel_id += 1;
                self.channels.push(Channel::new(id, Role::Client, peer.clone()));
                peer
            }
        };
        vec![Effect::OpenLink { peer }]
    }

    /// Pop the deque head if it is this peer, then start the next attempt.
    fn pop_if_head(&mut self, peer: &Peer) -> Vec<Effect> {
        match self.pending_connections.front() {
            Some(head) if head.matches(peer) => {
                self.pending_connections.pop_front();
                self.start_head()
            }
            _ => Vec::new(),
        }
    }

    /// A scan result matched a reconnecting channel: adopt the (possibly new)
    /// address and queue the reconnection attempt. Returns `None` when no
    /// reconnecting channel matches, in which case the peer is an ordinary
    /// discovery.
    pub fn on_reconnecting_peer_found(&mut self, found: &Peer) -> Option<Output> {
        let i = self.channels.iter().position(|c| {
            c.peer.is_reconnecting()
                && !c.peer.is_requesting_reconnection()
                && !found.unique_name().is_empty()
                && c.peer.unique_name() == found.unique_name()
        })?;
        let channel = &mut self.channels[i];
        channel.peer.set_address(found.address().cloned());
        channel.peer.set_requesting_reconnection(true);
        let peer = channel.peer.clone();
        debug!(peer = %peer.unique_name(), "reconnecting peer found again");

        if self.pending_connections.iter().any(|p| p.matches(&peer)) {
            return Some(Output::default());
        }
        self.pending_connections.push_back(peer);
        let effects = if self.pending_connections.len() == 1 {
            self.start_head()
        } else {
            Vec::new()
        };
        Some(Output::from_effects(effects))
    }

    // ------------------------------------------------------------------
    // Hardware link events
    // ------------------------------------------------------------------

    pub fn handle_hardware_connected(&mut self, address: &PeerAddress, config: &CommConfig) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        let channel = &mut self.channels[i];
        channel.peer.set_hardware_connected(true);
        channel.handshake_sent = false;

        let mut effects = vec![Effect::RefreshDeviceCache { address: address.clone() }];
        if channel.peer.is_reconnecting() {
            // The reconnection timer stays armed until the resume handshake
            // completes; only the attempt flag is consumed here.
            channel.peer.set_requesting_reconnection(false);
        }
        effects.push(channel.arm_timer(
            TimerKind::ConnectionComplete,
            config.connection_complete_timeout,
        ));
        for attribute in AttributeId::NOTIFY_SET {
            effects.push(Effect::Subscribe { address: address.clone(), attribute });
        }
        effects.push(Effect::WriteAttribute {
            address: address.clone(),
            attribute: AttributeId::MtuRequest,
            value: vec![b' '; config.required_mtu()],
        });
        Output::from_effects(effects)
    }

    pub fn handle_hardware_disconnected(&mut self, address: &PeerAddress, config: &CommConfig) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        let mut output = Output::default();
        let channel = &mut self.channels[i];
        channel.peer.set_hardware_connected(false);

        if channel.peer.is_disconnecting() {
            let deliberate = channel.peer.is_connected();
            let peer = channel.peer.clone();
            output.effects.extend(self.remove_channel(i, &mut output.delivered));
            if deliberate {
                output.disconnected.push(peer.clone());
            }
            output.effects.extend(self.pop_if_head(&peer));
        } else if channel.peer.is_fully_connected() {
            // Link loss: keep the channel and try to get the peer back.
            channel.peer.set_reconnecting(true, false);
            output
                .effects
                .push(channel.arm_timer(TimerKind::Reconnection, config.reconnection_timeout));
            output.lost.push(channel.peer.clone());
        } else if channel.peer.is_reconnecting() {
            if channel.peer.is_requesting_reconnection() {
                // The attempt failed before the link came up; wait for the
                // peer to be discovered again while the reconnection timer
                // keeps running.
                channel.peer.set_requesting_reconnection(false);
                let peer = channel.peer.clone();
                output.effects.extend(self.pop_if_head(&peer));
            } else {
                // The link dropped between hardware connect and resume
                // completion; the session cannot be recovered.
                output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
                output.merge(self.stop_reconnection_at(i));
            }
        } else {
            // The attempt never completed.
            let peer = channel.peer.clone();
            output.effects.extend(self.remove_channel(i, &mut output.delivered));
            output.effects.push(Effect::Emit(Event::ConnectionFailed {
                peer: peer.clone(),
                reason: FailureReason::Timeout,
            }));
            output.effects.extend(self.pop_if_head(&peer));
        }
        output
    }

    fn remove_channel(
        &mut self,
        index: usize,
        delivered: &mut Vec<(ChannelKind, Ticket)>,
    ) -> Vec<Effect> {
        let mut channel = self.channels.remove(index);
        let (effects, tickets) = channel.teardown();
        delivered.extend(tickets);
        effects
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn proceed_after_mtu(&mut self, index: usize, identity: &str) -> Vec<Effect> {
        let channel = &mut self.channels[index];
        if channel.handshake_sent {
            return Vec::new();
        }
        let Some(address) = channel.peer.address().cloned() else {
            return Vec::new();
        };
        channel.handshake_sent = true;
        if channel.peer.is_reconnecting() {
            vec![Effect::WriteAttribute {
                address,
                attribute: AttributeId::ConnectionResumedReceive,
                value: b"1".to_vec(),
            }]
        } else {
            vec![Effect::WriteAttribute {
                address,
                attribute: AttributeId::ConnectionRequest,
                value: identity.as_bytes().to_vec(),
            }]
        }
    }

    pub fn handle_mtu_changed(
        &mut self,
        address: &PeerAddress,
        mtu: usize,
        identity: &str,
        config: &CommConfig,
    ) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        if mtu < config.required_mtu() {
            warn!(%address, mtu, required = config.required_mtu(), "proceeding with small MTU");
        }
        Output::from_effects(self.proceed_after_mtu(i, identity))
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn handle_notification(
        &mut self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: &[u8],
        identity: &str,
        config: &CommConfig,
    ) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        match attribute {
            AttributeId::MtuResponse => {
                let granted = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if granted >= config.required_mtu() {
                    Output::from_effects(self.proceed_after_mtu(i, identity))
                } else {
                    Output::from_effects(vec![Effect::RequestMtu {
                        address: address.clone(),
                        mtu: config.required_mtu(),
                    }])
                }
            }
            AttributeId::ConnectionResponse => self.handle_connection_response(i, value),
            AttributeId::ConnectionResumedSend => self.handle_resume_response(i, value, config),
            AttributeId::MessageSend => self.handle_inbound_fragment(i, value, config),
            AttributeId::DataSend => {
                let channel = &mut self.channels[i];
                channel.pause(ChannelKind::Data);
                Output::from_effects(vec![Effect::ReadAttribute {
                    address: address.clone(),
                    attribute: AttributeId::DataSend,
                }])
            }
            AttributeId::NameUpdateSend => {
                if value.is_empty() || !is_symbol_text(value) {
                    warn!(%address, "ignoring out-of-alphabet name update");
                    return Output::default();
                }
                let channel = &mut self.channels[i];
                let previous = channel.peer.clone();
                channel
                    .peer
                    .set_unique_name(String::from_utf8_lossy(value).into_owned());
                Output::from_effects(vec![Effect::Emit(Event::PeerUpdated {
                    previous,
                    current: channel.peer.clone(),
                })])
            }
            AttributeId::DisconnectionSend => {
                // Deliberate disconnect from the remote side.
                let channel = &mut self.channels[i];
                channel.peer.set_disconnecting(true);
                Output::from_effects(vec![Effect::CloseLink { address: address.clone() }])
            }
            _ => Output::default(),
        }
    }

    fn handle_connection_response(&mut self, index: usize, value: &[u8]) -> Output {
        let channel = &mut self.channels[index];
        if channel.peer.is_connected()
            || channel.peer.is_reconnecting()
            || channel.peer.is_disconnecting()
        {
            return Output::default();
        }
        let mut output = Output::default();
        output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
        let peer = {
            if value == ACCEPT {
                channel.peer.set_connected(true);
                let peer = channel.peer.clone();
                output
                    .effects
                    .push(Effect::Emit(Event::ConnectionSuccess(peer.clone(), Role::Client)));
                peer
            } else {
                channel.peer.set_disconnecting(true);
                let peer = channel.peer.clone();
                output.effects.push(Effect::Emit(Event::ConnectionFailed {
                    peer: peer.clone(),
                    reason: FailureReason::Rejected,
                }));
                if let Some(address) = peer.address().cloned() {
                    output.effects.push(Effect::CloseLink { address });
                }
                peer
            }
        };
        output.effects.extend(self.pop_if_head(&peer));
        output
    }

    fn handle_resume_response(&mut self, index: usize, value: &[u8], config: &CommConfig) -> Output {
        let channel = &mut self.channels[index];
        if !channel.peer.is_reconnecting() || channel.peer.is_disconnecting() {
            return Output::default();
        }
        if value == ACCEPT {
            let mut output = Output::default();
            output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
            output.effects.extend(channel.cancel_timer(TimerKind::Reconnection));
            channel.peer.set_reconnecting(false, false);
            let peer = channel.peer.clone();
            output.effects.extend(channel.kick(ChannelKind::Message, config));
            output.effects.extend(channel.kick(ChannelKind::Data, config));
            output.resumed.push(peer.clone());
            output.effects.extend(self.pop_if_head(&peer));
            output
        } else {
            let peer = channel.peer.clone();
            let mut output = self.stop_reconnection_at(index);
            output.effects.insert(
                0,
                Effect::Emit(Event::ConnectionFailed {
                    peer,
                    reason: FailureReason::ResumeRejected,
                }),
            );
            output
        }
    }

    fn handle_inbound_fragment(&mut self, index: usize, value: &[u8], config: &CommConfig) -> Output {
        let channel = &mut self.channels[index];
        let Some(address) = channel.peer.address().cloned() else {
            return Output::default();
        };
        channel.pause(ChannelKind::Message);
        let mut effects = Vec::new();
        match Fragment::decode(value) {
            Ok(fragment) => {
                let ack = fragment.ack_token();
                match channel.reassembler_mut(ChannelKind::Message).accept(fragment) {
                    Reassembly::Complete(payload) => {
                        match Message::from_wire(channel.peer.clone(), &payload) {
                            Ok(message) => effects.push(Effect::Emit(Event::MessageReceived {
                                message,
                                role: Role::Client,
                            })),
                            Err(err) => {
                                warn!(%err, "dropping malformed reassembled message")
                            }
                        }
                    }
                    Reassembly::Incomplete | Reassembly::Duplicate | Reassembly::Stale => {}
                }
                effects.push(Effect::WriteAttribute {
                    address,
                    attribute: AttributeId::ReadResponseMessage,
                    value: ack.encode(),
                });
            }
            Err(err) => warn!(%err, "dropping undecodable fragment"),
        }
        effects.extend(channel.resume(ChannelKind::Message, config));
        Output::from_effects(effects)
    }

    pub fn handle_read_result(
        &mut self,
        address: &PeerAddress,
        attribute: AttributeId,
        ok: bool,
        value: &[u8],
        config: &CommConfig,
    ) -> Output {
        if attribute != AttributeId::DataSend {
            return Output::default();
        }
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        let channel = &mut self.channels[i];
        let mut effects = Vec::new();
        if ok {
            match Fragment::decode(value) {
                Ok(fragment) => {
                    let ack = fragment.ack_token();
                    match channel.reassembler_mut(ChannelKind::Data).accept(fragment) {
                        Reassembly::Complete(payload) => {
                            match Message::from_wire(channel.peer.clone(), &payload) {
                                Ok(message) => effects.push(Effect::Emit(Event::DataReceived {
                                    message,
                                    role: Role::Client,
                                })),
                                Err(err) => warn!(%err, "dropping malformed reassembled data"),
                            }
                        }
                        Reassembly::Incomplete | Reassembly::Duplicate | Reassembly::Stale => {}
                    }
                    effects.push(Effect::WriteAttribute {
                        address: address.clone(),
                        attribute: AttributeId::ReadResponseData,
                        value: ack.encode(),
                    });
                }
                Err(err) => warn!(%err, "dropping undecodable data fragment"),
            }
        }
        effects.extend(channel.resume(ChannelKind::Data, config));
        Output::from_effects(effects)
    }

    // ------------------------------------------------------------------
    // Write results (protocol acks and handshake failures)
    // ------------------------------------------------------------------

    pub fn handle_write_result(
        &mut self,
        address: &PeerAddress,
        attribute: AttributeId,
        ok: bool,
        value: &[u8],
        config: &CommConfig,
    ) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        match attribute {
            AttributeId::MessageReceive => self.handle_fragment_ack(i, ChannelKind::Message, ok, value, config),
            AttributeId::DataReceive => self.handle_fragment_ack(i, ChannelKind::Data, ok, value, config),
            AttributeId::ConnectionRequest if !ok => {
                // The acceptor refused the request at the transport level
                // (busy reconnecting or shutting down).
                let channel = &mut self.channels[i];
                channel.peer.set_disconnecting(true);
                let peer = channel.peer.clone();
                let mut effects = vec![
                    Effect::Emit(Event::ConnectionFailed {
                        peer: peer.clone(),
                        reason: FailureReason::Rejected,
                    }),
                    Effect::CloseLink { address: address.clone() },
                ];
                effects.extend(self.pop_if_head(&peer));
                Output::from_effects(effects)
            }
            AttributeId::ConnectionResumedReceive if !ok => {
                let peer = self.channels[i].peer.clone();
                let mut output = self.stop_reconnection_at(i);
                output.effects.insert(
                    0,
                    Effect::Emit(Event::ConnectionFailed {
                        peer,
                        reason: FailureReason::ResumeRejected,
                    }),
                );
                output
            }
            _ => Output::default(),
        }
    }

    fn handle_fragment_ack(
        &mut self,
        index: usize,
        kind: ChannelKind,
        ok: bool,
        value: &[u8],
        config: &CommConfig,
    ) -> Output {
        let channel = &mut self.channels[index];
        if !ok {
            return Output::from_effects(channel.on_write_failure(kind, config));
        }
        match AckToken::decode(value) {
            Ok(token) => {
                let (outcome, effects) = channel.on_ack(kind, token, config);
                let mut output = Output::from_effects(effects);
                if let crate::pending::AckOutcome::MessageComplete(ticket) = outcome {
                    output.delivered.push((kind, ticket));
                }
                output
            }
            Err(err) => {
                warn!(%err, "undecodable acknowledgement");
                Output::default()
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn handle_timer(&mut self, token: &TimerToken, config: &CommConfig) -> Output {
        let Some(i) = self.index_by_timer(token) else {
            return Output::default();
        };
        if !self.channels[i].accept_timer(token) {
            return Output::default();
        }
        match token.kind {
            TimerKind::ConnectionComplete => {
                if self.channels[i].peer.is_reconnecting() {
                    self.stop_reconnection_at(i)
                } else {
                    let channel = &mut self.channels[i];
                    channel.peer.set_disconnecting(true);
                    let peer = channel.peer.clone();
                    let mut effects = vec![Effect::Emit(Event::ConnectionFailed {
                        peer: peer.clone(),
                        reason: FailureReason::Timeout,
                    })];
                    if let Some(address) = peer.address().cloned() {
                        effects.push(Effect::CloseLink { address });
                    }
                    effects.extend(self.pop_if_head(&peer));
                    Output::from_effects(effects)
                }
            }
            TimerKind::Reconnection => self.stop_reconnection_at(i),
            TimerKind::MessageAck => {
                Output::from_effects(self.channels[i].on_ack_timeout(ChannelKind::Message, config))
            }
            TimerKind::DataAck => {
                Output::from_effects(self.channels[i].on_ack_timeout(ChannelKind::Data, config))
            }
        }
    }

    // ------------------------------------------------------------------
    // Reconnection teardown
    // ------------------------------------------------------------------

    /// Give up reconnecting: the peer is gone for good.
    fn stop_reconnection_at(&mut self, index: usize) -> Output {
        let mut output = Output::default();
        let channel = &mut self.channels[index];
        channel.peer.set_reconnecting(false, false);
        channel.peer.set_disconnecting(true);
        let peer = channel.peer.clone();
        debug!(peer = %peer.unique_name(), "giving up reconnection");
        if channel.peer.is_hardware_connected() {
            // Finalized when the hardware disconnect arrives.
            if let Some(address) = peer.address().cloned() {
                output.effects.push(Effect::CloseLink { address });
            }
        } else {
            output.effects.extend(self.remove_channel(index, &mut output.delivered));
            output.disconnected.push(peer.clone());
            output.effects.extend(self.pop_if_head(&peer));
        }
        output
    }

    /// Give up reconnecting a specific peer (application request).
    pub fn stop_reconnection(&mut self, peer: &Peer) -> Option<Output> {
        let i = self.index_by_peer(peer)?;
        if !self.channels[i].peer.is_reconnecting() {
            return None;
        }
        Some(self.stop_reconnection_at(i))
    }

    // ------------------------------------------------------------------
    // Outbound messages, name updates, disconnects
    // ------------------------------------------------------------------

    /// Queue a message on every matching connected channel. Returns how many
    /// channels took a share of the ticket.
    pub fn send_message(
        &mut self,
        kind: ChannelKind,
        message: &Message,
        ticket: Ticket,
        config: &CommConfig,
    ) -> (usize, Vec<Effect>) {
        let wire = message.wire_payload();
        let mut count = 0;
        let mut effects = Vec::new();
        for channel in &mut self.channels {
            if !channel.peer.is_connected() || channel.peer.is_disconnecting() {
                continue;
            }
            if let Some(receiver) = &message.receiver {
                if !channel.peer.matches(receiver) {
                    continue;
                }
            }
            effects.extend(channel.enqueue(kind, &wire, ticket, config));
            count += 1;
        }
        (count, effects)
    }

    /// Tell every fully connected peer about our new unique name.
    pub fn broadcast_name_update(&mut self, unique_name: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        for channel in &self.channels {
            if !channel.peer.is_fully_connected() {
                continue;
            }
            if let Some(address) = channel.peer.address().cloned() {
                effects.push(Effect::WriteAttribute {
                    address,
                    attribute: AttributeId::NameUpdateReceive,
                    value: unique_name.as_bytes().to_vec(),
                });
            }
        }
        effects
    }

    /// Deliberately disconnect one peer. `None` when this role has no channel
    /// for it.
    pub fn disconnect(&mut self, peer: &Peer) -> Option<Output> {
        let i = self.index_by_peer(peer)?;
        let mut output = Output::default();
        let channel = &mut self.channels[i];
        channel.peer.set_disconnecting(true);
        let Some(address) = channel.peer.address().cloned() else {
            let peer = channel.peer.clone();
            output.effects.extend(self.remove_channel(i, &mut output.delivered));
            output.disconnected.push(peer);
            return Some(output);
        };
        if channel.peer.is_hardware_connected() {
            if channel.peer.is_fully_connected() {
                output.effects.push(Effect::WriteAttribute {
                    address: address.clone(),
                    attribute: AttributeId::DisconnectionReceive,
                    value: b"1".to_vec(),
                });
            }
            output.effects.push(Effect::CloseLink { address });
        } else {
            let peer = channel.peer.clone();
            output.effects.extend(self.remove_channel(i, &mut output.delivered));
            output.disconnected.push(peer);
        }
        Some(output)
    }

    /// Tear everything down.
    pub fn destroy(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        for channel in &mut self.channels {
            let (cancel, _) = channel.teardown();
            effects.extend(cancel);
            if channel.peer.is_hardware_connected() {
                if let Some(address) = channel.peer.address().cloned() {
                    effects.push(Effect::CloseLink { address });
                }
            }
        }
        self.channels.clear();
        self.pending_connections.clear();
        effects
    }
}
