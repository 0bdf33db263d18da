//! Acceptor role: fields incoming connections, accepts or rejects them.

use tracing::{debug, warn};

use crate::channel::{Channel, NotifyPurpose};
use crate::config::CommConfig;
use crate::effects::{Effect, TimerKind, TimerToken};
use crate::errors::{ConnectionError, Result};
use crate::events::Event;
use crate::link::{AttributeId, ACCEPT, REJECT};
use crate::pending::Ticket;
use crate::protocol::assembler::Reassembly;
use crate::protocol::fragment::{AckToken, Fragment, Message};
use crate::protocol::sequence::is_symbol_text;
use crate::role::Output;
use crate::types::{ChannelKind, Peer, PeerAddress, Role};

// ----------------------------------------------------------------------------
// Server Role
// ----------------------------------------------------------------------------

/// The acceptor side of the engine.
///
/// Channels are created optimistically: any hardware connect not claimed by
/// the client role gets one immediately, before knowing who is on the other
/// end. The peer introduces itself with a connection request; until the
/// application accepts, the channel is undecided and disappears silently if
/// the link drops.
#[derive(Debug, Default)]
pub struct ServerRole {
    channels: Vec<Channel>,
    next_channel_id: u64,
}

impl ServerRole {
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
    // Hardware link events
    // ------------------------------------------------------------------

    pub fn handle_hardware_connected(&mut self, address: &PeerAddress, config: &CommConfig) -> Output {
        let mut effects = Vec::new();
        match self.index_by_address(address) {
            Some(i) => {
                // A known peer's link came back, presumably to resume. The
                // reconnection timer stays armed until the resume completes.
                let channel = &mut self.channels[i];
                channel.peer.set_hardware_connected(true);
                effects.push(channel.arm_timer(
                    TimerKind::ConnectionComplete,
                    config.connection_complete_timeout,
                ));
            }
            None => {
                let id = self.next_channel_id;
                self.next_channel_id += 1;
                let mut peer = Peer::from_address(address.clone());
                peer.set_hardware_connected(true);
                let mut channel = Channel::new(id, Role::Server, peer);
                effects.push(channel.arm_timer(
                    TimerKind::ConnectionComplete,
                    config.connection_complete_timeout,
                ));
                self.channels.push(channel);
                debug!(%address, "optimistic channel created");
            }
        }
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
                output.disconnected.push(peer);
            }
        } else if channel.peer.is_fully_connected() {
            channel.peer.set_reconnecting(true, false);
            output
                .effects
                .push(channel.arm_timer(TimerKind::Reconnection, config.reconnection_timeout));
            output.lost.push(channel.peer.clone());
        } else if channel.peer.is_reconnecting() {
            // The link dropped again before the resume completed; the session
            // cannot be recovered.
            output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
            output.merge(self.stop_reconnection_at(i));
        } else {
            // Undecided optimistic channel: vanish without a word.
            output.effects.extend(self.remove_channel(i, &mut output.delivered));
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
    // Inbound attribute writes
    // ------------------------------------------------------------------

    pub fn handle_inbound_write(
        &mut self,
        address: &PeerAddress,
        attribute: AttributeId,
        value: &[u8],
        config: &CommConfig,
    ) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        match attribute {
            AttributeId::ConnectionRequest => self.handle_connection_request(i, value),
            AttributeId::ConnectionResumedReceive => self.handle_resume_request(i),
            AttributeId::MtuRequest => {
                let address = address.clone();
                Output::from_effects(vec![
                    Effect::RespondWrite {
                        address: address.clone(),
                        attribute,
                        ok: true,
                        value: Vec::new(),
                    },
                    Effect::NotifyAttribute {
                        address,
                        attribute: AttributeId::MtuResponse,
                        value: value.len().to_string().into_bytes(),
                        confirm: false,
                    },
                ])
            }
            AttributeId::MessageReceive => {
                self.handle_inbound_fragment(i, ChannelKind::Message, value)
            }
            AttributeId::DataReceive => self.handle_inbound_fragment(i, ChannelKind::Data, value),
            AttributeId::ReadResponseMessage => {
                self.handle_fragment_ack(i, ChannelKind::Message, value, config)
            }
            AttributeId::ReadResponseData => {
                self.handle_fragment_ack(i, ChannelKind::Data, value, config)
            }
            AttributeId::NameUpdateReceive => {
                if value.is_empty() || !is_symbol_text(value) {
                    warn!(%address, "refusing out-of-alphabet name update");
                    return Output::from_effects(vec![Effect::RespondWrite {
                        address: address.clone(),
                        attribute,
                        ok: false,
                        value: Vec::new(),
                    }]);
                }
                let channel = &mut self.channels[i];
                let previous = channel.peer.clone();
                channel
                    .peer
                    .set_unique_name(String::from_utf8_lossy(value).into_owned());
                Output::from_effects(vec![
                    Effect::RespondWrite {
                        address: address.clone(),
                        attribute,
                        ok: true,
                        value: Vec::new(),
                    },
                    Effect::Emit(Event::PeerUpdated {
                        previous,
                        current: channel.peer.clone(),
                    }),
                ])
            }
            AttributeId::DisconnectionReceive => {
                let channel = &mut self.channels[i];
                channel.peer.set_disconnecting(true);
                Output::from_effects(vec![
                    Effect::RespondWrite {
                        address: address.clone(),
                        attribute,
                        ok: true,
                        value: Vec::new(),
                    },
                    Effect::CloseLink { address: address.clone() },
                ])
            }
            _ => Output::default(),
        }
    }

    fn handle_connection_request(&mut self, index: usize, value: &[u8]) -> Output {
        let channel = &mut self.channels[index];
        let Some(address) = channel.peer.address().cloned() else {
            return Output::default();
        };
        if channel.peer.is_reconnecting() {
            // The peer forgot us mid-reconnection and is starting over:
            // refuse the stale identity and give up on the resume.
            let mut output = Output::default();
            output.effects.push(Effect::RespondWrite {
                address,
                attribute: AttributeId::ConnectionRequest,
                ok: false,
                value: Vec::new(),
            });
            output.merge(self.stop_reconnection_at(index));
            return output;
        }
        if channel.peer.is_disconnecting() || channel.peer.is_connected() {
            return Output::from_effects(vec![Effect::RespondWrite {
                address,
                attribute: AttributeId::ConnectionRequest,
                ok: false,
                value: Vec::new(),
            }]);
        }
        if value.is_empty() || !is_symbol_text(value) {
            warn!(%address, "refusing connection request with out-of-alphabet name");
            return Output::from_effects(vec![Effect::RespondWrite {
                address,
                attribute: AttributeId::ConnectionRequest,
                ok: false,
                value: Vec::new(),
            }]);
        }
        channel
            .peer
            .set_unique_name(String::from_utf8_lossy(value).into_owned());
        let peer = channel.peer.clone();
        debug!(peer = %peer.unique_name(), "connection requested");
        Output::from_effects(vec![
            Effect::RespondWrite {
                address,
                attribute: AttributeId::ConnectionRequest,
                ok: true,
                value: Vec::new(),
            },
            Effect::Emit(Event::ConnectionRequested(peer)),
        ])
    }

    fn handle_resume_request(&mut self, index: usize) -> Output {
        let channel = &mut self.channels[index];
        let Some(address) = channel.peer.address().cloned() else {
            return Output::default();
        };
        let mut effects = vec![Effect::RespondWrite {
            address: address.clone(),
            attribute: AttributeId::ConnectionResumedReceive,
            ok: true,
            value: Vec::new(),
        }];
        if channel.peer.is_reconnecting() && !channel.peer.is_disconnecting() {
            channel.awaiting_notify = Some(NotifyPurpose::ResumeAccept);
            effects.push(Effect::NotifyAttribute {
                address,
                attribute: AttributeId::ConnectionResumedSend,
                value: ACCEPT.to_vec(),
                confirm: true,
            });
        } else if !channel.peer.is_connected() {
            // A peer claims a session this side does not have. Refuse the
            // resume and shed the channel.
            channel.peer.set_disconnecting(true);
            channel.awaiting_notify = Some(NotifyPurpose::ResumeReject);
            effects.push(Effect::NotifyAttribute {
                address,
                attribute: AttributeId::ConnectionResumedSend,
                value: REJECT.to_vec(),
                confirm: true,
            });
        }
        Output::from_effects(effects)
    }

    fn handle_inbound_fragment(&mut self, index: usize, kind: ChannelKind, value: &[u8]) -> Output {
        let channel = &mut self.channels[index];
        let Some(address) = channel.peer.address().cloned() else {
            return Output::default();
        };
        let attribute = match kind {
            ChannelKind::Message => AttributeId::MessageReceive,
            ChannelKind::Data => AttributeId::DataReceive,
        };
        let mut effects = Vec::new();
        match Fragment::decode(value) {
            Ok(fragment) => {
                let ack = fragment.ack_token();
                match channel.reassembler_mut(kind).accept(fragment) {
                    Reassembly::Complete(payload) => {
                        match Message::from_wire(channel.peer.clone(), &payload) {
                            Ok(message) => effects.push(Effect::Emit(match kind {
                                ChannelKind::Message => {
                                    Event::MessageReceived { message, role: Role::Server }
                                }
                                ChannelKind::Data => {
                                    Event::DataReceived { message, role: Role::Server }
                                }
                            })),
                            Err(err) => warn!(%err, "dropping malformed reassembled message"),
                        }
                    }
                    Reassembly::Incomplete | Reassembly::Duplicate | Reassembly::Stale => {}
                }
                // The write response doubles as the protocol ack.
                effects.push(Effect::RespondWrite {
                    address,
                    attribute,
                    ok: true,
                    value: ack.encode(),
                });
            }
            Err(err) => {
                warn!(%err, "dropping undecodable fragment");
                effects.push(Effect::RespondWrite {
                    address,
                    attribute,
                    ok: false,
                    value: Vec::new(),
                });
            }
        }
        Output::from_effects(effects)
    }

    fn handle_fragment_ack(
        &mut self,
        index: usize,
        kind: ChannelKind,
        value: &[u8],
        config: &CommConfig,
    ) -> Output {
        let channel = &mut self.channels[index];
        let Some(address) = channel.peer.address().cloned() else {
            return Output::default();
        };
        let ack_attribute = match kind {
            ChannelKind::Message => AttributeId::ReadResponseMessage,
            ChannelKind::Data => AttributeId::ReadResponseData,
        };
        let mut output = Output::default();
        output.effects.push(Effect::RespondWrite {
            address,
            attribute: ack_attribute,
            ok: true,
            value: Vec::new(),
        });
        match AckToken::decode(value) {
            Ok(token) => {
                let (outcome, effects) = channel.on_ack(kind, token, config);
                output.effects.extend(effects);
                if let crate::pending::AckOutcome::MessageComplete(ticket) = outcome {
                    output.delivered.push((kind, ticket));
                }
            }
            Err(err) => warn!(%err, "undecodable acknowledgement"),
        }
        output
    }

    // ------------------------------------------------------------------
    // Reads and notification confirmations
    // ------------------------------------------------------------------

    pub fn handle_read_request(&mut self, address: &PeerAddress, attribute: AttributeId) -> Output {
        if attribute != AttributeId::DataSend {
            return Output::default();
        }
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        let value = self.channels[i]
            .in_flight_fragment(ChannelKind::Data)
            .map(|f| f.encode())
            .unwrap_or_default();
        Output::from_effects(vec![Effect::RespondRead {
            address: address.clone(),
            attribute,
            value,
        }])
    }

    pub fn handle_notification_result(
        &mut self,
        address: &PeerAddress,
        attribute: AttributeId,
        ok: bool,
        config: &CommConfig,
    ) -> Output {
        let Some(i) = self.index_by_address(address) else {
            return Output::default();
        };
        match attribute {
            AttributeId::MessageSend if !ok => {
                Output::from_effects(self.channels[i].on_write_failure(ChannelKind::Message, config))
            }
            AttributeId::DataSend if !ok => {
                Output::from_effects(self.channels[i].on_write_failure(ChannelKind::Data, config))
            }
            AttributeId::ConnectionResponse | AttributeId::ConnectionResumedSend
            | AttributeId::DisconnectionSend => {
                self.handle_control_notify_result(i, ok, config)
            }
            _ => Output::default(),
        }
    }

    fn handle_control_notify_result(&mut self, index: usize, ok: bool, config: &CommConfig) -> Output {
        let channel = &mut self.channels[index];
        let Some(purpose) = channel.awaiting_notify.take() else {
            return Output::default();
        };
        if !ok {
            warn!(peer = %channel.peer.unique_name(), ?purpose, "control notification failed");
            return Output::default();
        }
        let mut output = Output::default();
        match purpose {
            NotifyPurpose::ConnectAccept => {
                output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
                channel.peer.set_connected(true);
                output.effects.push(Effect::Emit(Event::ConnectionSuccess(
                    channel.peer.clone(),
                    Role::Server,
                )));
            }
            NotifyPurpose::ConnectReject => {
                // The initiator tears the link down; the channel goes with it.
            }
            NotifyPurpose::ResumeAccept => {
                output.effects.extend(channel.cancel_timer(TimerKind::ConnectionComplete));
                output.effects.extend(channel.cancel_timer(TimerKind::Reconnection));
                channel.peer.set_reconnecting(false, false);
                output.resumed.push(channel.peer.clone());
                output.effects.extend(channel.kick(ChannelKind::Message, config));
                output.effects.extend(channel.kick(ChannelKind::Data, config));
            }
            NotifyPurpose::ResumeReject => {
                if let Some(address) = channel.peer.address().cloned() {
                    output.effects.push(Effect::CloseLink { address });
                }
            }
            NotifyPurpose::Disconnect => {
                if let Some(address) = channel.peer.address().cloned() {
                    output.effects.push(Effect::CloseLink { address });
                }
            }
        }
        output
    }

    // ------------------------------------------------------------------
    // Application decisions
    // ------------------------------------------------------------------

    /// Accept a pending connection request.
    pub fn accept_connection(&mut self, peer: &Peer) -> Result<Output> {
        let i = self
            .index_by_peer(peer)
            .ok_or(ConnectionError::PeerNotFound)?;
        let channel = &mut self.channels[i];
        if channel.peer.is_connected() || channel.peer.is_reconnecting() || channel.peer.is_disconnecting() {
            return Err(ConnectionError::NoPendingRequest.into());
        }
        let Some(address) = channel.peer.address().cloned() else {
            return Err(ConnectionError::PeerNotFound.into());
        };
        channel.awaiting_notify = Some(NotifyPurpose::ConnectAccept);
        Ok(Output::from_effects(vec![Effect::NotifyAttribute {
            address,
            attribute: AttributeId::ConnectionResponse,
            value: ACCEPT.to_vec(),
            confirm: true,
        }]))
    }

    /// Reject a pending connection request.
    pub fn reject_connection(&mut self, peer: &Peer) -> Result<Output> {
        let i = self
            .index_by_peer(peer)
            .ok_or(ConnectionError::PeerNotFound)?;
        let channel = &mut self.channels[i];
        if channel.peer.is_connected() || channel.peer.is_reconnecting() || channel.peer.is_disconnecting() {
            return Err(ConnectionError::NoPendingRequest.into());
        }
        let Some(address) = channel.peer.address().cloned() else {
            return Err(ConnectionError::PeerNotFound.into());
        };
        channel.peer.set_disconnecting(true);
        channel.awaiting_notify = Some(NotifyPurpose::ConnectReject);
        Ok(Output::from_effects(vec![Effect::NotifyAttribute {
            address,
            attribute: AttributeId::ConnectionResponse,
            value: REJECT.to_vec(),
            confirm: true,
        }]))
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
                } else if self.channels[i].peer.is_connected() {
                    Output::default()
                } else {
                    // Nobody ever asked to connect, or the application never
                    // answered. Drop the link; the channel is removed on the
                    // hardware disconnect.
                    let channel = &mut self.channels[i];
                    channel.peer.set_disconnecting(true);
                    match channel.peer.address().cloned() {
                        Some(address) => Output::from_effects(vec![Effect::CloseLink { address }]),
                        None => Output::default(),
                    }
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

    fn stop_reconnection_at(&mut self, index: usize) -> Output {
        let mut output = Output::default();
        let channel = &mut self.channels[index];
        channel.peer.set_reconnecting(false, false);
        channel.peer.set_disconnecting(true);
        let peer = channel.peer.clone();
        debug!(peer = %peer.unique_name(), "giving up reconnection");
        if channel.peer.is_hardware_connected() {
            if let Some(address) = peer.address().cloned() {
                output.effects.push(Effect::CloseLink { address });
            }
        } else {
            output.effects.extend(self.remove_channel(index, &mut output.delivered));
            output.disconnected.push(peer);
        }
        output
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
                effects.push(Effect::NotifyAttribute {
                    address,
                    attribute: AttributeId::NameUpdateSend,
                    value: unique_name.as_bytes().to_vec(),
                    confirm: false,
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
                channel.awaiting_notify = Some(NotifyPurpose::Disconnect);
                output.effects.push(Effect::NotifyAttribute {
                    address,
                    attribute: AttributeId::DisconnectionSend,
                    value: b"1".to_vec(),
                    confirm: true,
                });
            } else {
                output.effects.push(Effect::CloseLink { address });
            }
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
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment::split_payload;
    use crate::protocol::sequence::MessageId;

    fn config() -> CommConfig {
        CommConfig::new("me").with_fragment_payload_size(8)
    }

    fn events(output: &Output) -> Vec<&Event> {
        output
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Drive an acceptor through request and accept to fully connected.
    fn connect_server(server: &mut ServerRole, name: &str, addr: &str) -> Peer {
        let cfg = config();
        let address = PeerAddress::from(addr);
        server.handle_hardware_connected(&address, &cfg);
        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionRequest,
            name.as_bytes(),
            &cfg,
        );
        let requested = events(&out)
            .iter()
            .find_map(|e| match e {
                Event::ConnectionRequested(peer) => Some(peer.clone()),
                _ => None,
            })
            .unwrap();

        let out = server.accept_connection(&requested).unwrap();
        assert!(matches!(
            out.effects[0],
            Effect::NotifyAttribute { attribute: AttributeId::ConnectionResponse, .. }
        ));
        let out = server.handle_notification_result(&address, AttributeId::ConnectionResponse, true, &cfg);
        assert!(events(&out)
            .iter()
            .any(|e| matches!(e, Event::ConnectionSuccess(_, Role::Server))));
        requested
    }

    #[test]
    fn optimistic_channel_and_accept_flow() {
        let mut server = ServerRole::new();
        connect_server(&mut server, "aliceXY", "00:11");
        assert_eq!(server.connected_count(), 1);
    }

    #[test]
    fn reject_refuses_and_sheds_channel_on_disconnect() {
        let mut server = ServerRole::new();
        let cfg = config();
        let address = PeerAddress::from("00:11");
        server.handle_hardware_connected(&address, &cfg);
        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionRequest,
            b"aliceXY",
            &cfg,
        );
        let requested = events(&out)
            .iter()
            .find_map(|e| match e {
                Event::ConnectionRequested(peer) => Some(peer.clone()),
                _ => None,
            })
            .unwrap();

        let out = server.reject_connection(&requested).unwrap();
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::ConnectionResponse, value, .. }
                if value == REJECT
        )));
        // A second decision is no longer possible.
        assert!(server.accept_connection(&requested).is_err());

        // The initiator drops the link; the channel disappears silently.
        let out = server.handle_hardware_disconnected(&address, &cfg);
        assert!(out.disconnected.is_empty());
        assert_eq!(server.connected_count(), 0);
    }

    #[test]
    fn accept_requires_a_pending_request() {
        let mut server = ServerRole::new();
        let stranger = Peer::new("whoDD", Some(PeerAddress::from("99:99")));
        assert!(server.accept_connection(&stranger).is_err());
    }

    #[test]
    fn connection_request_during_reconnection_is_refused() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let out = server.handle_hardware_disconnected(&address, &cfg);
        assert_eq!(out.lost.len(), 1);

        // The peer comes back but asks for a fresh connection instead of a
        // resume: refuse it and give up the old session.
        server.handle_hardware_connected(&address, &cfg);
        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionRequest,
            b"aliceXY",
            &cfg,
        );
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::RespondWrite { attribute: AttributeId::ConnectionRequest, ok: false, .. }
        )));
        assert!(!server.has_reconnecting());
    }

    #[test]
    fn resume_request_confirms_and_restores_traffic() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        server.handle_hardware_disconnected(&address, &cfg);

        // A message queued during the outage waits.
        let msg = Message::text(b'm', "held");
        let (count, effects) = server.send_message(ChannelKind::Message, &msg, Ticket(1), &cfg);
        assert_eq!(count, 1);
        assert!(effects.is_empty());

        server.handle_hardware_connected(&address, &cfg);
        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionResumedReceive,
            b"1",
            &cfg,
        );
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::ConnectionResumedSend, value, .. }
                if value == ACCEPT
        )));

        let out = server.handle_notification_result(
            &address,
            AttributeId::ConnectionResumedSend,
            true,
            &cfg,
        );
        assert_eq!(out.resumed.len(), 1);
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::MessageSend, .. }
        )));
    }

    #[test]
    fn connection_request_with_invalid_name_is_refused() {
        let mut server = ServerRole::new();
        let cfg = config();
        let address = PeerAddress::from("00:11");
        server.handle_hardware_connected(&address, &cfg);

        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionRequest,
            "alic\u{e9}XY".as_bytes(),
            &cfg,
        );
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::RespondWrite { attribute: AttributeId::ConnectionRequest, ok: false, .. }
        )));
        assert!(events(&out)
            .iter()
            .all(|e| !matches!(e, Event::ConnectionRequested(_))));
    }

    #[test]
    fn out_of_alphabet_name_update_is_refused() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let out = server.handle_inbound_write(
            &address,
            AttributeId::NameUpdateReceive,
            "bad\u{e9}nameXY".as_bytes(),
            &cfg,
        );
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::RespondWrite { attribute: AttributeId::NameUpdateReceive, ok: false, .. }
        )));
        assert!(events(&out).iter().all(|e| !matches!(e, Event::PeerUpdated { .. })));
        assert_eq!(server.connected_peers()[0].unique_name(), "aliceXY");
    }

    #[test]
    fn drop_during_resume_is_terminal() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        server.handle_hardware_disconnected(&address, &cfg);
        assert!(server.has_reconnecting());
        server.handle_hardware_connected(&address, &cfg);

        // The link flaps again before the resume completes.
        let out = server.handle_hardware_disconnected(&address, &cfg);
        assert_eq!(out.disconnected.len(), 1);
        assert!(!server.has_reconnecting());
        assert_eq!(server.connected_count(), 0);
    }

    #[test]
    fn failed_notification_redispatches_in_flight_fragment() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let msg = Message::text(b'm', "retry me");
        let (_, effects) = server.send_message(ChannelKind::Message, &msg, Ticket(7), &cfg);
        let first = effects
            .iter()
            .find_map(|e| match e {
                Effect::NotifyAttribute { attribute: AttributeId::MessageSend, value, .. } => {
                    Some(Fragment::decode(value).unwrap())
                }
                _ => None,
            })
            .unwrap();

        let out = server.handle_notification_result(&address, AttributeId::MessageSend, false, &cfg);
        let resent = out
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::NotifyAttribute { attribute: AttributeId::MessageSend, value, .. } => {
                    Some(Fragment::decode(value).unwrap())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(resent, first);
        // The retry runs under a fresh ack timer.
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::StartTimer { token, .. } if token.kind == TimerKind::MessageAck
        )));
    }

    #[test]
    fn resume_for_unknown_session_is_rejected() {
        let mut server = ServerRole::new();
        let cfg = config();
        let address = PeerAddress::from("00:11");
        server.handle_hardware_connected(&address, &cfg);

        let out = server.handle_inbound_write(
            &address,
            AttributeId::ConnectionResumedReceive,
            b"1",
            &cfg,
        );
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::ConnectionResumedSend, value, .. }
                if value == REJECT
        )));
    }

    #[test]
    fn inbound_fragments_are_acked_and_reassembled() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let wire = Message::text(b'm', "a long payload").wire_payload();
        let frags = split_payload(MessageId::zero(), &wire, 6).unwrap();
        for (i, frag) in frags.iter().enumerate() {
            let out = server.handle_inbound_write(
                &address,
                AttributeId::MessageReceive,
                &frag.encode(),
                &cfg,
            );
            let acked = out.effects.iter().any(|e| matches!(
                e,
                Effect::RespondWrite { attribute: AttributeId::MessageReceive, ok: true, value, .. }
                    if *value == frag.ack_token().encode()
            ));
            assert!(acked, "fragment {i} must be acked");
            let complete = events(&out)
                .iter()
                .any(|e| matches!(e, Event::MessageReceived { .. }));
            assert_eq!(complete, i == frags.len() - 1);
        }
    }

    #[test]
    fn duplicate_fragment_is_acked_but_not_redelivered() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let wire = Message::text(b'm', "x").wire_payload();
        let frag = split_payload(MessageId::zero(), &wire, 100).unwrap().remove(0);
        let out = server.handle_inbound_write(&address, AttributeId::MessageReceive, &frag.encode(), &cfg);
        assert!(events(&out).iter().any(|e| matches!(e, Event::MessageReceived { .. })));

        let out = server.handle_inbound_write(&address, AttributeId::MessageReceive, &frag.encode(), &cfg);
        assert!(events(&out).iter().all(|e| !matches!(e, Event::MessageReceived { .. })));
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::RespondWrite { ok: true, .. }
        )));
    }

    #[test]
    fn data_read_serves_in_flight_fragment() {
        let mut server = ServerRole::new();
        let cfg = config();
        connect_server(&mut server, "aliceXY", "00:11");
        let address = PeerAddress::from("00:11");

        let msg = Message::new(b'd', b"payload".to_vec());
        let (_, effects) = server.send_message(ChannelKind::Data, &msg, Ticket(2), &cfg);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::DataSend, .. }
        )));

        let out = server.handle_read_request(&address, AttributeId::DataSend);
        let served = out
            .effects
            .iter()
            .find_map(|e| match e {
                Effect::RespondRead { value, .. } => Some(Fragment::decode(value).unwrap()),
                _ => None,
            })
            .unwrap();

        // The initiator acks through the read-response attribute.
        let out = server.handle_inbound_write(
            &address,
            AttributeId::ReadResponseData,
            &served.ack_token().encode(),
            &cfg,
        );
        assert_eq!(out.delivered, vec![(ChannelKind::Data, Ticket(2))]);
    }

    #[test]
    fn mtu_request_echoes_written_length() {
        let mut server = ServerRole::new();
        let cfg = config();
        let address = PeerAddress::from("00:11");
        server.handle_hardware_connected(&address, &cfg);

        let out = server.handle_inbound_write(&address, AttributeId::MtuRequest, &[0u8; 300], &cfg);
        assert!(out.effects.iter().any(|e| matches!(
            e,
            Effect::NotifyAttribute { attribute: AttributeId::MtuResponse, value, .. }
                if value == b"300"
        )));
    }
}
