//! The engine facade: both roles, global send queues, transport supervision.

use std::collections::VecDeque;

use rand::Rng;
use tracing::{debug, info};

use crate::config::CommConfig;
use crate::effects::Effect;
use crate::errors::{CommError, Result};
use crate::events::Event;
use crate::link::LinkEvent;
use crate::pending::Ticket;
use crate::protocol::fragment::Message;
use crate::protocol::sequence::{ALPHABET_FIRST, ALPHABET_SIZE};
use crate::role::{ClientRole, Output, ServerRole};
use crate::types::{ChannelKind, Peer, Role, UNIQUE_SUFFIX_LEN};

// ----------------------------------------------------------------------------
// Global Send Queues
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Dispatch {
    ticket: Ticket,
    remaining: usize,
}

/// One global FIFO: messages wait here and go out strictly one at a time
/// across both roles.
#[derive(Debug, Default)]
struct SendQueue {
    queue: VecDeque<Message>,
    dispatch: Option<Dispatch>,
}

// ----------------------------------------------------------------------------
// Communicator
// ----------------------------------------------------------------------------

/// The synchronous protocol engine.
///
/// Every public operation and every [`LinkEvent`] is handled to completion on
/// the caller's thread and returns the [`Effect`]s the driver must perform.
/// The engine holds no locks and spawns nothing; one owner drives it.
#[derive(Debug)]
pub struct Communicator {
    config: CommConfig,
    unique_name: String,
    started: bool,
    client: ClientRole,
    server: ServerRole,
    advertising: bool,
    discovering: bool,
    broadcast_running: bool,
    scan_running: bool,
    messages: SendQueue,
    data: SendQueue,
    next_ticket: u64,
}

impl Communicator {
    pub fn new(config: CommConfig) -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..UNIQUE_SUFFIX_LEN)
            .map(|_| (ALPHABET_FIRST + rng.gen_range(0..ALPHABET_SIZE)) as char)
            .collect();
        let unique_name = format!("{}{}", config.name, suffix);
        Self::with_unique_name(config, unique_name)
    }

    /// Construct with a fixed unique name instead of a random suffix.
    pub fn with_unique_name(config: CommConfig, unique_name: String) -> Self {
        Self {
            config,
            unique_name,
            started: false,
            client: ClientRole::new(),
            server: ServerRole::new(),
            advertising: false,
            discovering: false,
            broadcast_running: false,
            scan_running: false,
            messages: SendQueue::default(),
            data: SendQueue::default(),
            next_ticket: 0,
        }
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// This engine as a peer, the way remote sides see it.
    pub fn own_peer(&self) -> Peer {
        Peer::new(self.unique_name.clone(), None)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn connected_peers(&self) -> Vec<Peer> {
        let mut peers = self.client.connected_peers();
        peers.extend(self.server.connected_peers());
        peers
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(CommError::NotReady)
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Two-phase construction: no operation works until the engine is
    /// started, and none fails for lack of initialization afterwards.
    pub fn start(&mut self) {
        info!(unique_name = %self.unique_name, "engine started");
        self.started = true;
    }

    /// Tear everything down.
    pub fn destroy(&mut self) -> Vec<Effect> {
        let mut effects = self.client.destroy();
        effects.extend(self.server.destroy());
        if self.broadcast_running {
            self.broadcast_running = false;
            effects.push(Effect::StopBroadcast);
        }
        if self.scan_running {
            self.scan_running = false;
            effects.push(Effect::StopScan);
        }
        self.advertising = false;
        self.discovering = false;
        self.messages = SendQueue::default();
        self.data = SendQueue::default();
        self.started = false;
        effects
    }

    // ------------------------------------------------------------------
    // Advertising and discovery
    // ------------------------------------------------------------------

    pub fn start_advertising(&mut self) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        if self.advertising {
            return Err(CommError::AlreadyStarted);
        }
        self.advertising = true;
        let mut effects = Vec::new();
        if !self.broadcast_running {
            self.broadcast_running = true;
            effects.push(Effect::StartBroadcast { unique_name: self.unique_name.clone() });
        }
        effects.push(Effect::Emit(Event::AdvertiseStarted));
        Ok(effects)
    }

    pub fn stop_advertising(&mut self) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        if !self.advertising {
            return Err(CommError::AlreadyStopped);
        }
        self.advertising = false;
        let mut effects = Vec::new();
        // Reconnecting peers need the broadcast to keep running so they can
        // find this side again.
        if self.broadcast_running && !self.server.has_reconnecting() {
            self.broadcast_running = false;
            effects.push(Effect::StopBroadcast);
        }
        effects.push(Effect::Emit(Event::AdvertiseStopped));
        Ok(effects)
    }

    pub fn start_discovery(&mut self) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        if self.discovering {
            return Err(CommError::AlreadyStarted);
        }
        self.discovering = true;
        let mut effects = Vec::new();
        if !self.scan_running {
            self.scan_running = true;
            effects.push(Effect::StartScan);
        }
        effects.push(Effect::Emit(Event::DiscoveryStarted));
        Ok(effects)
    }

    pub fn stop_discovery(&mut self) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        if !self.discovering {
            return Err(CommError::AlreadyStopped);
        }
        self.discovering = false;
        let mut effects = Vec::new();
        if self.scan_running && !self.client.has_reconnecting() {
            self.scan_running = false;
            effects.push(Effect::StopScan);
        }
        effects.push(Effect::Emit(Event::DiscoveryStopped));
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Queue a connection attempt to a discovered peer.
    pub fn connect(&mut self, peer: Peer) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let output = self.client.connect(peer);
        Ok(self.process_output(output))
    }

    /// Accept a pending connection request.
    pub fn accept_connection(&mut self, peer: &Peer) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let output = self.server.accept_connection(peer)?;
        Ok(self.process_output(output))
    }

    /// Reject a pending connection request.
    pub fn reject_connection(&mut self, peer: &Peer) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let output = self.server.reject_connection(peer)?;
        Ok(self.process_output(output))
    }

    /// Give up reconnecting to a lost peer instead of waiting for the
    /// reconnection timeout.
    pub fn stop_reconnection(&mut self, peer: &Peer) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        match self.client.stop_reconnection(peer) {
            Some(output) => Ok(self.process_output(output)),
            None => Err(crate::errors::ConnectionError::PeerNotFound.into()),
        }
    }

    /// Deliberately disconnect a peer, whichever role owns it.
    pub fn disconnect(&mut self, peer: &Peer) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let output = self
            .client
            .disconnect(peer)
            .or_else(|| self.server.disconnect(peer));
        match output {
            Some(output) => Ok(self.process_output(output)),
            None => Ok(vec![Effect::Emit(Event::DisconnectionFailed(peer.clone()))]),
        }
    }

    /// Disconnect every connected peer.
    pub fn disconnect_all(&mut self) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let mut effects = Vec::new();
        for peer in self.connected_peers() {
            effects.extend(self.disconnect(&peer)?);
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Queue a message for every connected peer (or the message's receiver).
    /// Strict FIFO: one message is in flight at a time across both roles.
    pub fn send_message(&mut self, message: Message) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        self.messages.queue.push_back(message);
        Ok(self.dispatch_next(ChannelKind::Message))
    }

    /// Queue a data payload; same delivery rules as messages, separate FIFO.
    pub fn send_data(&mut self, message: Message) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        self.data.queue.push_back(message);
        Ok(self.dispatch_next(ChannelKind::Data))
    }

    fn send_queue_mut(&mut self, kind: ChannelKind) -> &mut SendQueue {
        match kind {
            ChannelKind::Message => &mut self.messages,
            ChannelKind::Data => &mut self.data,
        }
    }

    /// Fan the head of the queue out to both roles. Messages with no
    /// recipient at all complete immediately and the next one starts.
    fn dispatch_next(&mut self, kind: ChannelKind) -> Vec<Effect> {
        let mut effects = Vec::new();
        loop {
            if self.send_queue_mut(kind).dispatch.is_some() {
                break;
            }
            let Some(head) = self.send_queue_mut(kind).queue.front().cloned() else {
                break;
            };
            let ticket = Ticket(self.next_ticket);
            self.next_ticket += 1;
            let (client_count, client_effects) =
                self.client.send_message(kind, &head, ticket, &self.config);
            let (server_count, server_effects) =
                self.server.send_message(kind, &head, ticket, &self.config);
            effects.extend(client_effects);
            effects.extend(server_effects);
            let remaining = client_count + server_count;
            if remaining == 0 {
                debug!(?kind, "no recipients, dropping queued message");
                self.send_queue_mut(kind).queue.pop_front();
                continue;
            }
            self.send_queue_mut(kind).dispatch = Some(Dispatch { ticket, remaining });
            break;
        }
        effects
    }

    /// One channel settled its share of a ticket.
    fn settle(&mut self, kind: ChannelKind, ticket: Ticket) -> Vec<Effect> {
        let queue = self.send_queue_mut(kind);
        let done = match &mut queue.dispatch {
            Some(dispatch) if dispatch.ticket == ticket => {
                dispatch.remaining = dispatch.remaining.saturating_sub(1);
                dispatch.remaining == 0
            }
            _ => false,
        };
        if !done {
            return Vec::new();
        }
        queue.dispatch = None;
        queue.queue.pop_front();
        self.dispatch_next(kind)
    }

    // ------------------------------------------------------------------
    // Name updates
    // ------------------------------------------------------------------

    /// Change the display name, keeping the unique suffix, and propagate it
    /// to every fully connected peer.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<Vec<Effect>> {
        self.ensure_started()?;
        let name = name.into();
        let suffix_at = self.unique_name.len().saturating_sub(UNIQUE_SUFFIX_LEN);
        let suffix = self.unique_name[suffix_at..].to_string();
        self.unique_name = format!("{name}{suffix}");
        self.config.name = name;

        let mut effects = self.client.broadcast_name_update(&self.unique_name);
        effects.extend(self.server.broadcast_name_update(&self.unique_name));
        if self.broadcast_running {
            effects.push(Effect::StopBroadcast);
            effects.push(Effect::StartBroadcast { unique_name: self.unique_name.clone() });
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // Link event handling
    // ------------------------------------------------------------------

    /// Feed one link event through the engine.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Vec<Effect> {
        if !self.started {
            return Vec::new();
        }
        let output = match event {
            LinkEvent::HardwareConnected { address } => {
                if self.client.owns_address(&address) {
                    self.client.handle_hardware_connected(&address, &self.config)
                } else {
                    self.server.handle_hardware_connected(&address, &self.config)
                }
            }
            LinkEvent::HardwareDisconnected { address } => {
                if self.client.owns_address(&address) {
                    self.client.handle_hardware_disconnected(&address, &self.config)
                } else {
                    self.server.handle_hardware_disconnected(&address, &self.config)
                }
            }
            LinkEvent::Notification { address, attribute, value } => self.client.handle_notification(
                &address,
                attribute,
                &value,
                &self.unique_name,
                &self.config,
            ),
            LinkEvent::WriteResult { address, attribute, ok, value } => {
                self.client
                    .handle_write_result(&address, attribute, ok, &value, &self.config)
            }
            LinkEvent::ReadResult { address, attribute, ok, value } => {
                self.client
                    .handle_read_result(&address, attribute, ok, &value, &self.config)
            }
            LinkEvent::InboundWrite { address, attribute, value } => {
                self.server
                    .handle_inbound_write(&address, attribute, &value, &self.config)
            }
            LinkEvent::ReadRequest { address, attribute } => {
                self.server.handle_read_request(&address, attribute)
            }
            LinkEvent::NotificationResult { address, attribute, ok } => {
                self.server
                    .handle_notification_result(&address, attribute, ok, &self.config)
            }
            LinkEvent::MtuChanged { address, mtu } => {
                self.client
                    .handle_mtu_changed(&address, mtu, &self.unique_name, &self.config)
            }
            LinkEvent::PeerFound { peer } => match self.client.on_reconnecting_peer_found(&peer) {
                Some(output) => output,
                None if self.discovering => {
                    Output::from_effects(vec![Effect::Emit(Event::PeerFound(peer))])
                }
                None => Output::default(),
            },
            LinkEvent::PeerLost { peer } => {
                if self.discovering {
                    Output::from_effects(vec![Effect::Emit(Event::PeerLost(peer))])
                } else {
                    Output::default()
                }
            }
            LinkEvent::TimerFired(token) => match token.role {
                Role::Client => self.client.handle_timer(&token, &self.config),
                Role::Server => self.server.handle_timer(&token, &self.config),
            },
        };
        self.process_output(output)
    }

    // ------------------------------------------------------------------
    // Output post-processing
    // ------------------------------------------------------------------

    /// Turn role bookkeeping into effects: settle fan-out shares, emit the
    /// lifecycle events that need facade context, and supervise the
    /// broadcast/scan state reconnecting peers depend on.
    fn process_output(&mut self, output: Output) -> Vec<Effect> {
        let Output { mut effects, delivered, lost, resumed, disconnected } = output;

        for (kind, ticket) in delivered {
            effects.extend(self.settle(kind, ticket));
        }
        for peer in lost {
            effects.push(Effect::Emit(Event::ConnectionLost(peer)));
        }
        for peer in resumed {
            effects.push(Effect::Emit(Event::ConnectionResumed(peer)));
        }
        for peer in disconnected {
            let peers_left = self.client.connected_count() + self.server.connected_count();
            if peers_left == 0 {
                // Nobody left to deliver to; pending traffic dies with the
                // last peer.
                self.messages = SendQueue::default();
                self.data = SendQueue::default();
            }
            effects.push(Effect::Emit(Event::Disconnected { peer, peers_left }));
        }

        let want_broadcast = self.advertising || self.server.has_reconnecting();
        if want_broadcast && !self.broadcast_running {
            self.broadcast_running = true;
            effects.push(Effect::StartBroadcast { unique_name: self.unique_name.clone() });
        } else if !want_broadcast && self.broadcast_running {
            self.broadcast_running = false;
            effects.push(Effect::StopBroadcast);
        }
        let want_scan = self.discovering || self.client.has_reconnecting();
        if want_scan && !self.scan_running {
            self.scan_running = true;
            effects.push(Effect::StartScan);
        } else if !want_scan && self.scan_running {
            self.scan_running = false;
            effects.push(Effect::StopScan);
        }

        effects
    }
}
