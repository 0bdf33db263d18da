//! Tokio driver around the synchronous engine.
//!
//! A single task owns the [`Communicator`]: application commands and
//! [`LinkEvent`]s are serialized through channels, the resulting [`Effect`]s
//! are executed against the [`Link`] and [`TransportControl`]
//! implementations, timers run as aborted-on-cancel sleep tasks, and
//! [`Event`]s fan out over a broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::communicator::Communicator;
use crate::config::CommConfig;
use crate::effects::{Effect, TimerKind};
use crate::errors::{CommError, Result};
use crate::events::Event;
use crate::link::{Link, LinkEvent, TransportControl};
use crate::protocol::fragment::Message;
use crate::types::{Peer, Role};

const DEFAULT_EVENT_CAPACITY: usize = 256;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum Command {
    StartAdvertising(oneshot::Sender<Result<()>>),
    StopAdvertising(oneshot::Sender<Result<()>>),
    StartDiscovery(oneshot::Sender<Result<()>>),
    StopDiscovery(oneshot::Sender<Result<()>>),
    Connect(Peer, oneshot::Sender<Result<()>>),
    AcceptConnection(Peer, oneshot::Sender<Result<()>>),
    RejectConnection(Peer, oneshot::Sender<Result<()>>),
    StopReconnection(Peer, oneshot::Sender<Result<()>>),
    Disconnect(Peer, oneshot::Sender<Result<()>>),
    DisconnectAll(oneshot::Sender<Result<()>>),
    SendMessage(Message, oneshot::Sender<Result<()>>),
    SendData(Message, oneshot::Sender<Result<()>>),
    SetName(String, oneshot::Sender<Result<()>>),
    ConnectedPeers(oneshot::Sender<Vec<Peer>>),
    UniqueName(oneshot::Sender<String>),
    Destroy(oneshot::Sender<Result<()>>),
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builds and spawns the driver task.
pub struct RuntimeBuilder {
    config: CommConfig,
    unique_name: Option<String>,
    event_capacity: usize,
}

impl RuntimeBuilder {
    pub fn new(config: CommConfig) -> Self {
        Self { config, unique_name: None, event_capacity: DEFAULT_EVENT_CAPACITY }
    }

    /// Use a fixed unique name instead of a random suffix.
    pub fn with_unique_name(mut self, unique_name: impl Into<String>) -> Self {
        self.unique_name = Some(unique_name.into());
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Spawn the driver task. Returns the application handle and the sender
    /// the platform link implementation feeds its [`LinkEvent`]s into.
    pub fn spawn(
        self,
        link: Arc<dyn Link>,
        control: Arc<dyn TransportControl>,
    ) -> (CommunicatorHandle, mpsc::UnboundedSender<LinkEvent>) {
        let mut engine = match self.unique_name {
            Some(unique_name) => Communicator::with_unique_name(self.config, unique_name),
            None => Communicator::new(self.config),
        };
        engine.start();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(self.event_capacity);

        let driver = Driver {
            engine,
            link,
            control,
            commands: command_rx,
            link_events: link_rx,
            feedback: link_tx.clone(),
            events: event_tx.clone(),
            timers: HashMap::new(),
        };
        tokio::spawn(driver.run());

        (CommunicatorHandle { commands: command_tx, events: event_tx }, link_tx)
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable application-facing handle to the driver task.
#[derive(Clone)]
pub struct CommunicatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
}

impl CommunicatorHandle {
    /// Subscribe to engine events. Slow subscribers that fall behind the
    /// channel capacity see `Lagged` and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    async fn request(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| CommError::Destroyed)?;
        rx.await.map_err(|_| CommError::Destroyed)?
    }

    pub async fn start_advertising(&self) -> Result<()> {
        self.request(Command::StartAdvertising).await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(Command::StopAdvertising).await
    }

    pub async fn start_discovery(&self) -> Result<()> {
        self.request(Command::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        self.request(Command::StopDiscovery).await
    }

    pub async fn connect(&self, peer: Peer) -> Result<()> {
        self.request(|tx| Command::Connect(peer, tx)).await
    }

    pub async fn accept_connection(&self, peer: Peer) -> Result<()> {
        self.request(|tx| Command::AcceptConnection(peer, tx)).await
    }

    pub async fn reject_connection(&self, peer: Peer) -> Result<()> {
        self.request(|tx| Command::RejectConnection(peer, tx)).await
    }

    pub async fn stop_reconnection(&self, peer: Peer) -> Result<()> {
        self.request(|tx| Command::StopReconnection(peer, tx)).await
    }

    pub async fn disconnect(&self, peer: Peer) -> Result<()> {
        self.request(|tx| Command::Disconnect(peer, tx)).await
    }

    pub async fn disconnect_all(&self) -> Result<()> {
        self.request(Command::DisconnectAll).await
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.request(|tx| Command::SendMessage(message, tx)).await
    }

    pub async fn send_data(&self, message: Message) -> Result<()> {
        self.request(|tx| Command::SendData(message, tx)).await
    }

    pub async fn set_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|tx| Command::SetName(name, tx)).await
    }

    pub async fn connected_peers(&self) -> Result<Vec<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectedPeers(tx))
            .map_err(|_| CommError::Destroyed)?;
        rx.await.map_err(|_| CommError::Destroyed)
    }

    pub async fn unique_name(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::UniqueName(tx))
            .map_err(|_| CommError::Destroyed)?;
        rx.await.map_err(|_| CommError::Destroyed)
    }

    /// Tear the driver task down.
    pub async fn destroy(&self) -> Result<()> {
        self.request(Command::Destroy).await
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

type TimerKey = (Role, u64, TimerKind);

struct Driver {
    engine: Communicator,
    link: Arc<dyn Link>,
    control: Arc<dyn TransportControl>,
    commands: mpsc::UnboundedReceiver<Command>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    /// Timer fires and synthesized failures re-enter through here.
    feedback: mpsc::UnboundedSender<LinkEvent>,
    events: broadcast::Sender<Event>,
    timers: HashMap<TimerKey, JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                event = self.link_events.recv() => {
                    let Some(event) = event else { break };
                    let effects = self.engine.handle_link_event(event);
                    self.perform(effects).await;
                }
            }
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        debug!("driver task finished");
    }

    /// Returns `true` when the driver should shut down.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartAdvertising(tx) => {
                let result = self.engine.start_advertising();
                self.reply(result, tx).await;
            }
            Command::StopAdvertising(tx) => {
                let result = self.engine.stop_advertising();
                self.reply(result, tx).await;
            }
            Command::StartDiscovery(tx) => {
                let result = self.engine.start_discovery();
                self.reply(result, tx).await;
            }
            Command::StopDiscovery(tx) => {
                let result = self.engine.stop_discovery();
                self.reply(result, tx).await;
            }
            Command::Connect(peer, tx) => {
                let result = self.engine.connect(peer);
                self.reply(result, tx).await;
            }
            Command::AcceptConnection(peer, tx) => {
                let result = self.engine.accept_connection(&peer);
                self.reply(result, tx).await;
            }
            Command::RejectConnection(peer, tx) => {
                let result = self.engine.reject_connection(&peer);
                self.reply(result, tx).await;
            }
            Command::StopReconnection(peer, tx) => {
                let result = self.engine.stop_reconnection(&peer);
                self.reply(result, tx).await;
            }
            Command::Disconnect(peer, tx) => {
                let result = self.engine.disconnect(&peer);
                self.reply(result, tx).await;
            }
            Command::DisconnectAll(tx) => {
                let result = self.engine.disconnect_all();
                self.reply(result, tx).await;
            }
            Command::SendMessage(message, tx) => {
                let result = self.engine.send_message(message);
                self.reply(result, tx).await;
            }
            Command::SendData(message, tx) => {
                let result = self.engine.send_data(message);
                self.reply(result, tx).await;
            }
            Command::SetName(name, tx) => {
                let result = self.engine.set_name(name);
                self.reply(result, tx).await;
            }
            Command::ConnectedPeers(tx) => {
                let _ = tx.send(self.engine.connected_peers());
            }
            Command::UniqueName(tx) => {
                let _ = tx.send(self.engine.unique_name().to_string());
            }
            Command::Destroy(tx) => {
                let effects = self.engine.destroy();
                self.perform(effects).await;
                let _ = tx.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn reply(&mut self, result: Result<Vec<Effect>>, tx: oneshot::Sender<Result<()>>) {
        match result {
            Ok(effects) => {
                self.perform(effects).await;
                let _ = tx.send(Ok(()));
            }
            Err(err) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    async fn perform(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.perform_one(effect).await;
        }
    }

    /// Execute one effect. Submission failures on attribute traffic come back
    /// as failed outcomes so the engine sees them like any other link report.
    async fn perform_one(&mut self, effect: Effect) {
        match effect {
            Effect::StartBroadcast { unique_name } => {
                if let Err(err) = self.control.start_broadcast(&unique_name).await {
                    warn!(%err, "start_broadcast failed");
                }
            }
            Effect::StopBroadcast => {
                if let Err(err) = self.control.stop_broadcast().await {
                    warn!(%err, "stop_broadcast failed");
                }
            }
            Effect::StartScan => {
                if let Err(err) = self.control.start_scan().await {
                    warn!(%err, "start_scan failed");
                }
            }
            Effect::StopScan => {
                if let Err(err) = self.control.stop_scan().await {
                    warn!(%err, "stop_scan failed");
                }
            }
            Effect::OpenLink { peer } => {
                if let Err(err) = self.link.open_link(&peer).await {
                    warn!(%err, "open_link failed");
                    if let Some(address) = peer.address().cloned() {
                        let _ = self.feedback.send(LinkEvent::HardwareDisconnected { address });
                    }
                }
            }
            Effect::CloseLink { address } => {
                if let Err(err) = self.link.close_link(&address).await {
                    warn!(%err, "close_link failed");
                    let _ = self.feedback.send(LinkEvent::HardwareDisconnected { address });
                }
            }
            Effect::Subscribe { address, attribute } => {
                if let Err(err) = self.link.subscribe(&address, attribute).await {
                    warn!(%err, ?attribute, "subscribe failed");
                }
            }
            Effect::WriteAttribute { address, attribute, value } => {
                if let Err(err) = self.link.write_attribute(&address, attribute, value).await {
                    warn!(%err, ?attribute, "write_attribute failed");
                    let _ = self.feedback.send(LinkEvent::WriteResult {
                        address,
                        attribute,
                        ok: false,
                        value: Vec::new(),
                    });
                }
            }
            Effect::ReadAttribute { address, attribute } => {
                if let Err(err) = self.link.read_attribute(&address, attribute).await {
                    warn!(%err, ?attribute, "read_attribute failed");
                    let _ = self.feedback.send(LinkEvent::ReadResult {
                        address,
                        attribute,
                        ok: false,
                        value: Vec::new(),
                    });
                }
            }
            Effect::NotifyAttribute { address, attribute, value, confirm } => {
                if let Err(err) = self
                    .link
                    .notify_attribute(&address, attribute, value, confirm)
                    .await
                {
                    warn!(%err, ?attribute, "notify_attribute failed");
                    if confirm {
                        let _ = self.feedback.send(LinkEvent::NotificationResult {
                            address,
                            attribute,
                            ok: false,
                        });
                    }
                }
            }
            Effect::RespondWrite { address, attribute, ok, value } => {
                if let Err(err) = self.link.respond_write(&address, attribute, ok, value).await {
                    warn!(%err, ?attribute, "respond_write failed");
                }
            }
            Effect::RespondRead { address, attribute, value } => {
                if let Err(err) = self.link.respond_read(&address, attribute, value).await {
                    warn!(%err, ?attribute, "respond_read failed");
                }
            }
            Effect::RequestMtu { address, mtu } => {
                if let Err(err) = self.link.request_mtu(&address, mtu).await {
                    warn!(%err, mtu, "request_mtu failed");
                }
            }
            Effect::RefreshDeviceCache { address } => {
                if let Err(err) = self.link.refresh_device_cache(&address).await {
                    debug!(%err, "refresh_device_cache failed");
                }
            }
            Effect::StartTimer { token, duration } => {
                let key: TimerKey = (token.role, token.channel, token.kind);
                let feedback = self.feedback.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = feedback.send(LinkEvent::TimerFired(token));
                });
                if let Some(previous) = self.timers.insert(key, task) {
                    previous.abort();
                }
            }
            Effect::CancelTimer { token } => {
                let key: TimerKey = (token.role, token.channel, token.kind);
                if let Some(task) = self.timers.remove(&key) {
                    task.abort();
                }
            }
            Effect::Emit(event) => {
                let _ = self.events.send(event);
            }
        }
    }
}
