//! Control-channel handshake and dispatch.
//!
//! [`ControlChannel`] is driven by a single owner: it awaits
//! [`ControlChannel::next_input`] and feeds the result to
//! [`ControlChannel::handle`]. Socket I/O runs in a pump task per connection
//! attempt; every input it posts carries the attempt's epoch, and inputs from
//! an earlier attempt are dropped.

use async_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use voicegate_protocol::{
    CloseCode, DiscoveredAddress, Disposition, Hello, Identify, Inbound, Outbound, Ready,
    SelectProtocol, Speaking,
};

use crate::config::SessionConfig;
use crate::error::SdkError;
use crate::event::{Channel, EventSink, SessionEvent};
use crate::heartbeat::{HeartbeatTick, HeartbeatTimer, TickOutcome};
use crate::registry::{Participant, ParticipantRegistry};
use crate::transport::{ControlLink, Connector, LinkEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    AwaitingHello,
    Identifying,
    Ready,
    Disconnected(Disposition),
}

/// Where to connect and who to identify as.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub endpoint: String,
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

impl ConnectTarget {
    fn identify(&self) -> Identify {
        Identify {
            server_id: self.server_id.clone(),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            token: self.token.clone(),
        }
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("endpoint", &self.endpoint)
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Something for the channel to react to.
#[derive(Debug)]
pub enum ControlInput {
    Opened { epoch: u64, writer: Sender<String> },
    Link { epoch: u64, event: LinkEvent },
    OpenFailed { epoch: u64, reason: SdkError },
    Tick(HeartbeatTick),
}

/// What the owner has to do after an input was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Handshake finished; configure the data channel with these parameters.
    Configure(Ready),
    /// The connection dropped and a new attempt is under way. Anything
    /// negotiated on the old connection is void.
    LinkLost,
    /// The channel is dead.
    Terminated(SdkError),
}

enum Liveness {
    Alive { attempts: u32 },
    Dead { attempts: u32 },
}

pub struct ControlChannel<C: Connector> {
    connector: Arc<C>,
    target: ConnectTarget,
    state: ConnectionState,
    liveness: Liveness,
    max_attempts: u32,
    epoch: u64,
    link: Option<ControlLink>,
    pump: Option<JoinHandle<()>>,
    heartbeat: HeartbeatTimer,
    registry: ParticipantRegistry,
    events: EventSink,
    inbox_tx: Sender<ControlInput>,
    inbox_rx: Receiver<ControlInput>,
    tick_rx: Receiver<HeartbeatTick>,
    ssrc: Option<u32>,
    encryption_mode: String,
}

impl<C: Connector> ControlChannel<C> {
    pub fn new(
        connector: Arc<C>,
        target: ConnectTarget,
        config: &SessionConfig,
        registry: ParticipantRegistry,
        events: EventSink,
    ) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        let (tick_tx, tick_rx) = unbounded();

        Self {
            connector,
            target,
            state: ConnectionState::Idle,
            liveness: Liveness::Alive { attempts: 0 },
            max_attempts: config.max_connect_attempts,
            epoch: 0,
            link: None,
            pump: None,
            heartbeat: HeartbeatTimer::new(tick_tx, config.missed_ack_policy, events.clone()),
            registry,
            events,
            inbox_tx,
            inbox_rx,
            tick_rx,
            ssrc: None,
            encryption_mode: config.encryption_mode.clone(),
        }
    }

    /// Starts a connection attempt. Refused once the channel is dead; the
    /// attempt that would exceed the budget kills the channel instead.
    pub fn connect(&mut self) -> Result<(), SdkError> {
        let attempts = match self.liveness {
            Liveness::Dead { .. } => {
                self.events.debug("[control] Channel is dead, not connecting");
                return Err(SdkError::Dead);
            }
            Liveness::Alive { attempts } => attempts,
        };

        if self.link.is_some() || self.pump.is_some() {
            self.reset();
        }

        if attempts >= self.max_attempts {
            self.events.debug(format!(
                "[control] Giving up after {attempts} connection attempts"
            ));
            self.liveness = Liveness::Dead { attempts };
            self.set_state(ConnectionState::Disconnected(Disposition::Fatal));
            return Err(SdkError::ReconnectBudgetExhausted { attempts });
        }

        self.liveness = Liveness::Alive {
            attempts: attempts + 1,
        };
        self.epoch += 1;
        self.set_state(ConnectionState::Connecting);
        self.events.debug(format!(
            "[control] Connecting to {} (attempt {}/{})",
            self.target.endpoint,
            attempts + 1,
            self.max_attempts
        ));

        let epoch = self.epoch;
        let connector = Arc::clone(&self.connector);
        let endpoint = self.target.endpoint.clone();
        let inbox = self.inbox_tx.clone();

        self.pump = Some(tokio::spawn(async move {
            let halves = match connector.open(&endpoint).await {
                Ok(halves) => halves,
                Err(reason) => {
                    let _ = inbox.send(ControlInput::OpenFailed { epoch, reason }).await;
                    return;
                }
            };

            if inbox
                .send(ControlInput::Opened {
                    epoch,
                    writer: halves.writer,
                })
                .await
                .is_err()
            {
                return;
            }

            loop {
                let event = halves
                    .reader
                    .recv()
                    .await
                    .unwrap_or(LinkEvent::Closed(None));
                let closed = matches!(event, LinkEvent::Closed(_));
                if inbox.send(ControlInput::Link { epoch, event }).await.is_err() || closed {
                    break;
                }
            }
            debug!("[control] Pump for attempt {} stopped", epoch);
        }));

        Ok(())
    }

    /// Next input from the socket or the heartbeat schedule.
    pub async fn next_input(&self) -> Option<ControlInput> {
        tokio::select! {
            input = self.inbox_rx.recv() => input.ok(),
            tick = self.tick_rx.recv() => tick.ok().map(ControlInput::Tick),
        }
    }

    pub fn handle(&mut self, input: ControlInput) -> Option<ControlAction> {
        match input {
            ControlInput::Opened { epoch, writer } if epoch == self.epoch => {
                self.on_open(ControlLink::new(writer));
                None
            }
            ControlInput::Link { epoch, event } if epoch == self.epoch => match event {
                LinkEvent::Frame(text) => self.on_frame(&text),
                LinkEvent::Closed(code) => self.on_close(code),
            },
            ControlInput::OpenFailed { epoch, reason } if epoch == self.epoch => {
                self.events
                    .transport_error(Channel::Control, reason.to_string());
                self.on_close(None)
            }
            ControlInput::Tick(tick) => self.on_tick(tick),
            stale => {
                debug!("[control] Dropping input from a previous connection: {:?}", stale);
                None
            }
        }
    }

    fn on_open(&mut self, link: ControlLink) {
        self.set_state(ConnectionState::AwaitingHello);
        self.events.debug("[control] Connected, sending identify");
        if let Err(e) = link.send(&Outbound::Identify(self.target.identify())) {
            self.events.transport_error(Channel::Control, e.to_string());
        }
        self.link = Some(link);
    }

    fn on_frame(&mut self, text: &str) -> Option<ControlAction> {
        let message = match Inbound::decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.events
                    .debug(format!("[control] Dropping malformed message: {e}"));
                return None;
            }
        };

        match message {
            Inbound::Hello(hello) => self.on_hello(&hello),
            Inbound::Ready(ready) => return self.on_ready(ready),
            Inbound::SessionDescription(description) => {
                self.events.debug(format!(
                    "[control] Received session description, mode {}",
                    description.mode
                ));
                self.events
                    .emit(SessionEvent::SessionDescription(description));
            }
            Inbound::ClientConnect(client) => {
                self.registry
                    .upsert(client.audio_ssrc, Participant::new(client.user_id.clone(), 0));
                self.events.emit(SessionEvent::ClientConnect {
                    ssrc: client.audio_ssrc,
                    user_id: client.user_id,
                });
            }
            Inbound::ClientDisconnect(client) => {
                self.events.emit(SessionEvent::ClientDisconnect {
                    user_id: client.user_id,
                });
            }
            Inbound::Speaking(speaking) => self.on_speaking(speaking),
            Inbound::HeartbeatAck => {
                let latency = self.heartbeat.ack();
                self.events.emit(SessionEvent::HeartbeatAck { latency });
            }
            Inbound::Unknown(op) => {
                self.events
                    .debug(format!("[control] Ignoring message with opcode {op}"));
            }
            other => {
                self.events.debug(format!("[control] Ignoring {other:?}"));
            }
        }
        None
    }

    fn on_hello(&mut self, hello: &Hello) {
        if self.state != ConnectionState::AwaitingHello {
            self.events.debug(format!(
                "[control] Dropping Hello received in state {:?}",
                self.state
            ));
            return;
        }
        let Some(interval) = hello.interval() else {
            self.events.debug(format!(
                "[control] Dropping Hello with unusable interval {}",
                hello.heartbeat_interval
            ));
            return;
        };

        match self.heartbeat.set_interval(interval) {
            Ok(()) => self.set_state(ConnectionState::Identifying),
            Err(e) => self.events.debug(format!("[control] Dropping Hello: {e}")),
        }
    }

    fn on_ready(&mut self, ready: Ready) -> Option<ControlAction> {
        if self.state != ConnectionState::Identifying {
            self.events.debug(format!(
                "[control] Dropping Ready received in state {:?}",
                self.state
            ));
            return None;
        }

        self.ssrc = Some(ready.ssrc);
        self.set_state(ConnectionState::Ready);
        self.events.debug(format!(
            "[control] Ready: ssrc {}, media endpoint {}:{}",
            ready.ssrc, ready.ip, ready.port
        ));
        self.events.emit(SessionEvent::Ready(ready.clone()));
        Some(ControlAction::Configure(ready))
    }

    fn on_speaking(&mut self, speaking: Speaking) {
        if !self.registry.set_speaking(speaking.ssrc, speaking.speaking) {
            if let Some(user_id) = &speaking.user_id {
                self.registry.upsert(
                    speaking.ssrc,
                    Participant::new(user_id.clone(), speaking.speaking),
                );
            }
        }
        self.events.emit(SessionEvent::Speaking {
            ssrc: speaking.ssrc,
            speaking: speaking.speaking,
        });
    }

    fn on_close(&mut self, code: Option<u16>) -> Option<ControlAction> {
        self.drop_link();

        if let Some(close) = code.and_then(|c| CloseCode::try_from(c).ok()) {
            if close.disposition() == Disposition::Fatal {
                let err = SdkError::FatalClose(close);
                self.liveness = Liveness::Dead {
                    attempts: self.attempts(),
                };
                self.set_state(ConnectionState::Disconnected(Disposition::Fatal));
                self.events.error(err.clone());
                return Some(ControlAction::Terminated(err));
            }
        }

        self.events.debug(format!(
            "[control] Connection lost (code {}), reconnecting",
            code.map_or_else(|| "none".to_string(), |c| c.to_string())
        ));
        self.set_state(ConnectionState::Disconnected(Disposition::Recoverable));

        match self.connect() {
            Ok(()) => Some(ControlAction::LinkLost),
            Err(err) => {
                self.events.error(err.clone());
                Some(ControlAction::Terminated(err))
            }
        }
    }

    fn on_tick(&mut self, tick: HeartbeatTick) -> Option<ControlAction> {
        match self.heartbeat.on_tick(tick, self.link.as_ref()) {
            TickOutcome::Sent | TickOutcome::Stale => None,
            TickOutcome::MissedAckLimit { missed } => {
                self.events.debug(format!(
                    "[control] {missed} heartbeats unacknowledged, forcing reconnect"
                ));
                self.on_close(None)
            }
            TickOutcome::Failed(e) => {
                self.events.transport_error(Channel::Control, e.to_string());
                None
            }
        }
    }

    /// Tells the relay where to send media and which encryption mode to use.
    pub fn select_protocol(&self, local: &DiscoveredAddress) -> Result<(), SdkError> {
        let link = self.link.as_ref().ok_or(SdkError::NotConnected)?;
        self.events.debug(format!(
            "[control] Selecting protocol, local address {}:{}",
            local.address, local.port
        ));
        link.send(&Outbound::SelectProtocol(SelectProtocol::udp(
            local.address.clone(),
            local.port,
            &self.encryption_mode,
        )))
    }

    pub fn set_speaking(&self, speaking: u32) -> Result<(), SdkError> {
        let link = self.link.as_ref().ok_or(SdkError::NotConnected)?;
        let ssrc = self.ssrc.ok_or(SdkError::NotConnected)?;
        link.send(&Outbound::Speaking(Speaking {
            user_id: None,
            ssrc,
            speaking,
            delay: 0,
        }))
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat.reset();
    }

    /// Closes the socket if open, clears the heartbeat and returns to `Idle`.
    /// The attempt counter and a dead channel stay as they are.
    pub fn reset(&mut self) {
        self.drop_link();
        // inputs still queued for the old connection are now stale
        self.epoch += 1;
        self.set_state(ConnectionState::Idle);
    }

    fn drop_link(&mut self) {
        self.heartbeat.reset();
        self.ssrc = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.link.take().is_some() {
            self.events.debug("[control] Socket closed");
            self.events.emit(SessionEvent::Closed {
                channel: Channel::Control,
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("[control] {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.emit(SessionEvent::StateChanged(state));
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.liveness, Liveness::Dead { .. })
    }

    /// Connection attempts made by this channel so far.
    pub fn attempts(&self) -> u32 {
        match self.liveness {
            Liveness::Alive { attempts } | Liveness::Dead { attempts } => attempts,
        }
    }

    pub fn heartbeat(&self) -> &HeartbeatTimer {
        &self.heartbeat
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }
}

impl<C: Connector> Drop for ControlChannel<C> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
