//! One logical voice connection: control channel, data channel and the
//! participants seen on them.
//!
//! [`VoiceSession`] is a handle. A driver task owns the channels and
//! processes owner commands, control inputs, heartbeat ticks and discovery
//! results one at a time.

use async_channel::{bounded, unbounded, Receiver, Sender};
use std::future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voicegate_protocol::{DiscoveredAddress, Ready};

use crate::config::{SessionConfig, MEDIA_QUEUE_CAPACITY};
use crate::control::{ConnectTarget, ConnectionState, ControlAction, ControlChannel, ControlInput};
use crate::data::DataChannel;
use crate::error::SdkError;
use crate::event::{EventHandler, EventSink, SessionEvent};
use crate::registry::ParticipantRegistry;
use crate::transport::Connector;

enum Command {
    Connect(ConnectTarget),
    Disconnect,
    SetSpeaking(u32),
    Shutdown(oneshot::Sender<()>),
}

/// Snapshot the driver publishes for the handle's accessors.
struct Status {
    state: ConnectionState,
    latency: Option<Duration>,
    data: Option<DataChannel>,
    ended: bool,
}

struct Discovery {
    epoch: u64,
    result: Result<DiscoveredAddress, SdkError>,
}

/// Voice session handle
///
/// Dropping it tears the session down.
pub struct VoiceSession {
    commands: Sender<Command>,
    status: Arc<Mutex<Status>>,
    registry: ParticipantRegistry,
    event_handler: EventHandler,
    media_rx: Receiver<Vec<u8>>,
}

impl VoiceSession {
    /// Creates the session and spawns its driver. Must be called inside a
    /// tokio runtime.
    pub fn new<C: Connector>(connector: C, config: SessionConfig) -> Self {
        let (commands, command_rx) = unbounded();
        let (media_tx, media_rx) = bounded(MEDIA_QUEUE_CAPACITY);
        let (discovered_tx, discovered_rx) = unbounded();
        let event_handler = EventHandler::new();
        let registry = ParticipantRegistry::new();
        let status = Arc::new(Mutex::new(Status {
            state: ConnectionState::Idle,
            latency: None,
            data: None,
            ended: false,
        }));

        let driver = SessionDriver {
            connector: Arc::new(connector),
            config,
            control: None,
            data: None,
            data_epoch: 0,
            discovery: None,
            discovered_tx,
            discovered_rx,
            commands: command_rx,
            status: Arc::clone(&status),
            registry: registry.clone(),
            events: event_handler.sink(),
            media_tx,
        };
        tokio::spawn(driver.run());

        Self {
            commands,
            status,
            registry,
            event_handler,
            media_rx,
        }
    }

    /// Starts the handshake with a fresh control channel, replacing any
    /// current connection. Progress is reported through [`Self::event_stream`].
    pub fn connect(&self, target: ConnectTarget) -> Result<(), SdkError> {
        if self.is_ended() {
            return Err(SdkError::SessionEnded);
        }
        self.command(Command::Connect(target))
    }

    /// Closes both channels. The session can be connected again.
    pub fn disconnect(&self) -> Result<(), SdkError> {
        self.command(Command::Disconnect)
    }

    /// Announces our speaking state once the session is Ready.
    pub fn set_speaking(&self, speaking: u32) -> Result<(), SdkError> {
        self.command(Command::SetSpeaking(speaking))
    }

    /// Tears the session down and waits for the driver to finish.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.try_send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Sends one datagram to the relay's media endpoint.
    pub async fn send_media(&self, payload: &[u8]) -> Result<(), SdkError> {
        let data = self
            .status
            .lock()
            .map_err(|_| SdkError::LockError)?
            .data
            .clone()
            .ok_or(SdkError::NotReady)?;
        data.send(payload).await
    }

    /// Get event stream for emitted events
    pub fn event_stream(&self) -> Receiver<SessionEvent> {
        self.event_handler.event_stream()
    }

    /// Datagrams received from the relay after discovery.
    pub fn media_stream(&self) -> Receiver<Vec<u8>> {
        self.media_rx.clone()
    }

    pub fn participants(&self) -> ParticipantRegistry {
        self.registry.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status
            .lock()
            .map_or(ConnectionState::Idle, |status| status.state)
    }

    /// Last measured heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        self.status.lock().ok().and_then(|status| status.latency)
    }

    pub fn local_address(&self) -> Option<DiscoveredAddress> {
        self.status
            .lock()
            .ok()
            .and_then(|status| status.data.as_ref().and_then(DataChannel::local_address))
    }

    /// True once a lifecycle failure or `shutdown` ended the session.
    pub fn is_ended(&self) -> bool {
        self.status.lock().map_or(true, |status| status.ended)
    }

    fn command(&self, command: Command) -> Result<(), SdkError> {
        self.commands
            .try_send(command)
            .map_err(|_| SdkError::SessionEnded)
    }
}

struct SessionDriver<C: Connector> {
    connector: Arc<C>,
    config: SessionConfig,
    control: Option<ControlChannel<C>>,
    data: Option<DataChannel>,
    /// Bumped whenever the data channel is replaced; stale discovery results
    /// are dropped.
    data_epoch: u64,
    discovery: Option<JoinHandle<()>>,
    discovered_tx: Sender<Discovery>,
    discovered_rx: Receiver<Discovery>,
    commands: Receiver<Command>,
    status: Arc<Mutex<Status>>,
    registry: ParticipantRegistry,
    events: EventSink,
    media_tx: Sender<Vec<u8>>,
}

impl<C: Connector> SessionDriver<C> {
    async fn run(mut self) {
        debug!("[session] Driver started");

        loop {
            let keep_running = tokio::select! {
                command = self.commands.recv() => match command {
                    Ok(Command::Shutdown(done)) => {
                        self.teardown();
                        self.end();
                        let _ = done.send(());
                        false
                    }
                    Ok(command) => self.on_command(command),
                    Err(_) => {
                        debug!("[session] Handle dropped");
                        self.teardown();
                        false
                    }
                },
                Some(input) = next_control(self.control.as_ref()) => self.on_control(input),
                Ok(discovery) = self.discovered_rx.recv() => {
                    self.on_discovery(discovery);
                    true
                }
            };

            self.publish();
            if !keep_running {
                break;
            }
        }

        debug!("[session] Driver stopped");
    }

    /// Returns false once the session has ended.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(target) => {
                self.teardown();
                info!("[session] Connecting to {}", target.endpoint);

                let mut control = ControlChannel::new(
                    Arc::clone(&self.connector),
                    target,
                    &self.config,
                    self.registry.clone(),
                    self.events.clone(),
                );
                let started = control.connect();
                self.control = Some(control);
                if let Err(err) = started {
                    self.events.error(err.clone());
                    return self.on_action(ControlAction::Terminated(err));
                }
            }
            Command::Disconnect => {
                info!("[session] Disconnecting");
                self.teardown();
            }
            Command::SetSpeaking(speaking) => {
                let result = self
                    .control
                    .as_ref()
                    .ok_or(SdkError::NotConnected)
                    .and_then(|control| control.set_speaking(speaking));
                if let Err(err) = result {
                    self.events.error(err);
                }
            }
            Command::Shutdown(_) => {}
        }
        true
    }

    fn on_control(&mut self, input: ControlInput) -> bool {
        let action = self.control.as_mut().and_then(|control| control.handle(input));
        match action {
            Some(action) => self.on_action(action),
            None => true,
        }
    }

    /// Returns false once the session has ended.
    fn on_action(&mut self, action: ControlAction) -> bool {
        match action {
            ControlAction::Configure(ready) => {
                self.start_data(&ready);
                true
            }
            ControlAction::LinkLost => {
                self.stop_data();
                true
            }
            ControlAction::Terminated(err) => {
                warn!("[session] Ended: {}", err);
                self.teardown();
                self.end();
                false
            }
        }
    }

    fn start_data(&mut self, ready: &Ready) {
        self.stop_data();

        let data = DataChannel::new(
            self.media_tx.clone(),
            self.config.discovery_timeout,
            self.events.clone(),
        );
        if let Err(err) = data.configure(&ready.ip, ready.port) {
            self.events.error(err);
            return;
        }

        let epoch = self.data_epoch;
        let discovered_tx = self.discovered_tx.clone();
        let discovering = data.clone();
        self.discovery = Some(tokio::spawn(async move {
            let result = discovering.discover().await;
            let _ = discovered_tx.send(Discovery { epoch, result }).await;
        }));
        self.data = Some(data);
    }

    fn on_discovery(&mut self, discovery: Discovery) {
        if discovery.epoch != self.data_epoch {
            debug!("[session] Dropping discovery result for a replaced data channel");
            return;
        }
        self.discovery = None;

        let result = discovery.result.and_then(|local| {
            self.control
                .as_ref()
                .ok_or(SdkError::NotConnected)
                .and_then(|control| control.select_protocol(&local))
        });
        if let Err(err) = result {
            self.events.error(err);
        }
    }

    fn stop_data(&mut self) {
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
        if let Some(data) = self.data.take() {
            data.shutdown();
        }
        self.data_epoch += 1;
    }

    /// Heartbeat first, then the data socket, then the control socket.
    fn teardown(&mut self) {
        if let Some(control) = self.control.as_mut() {
            control.stop_heartbeat();
        }
        self.stop_data();
        if let Some(mut control) = self.control.take() {
            if !control.is_dead() {
                control.reset();
            }
            self.set_status(|status| status.state = control.state());
        }
    }

    fn end(&mut self) {
        self.set_status(|status| status.ended = true);
    }

    fn publish(&self) {
        let control = self.control.as_ref();
        let data = self.data.clone();
        self.set_status(|status| {
            if let Some(control) = control {
                status.state = control.state();
                if let Some(latency) = control.heartbeat().latency() {
                    status.latency = Some(latency);
                }
            }
            status.data = data;
        });
    }

    fn set_status(&self, update: impl FnOnce(&mut Status)) {
        match self.status.lock() {
            Ok(mut status) => update(&mut status),
            Err(_) => warn!("[session] Status lock poisoned"),
        }
    }
}

async fn next_control<C: Connector>(control: Option<&ControlChannel<C>>) -> Option<ControlInput> {
    match control {
        Some(control) => control.next_input().await,
        None => future::pending().await,
    }
}
