use async_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use voicegate_protocol::{DiscoveredAddress, Ready, SessionDescription};

use crate::config::{DROP_LOG_INTERVAL, EVENT_QUEUE_CAPACITY};
use crate::control::ConnectionState;
use crate::error::SdkError;

/// Which socket an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control,
    Data,
}

/// Events emitted to the owning manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The relay accepted our identity and sent the session parameters.
    Ready(Ready),
    /// Channel encryption parameters; applying them is up to the owner.
    SessionDescription(SessionDescription),
    ClientConnect { ssrc: u32, user_id: String },
    ClientDisconnect { user_id: String },
    Speaking { ssrc: u32, speaking: u32 },
    Discovered(DiscoveredAddress),
    HeartbeatAck { latency: Option<Duration> },
    Debug(String),
    Error(SdkError),
    /// Non-fatal socket error.
    TransportError { channel: Channel, message: String },
    Closed { channel: Channel },
}

/// Owns the event stream; hands out receivers and sinks
pub struct EventHandler {
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventHandler {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    /// Keeps at most `capacity` undelivered events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, event_rx) = bounded(capacity);

        Self {
            event_tx,
            event_rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get event stream for emitted events
    pub fn event_stream(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    /// Sink for components to emit into
    pub fn sink(&self) -> EventSink {
        EventSink {
            event_tx: self.event_tx.clone(),
            event_rx: self.event_rx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Notify-capable field composed into each component.
#[derive(Clone)]
pub struct EventSink {
    event_tx: Sender<SessionEvent>,
    /// Used to evict the oldest event when nobody drains the stream.
    event_rx: Receiver<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn emit(&self, event: SessionEvent) {
        let event = match self.event_tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Closed(_)) => {
                warn!("event channel closed");
                return;
            }
        };

        let _ = self.event_rx.try_recv();
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % DROP_LOG_INTERVAL == 1 {
            warn!("event stream not drained, dropped {} oldest events", dropped);
        }
        if self.event_tx.try_send(event).is_err() {
            warn!("event channel full, dropping event");
        }
    }

    /// Logs through `tracing` and forwards the same text to observers.
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.emit(SessionEvent::Debug(message));
    }

    pub fn error(&self, err: SdkError) {
        warn!("{}", err);
        self.emit(SessionEvent::Error(err));
    }

    pub fn transport_error(&self, channel: Channel, message: impl Into<String>) {
        let message = message.into();
        warn!("[{:?}] transport error: {}", channel, message);
        self.emit(SessionEvent::TransportError { channel, message });
    }
}
