use async_channel::{Sender, TrySendError};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use voicegate_protocol::discovery::{self, DiscoveredAddress};

use crate::config::{DROP_LOG_INTERVAL, PACKET_BUFFER_SIZE};
use crate::error::SdkError;
use crate::event::{Channel, EventSink, SessionEvent};

/// UDP socket to the relay's media endpoint
///
/// Cloning yields another handle to the same socket. The local address is
/// discovered once; a new connection attempt gets a new `DataChannel`.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Mutex<Option<SocketAddr>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: OnceLock<DiscoveredAddress>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    media_tx: Sender<Vec<u8>>,
    discovery_timeout: Duration,
    events: EventSink,
}

impl DataChannel {
    /// Datagrams received after discovery are forwarded to `media_tx`; they
    /// are dropped while it is full.
    pub fn new(media_tx: Sender<Vec<u8>>, discovery_timeout: Duration, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote: Mutex::new(None),
                socket: Mutex::new(None),
                local: OnceLock::new(),
                receiver: Mutex::new(None),
                media_tx,
                discovery_timeout,
                events,
            }),
        }
    }

    /// Records the relay's media endpoint. Must precede `discover` and `send`.
    pub fn configure(&self, address: &str, port: u16) -> Result<(), SdkError> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| SdkError::InvalidEndpoint(format!("{address}:{port}")))?;
        let remote = SocketAddr::new(ip, port);

        *lock(&self.inner.remote)? = Some(remote);
        self.inner
            .events
            .debug(format!("[data] Configured remote endpoint {remote}"));
        Ok(())
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote.lock().ok().and_then(|remote| *remote)
    }

    pub fn local_address(&self) -> Option<DiscoveredAddress> {
        self.inner.local.get().cloned()
    }

    pub fn is_open(&self) -> bool {
        self.inner.socket.lock().is_ok_and(|socket| socket.is_some())
    }

    /// Opens the socket, sends the probe and parses the first datagram that
    /// comes back as our external address. Later datagrams are media.
    pub async fn discover(&self) -> Result<DiscoveredAddress, SdkError> {
        if let Some(local) = self.inner.local.get() {
            return Ok(local.clone());
        }
        let remote = (*lock(&self.inner.remote)?).ok_or(SdkError::NotConfigured)?;
        let socket = self.open_socket(remote).await?;

        self.send(&discovery::probe()).await?;

        let mut buf = [0u8; PACKET_BUFFER_SIZE];
        let n = tokio::time::timeout(self.inner.discovery_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| SdkError::Timeout("discovery reply".to_string()))?
            .map_err(|e| {
                self.inner.events.transport_error(Channel::Data, e.to_string());
                SdkError::from(e)
            })?;

        let discovered = DiscoveredAddress::parse(&buf[..n])?;
        let local = self.inner.local.get_or_init(|| discovered).clone();
        self.inner.events.debug(format!(
            "[data] Discovered local address {}:{}",
            local.address, local.port
        ));
        self.inner.events.emit(SessionEvent::Discovered(local.clone()));

        self.spawn_receiver(socket)?;
        Ok(local)
    }

    /// Sends one datagram. Only the discovery probe may go out before the
    /// local address is known.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SdkError> {
        let socket = lock(&self.inner.socket)?.clone().ok_or(SdkError::NotReady)?;
        if self.inner.local.get().is_none() && !discovery::is_probe(payload) {
            return Err(SdkError::MissingLocalInfo);
        }

        socket.send(payload).await.map_err(|e| {
            self.inner.events.transport_error(Channel::Data, e.to_string());
            SdkError::from(e)
        })?;
        Ok(())
    }

    /// Closes the socket if open; repeated calls are no-ops.
    pub fn shutdown(&self) {
        self.inner.events.debug("[data] Shutdown");

        if let Ok(mut receiver) = self.inner.receiver.lock() {
            if let Some(handle) = receiver.take() {
                handle.abort();
            }
        }

        self.inner.close_socket();
    }

    async fn open_socket(&self, remote: SocketAddr) -> Result<Arc<UdpSocket>, SdkError> {
        if let Some(socket) = lock(&self.inner.socket)?.clone() {
            return Ok(socket);
        }

        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| SdkError::ConnectionFailed(format!("UDP bind failed: {e}")))?;
        socket
            .connect(remote)
            .await
            .map_err(|e| SdkError::ConnectionFailed(format!("UDP connect failed: {e}")))?;
        debug!("[data] UDP connected to {}", remote);

        let socket = Arc::new(socket);
        *lock(&self.inner.socket)? = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn spawn_receiver(&self, socket: Arc<UdpSocket>) -> Result<(), SdkError> {
        let media_tx = self.inner.media_tx.clone();
        let events = self.inner.events.clone();
        let inner = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; PACKET_BUFFER_SIZE];
            let mut dropped: u64 = 0;

            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        let datagram = &buf[..n];
                        // Relays may resend the discovery reply; it is not media.
                        if discovery::looks_like_reply(datagram) {
                            events.debug("[data] Dropping repeated discovery reply");
                            continue;
                        }
                        match media_tx.try_send(datagram.to_vec()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                dropped += 1;
                                if dropped % DROP_LOG_INTERVAL == 1 {
                                    warn!(
                                        "[data] Media stream not drained, dropped {} datagrams",
                                        dropped
                                    );
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("[data] Media stream closed");
                                break;
                            }
                        }
                    }
                    Err(e) if is_transient(e.kind()) => {
                        events.transport_error(Channel::Data, e.to_string());
                    }
                    Err(e) => {
                        events.transport_error(Channel::Data, e.to_string());
                        if let Some(inner) = inner.upgrade() {
                            inner.close_socket();
                        }
                        break;
                    }
                }
            }
        });

        *lock(&self.inner.receiver)? = Some(handle);
        Ok(())
    }
}

impl Inner {
    /// Emits `Closed` only for the call that actually released the socket.
    fn close_socket(&self) {
        let closed = self
            .socket
            .lock()
            .is_ok_and(|mut socket| socket.take().is_some());
        if closed {
            self.events.debug("[data] Socket closed");
            self.events.emit(SessionEvent::Closed {
                channel: Channel::Data,
            });
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(receiver) = self.receiver.get_mut() {
            if let Some(handle) = receiver.take() {
                handle.abort();
            }
        }
    }
}

/// ICMP errors surface on a connected UDP socket and pass once the relay
/// is reachable again; anything else means the socket is unusable.
fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, SdkError> {
    mutex.lock().map_err(|_| SdkError::LockError)
}
