//! Control-channel transports.
//!
//! A [`Connector`] opens one message-based, ordered connection and returns its
//! two halves: a writer taking JSON texts and a reader yielding [`LinkEvent`]s.
//! Dropping the writer closes the connection.

use async_channel::{unbounded, Receiver, Sender};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};
use voicegate_protocol::Outbound;

use crate::config::{CONNECT_TIMEOUT_SECS, PACKET_BUFFER_SIZE};
use crate::error::SdkError;

/// Largest partial frame kept while waiting for its terminator.
const MAX_FRAME_SIZE: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One complete inbound message.
    Frame(String),
    /// The connection ended, with the peer's close code if the transport has one.
    Closed(Option<u16>),
}

pub struct LinkHalves {
    pub writer: Sender<String>,
    pub reader: Receiver<LinkEvent>,
}

/// Opens control connections to the relay.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<LinkHalves, SdkError>> + Send;
}

/// Write side of an open control connection.
#[derive(Clone)]
pub(crate) struct ControlLink {
    writer: Sender<String>,
}

impl ControlLink {
    pub(crate) fn new(writer: Sender<String>) -> Self {
        Self { writer }
    }

    /// Encodes and queues one message; fire-and-forget from the caller's view.
    pub(crate) fn send(&self, message: &Outbound) -> Result<(), SdkError> {
        let text = message.encode()?;
        self.writer
            .try_send(text)
            .map_err(|_| SdkError::Disconnected)
    }
}

/// WebSocket transport carrying one JSON message per text frame. The only
/// transport that reports the relay's close code.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(CONNECT_TIMEOUT_SECS))
    }
}

impl Connector for WsConnector {
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<LinkHalves, SdkError>> + Send {
        let endpoint = endpoint.to_string();
        let connect_timeout = self.connect_timeout;

        async move {
            debug!("[control] WebSocket connect to {}", endpoint);
            let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(endpoint.as_str()))
                .await
                .map_err(|_| SdkError::ConnectionFailed("Operation timed out".to_string()))?
                .map_err(|e| SdkError::ConnectionFailed(e.to_string()))?;
            debug!("[control] WebSocket connected to {}", endpoint);

            let (writer, writer_rx) = unbounded();
            let (event_tx, reader) = unbounded();
            spawn_ws_handler(ws, writer_rx, event_tx);

            Ok(LinkHalves { writer, reader })
        }
    }
}

fn spawn_ws_handler(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    writer_rx: Receiver<String>,
    event_tx: Sender<LinkEvent>,
) {
    tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        let mut close_code = None;

        loop {
            tokio::select! {
                result = writer_rx.recv() => {
                    let Ok(text) = result else {
                        debug!("[control] writer dropped, closing websocket");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("[control] write error: {}", e);
                        break;
                    }
                }

                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx.send(LinkEvent::Frame(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_code = frame.map(|frame| u16::from(frame.code));
                            debug!("[control] websocket closed by peer: {:?}", close_code);
                            break;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("[control] Dropping {} byte binary frame", data.len());
                        }
                        // ping and pong are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("[control] read error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(LinkEvent::Closed(close_code)).await;
        debug!("[control] WebSocket handler stopped");
    });
}

/// TCP transport carrying one JSON message per line. Closures never carry a
/// code.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(CONNECT_TIMEOUT_SECS))
    }
}

impl Connector for TcpConnector {
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<LinkHalves, SdkError>> + Send {
        let endpoint = endpoint.to_string();
        let connect_timeout = self.connect_timeout;

        async move {
            debug!("[control] TCP connect to {}", endpoint);
            let socket = tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
                .await
                .map_err(|_| SdkError::ConnectionFailed("Operation timed out".to_string()))?
                .map_err(|e| SdkError::ConnectionFailed(e.to_string()))?;
            debug!("[control] TCP connected to {}", endpoint);

            let (writer, writer_rx) = unbounded();
            let (event_tx, reader) = unbounded();
            spawn_tcp_handler(socket, writer_rx, event_tx);

            Ok(LinkHalves { writer, reader })
        }
    }
}

fn spawn_tcp_handler(mut socket: TcpStream, writer_rx: Receiver<String>, event_tx: Sender<LinkEvent>) {
    tokio::spawn(async move {
        let mut read_buf = [0u8; PACKET_BUFFER_SIZE];
        // Accumulates partial lines across reads
        let mut accumulator: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                result = writer_rx.recv() => {
                    let Ok(text) = result else {
                        debug!("[control] writer dropped, closing socket");
                        break;
                    };
                    let mut line = text.into_bytes();
                    line.push(b'\n');
                    if let Err(e) = socket.write_all(&line).await {
                        error!("[control] write error: {}", e);
                        break;
                    }
                }

                result = socket.read(&mut read_buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            accumulator.extend_from_slice(&read_buf[..n]);
                            if !forward_lines(&mut accumulator, &event_tx).await {
                                break;
                            }
                            if accumulator.len() > MAX_FRAME_SIZE {
                                error!("[control] frame exceeds {} bytes", MAX_FRAME_SIZE);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("[control] read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = event_tx.send(LinkEvent::Closed(None)).await;
        debug!("[control] TCP handler stopped");
    });
}

/// Forwards every complete line; returns false once the reader is gone.
async fn forward_lines(accumulator: &mut Vec<u8>, event_tx: &Sender<LinkEvent>) -> bool {
    while let Some(pos) = accumulator.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = accumulator.drain(..=pos).collect();
        line.pop();
        let text = match String::from_utf8(line) {
            Ok(text) => text,
            Err(e) => {
                warn!("[control] Dropping frame with invalid UTF-8: {}", e.utf8_error());
                continue;
            }
        };
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            continue;
        }
        if event_tx.send(LinkEvent::Frame(text.to_string())).await.is_err() {
            return false;
        }
    }
    true
}

/// In-process transport; the server side of each connection is handed out by
/// [`MemoryConnector::accept`].
#[derive(Clone)]
pub struct MemoryConnector {
    accepted_tx: Sender<MemoryPeer>,
    accepted_rx: Receiver<MemoryPeer>,
    opens: Arc<AtomicU32>,
    refusing: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (accepted_tx, accepted_rx) = unbounded();

        Self {
            accepted_tx,
            accepted_rx,
            opens: Arc::new(AtomicU32::new(0)),
            refusing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Waits for the next connection opened through this connector.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accepted_rx.recv().await.ok()
    }

    /// Number of `open` calls so far, refused ones included.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// While set, every `open` fails with `ConnectionFailed`.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryConnector {
    fn open(&self, endpoint: &str) -> impl Future<Output = Result<LinkHalves, SdkError>> + Send {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self.refusing.load(Ordering::SeqCst);
        let accepted_tx = self.accepted_tx.clone();
        let endpoint = endpoint.to_string();

        async move {
            if refused {
                return Err(SdkError::ConnectionFailed(format!("{endpoint}: connection refused")));
            }

            let (writer, incoming) = unbounded();
            let (outgoing, reader) = unbounded();
            accepted_tx
                .send(MemoryPeer {
                    endpoint,
                    incoming,
                    outgoing,
                })
                .await
                .map_err(|_| SdkError::Disconnected)?;

            Ok(LinkHalves { writer, reader })
        }
    }
}

/// Server side of an in-memory control connection.
pub struct MemoryPeer {
    pub endpoint: String,
    incoming: Receiver<String>,
    outgoing: Sender<LinkEvent>,
}

impl MemoryPeer {
    /// Next message written by the client; `None` once the client closed.
    pub async fn recv(&self) -> Option<String> {
        self.incoming.recv().await.ok()
    }

    pub async fn send_frame(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(LinkEvent::Frame(text.into())).await.is_ok()
    }

    pub async fn close(&self, code: Option<u16>) -> bool {
        self.outgoing.send(LinkEvent::Closed(code)).await.is_ok()
    }

    /// True once the client dropped its writer.
    pub fn is_closed_by_client(&self) -> bool {
        self.incoming.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[tokio::test]
    async fn tcp_frames_are_split_on_newlines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // one frame split across writes, two frames in one write
            socket.write_all(b"{\"op\":8,").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"\"d\":{}}\r\n{\"op\":6}\n{\"op\":2}\n").await.unwrap();

            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap()
        });

        let link = TcpConnector::default().open(&addr.to_string()).await.unwrap();
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":8,\"d\":{}}".to_string())));
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":6}".to_string())));
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":2}".to_string())));

        link.writer.send("{\"op\":3,\"d\":1}".to_string()).await.unwrap();
        let written = server.await.unwrap();
        assert_eq!(written.as_deref(), Some("{\"op\":3,\"d\":1}"));

        // server dropped its socket after reading
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Closed(None)));
    }

    #[tokio::test]
    async fn tcp_frames_with_invalid_utf8_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"{\"op\":\xff\xfe}\n{\"op\":6}\n").await.unwrap();
            socket
        });

        let link = TcpConnector::default().open(&addr.to_string()).await.unwrap();
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":6}".to_string())));

        drop(server.await.unwrap());
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Closed(None)));
    }

    #[tokio::test]
    async fn websocket_text_frames_and_close_code_are_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Text("{\"op\":8,\"d\":{}}".to_string())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text("{\"op\":6}".to_string())).await.unwrap();

            let written = ws.next().await.unwrap().unwrap();
            ws.close(Some(CloseFrame {
                code: WsCloseCode::from(4006),
                reason: "session invalid".into(),
            }))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
            written
        });

        let link = WsConnector::default().open(&format!("ws://{addr}")).await.unwrap();
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":8,\"d\":{}}".to_string())));
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Frame("{\"op\":6}".to_string())));

        link.writer.send("{\"op\":3,\"d\":1}".to_string()).await.unwrap();
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Closed(Some(4006))));
        assert_eq!(
            server.await.unwrap(),
            Message::Text("{\"op\":3,\"d\":1}".to_string())
        );
    }

    #[tokio::test]
    async fn websocket_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WsConnector::default().open(&format!("ws://{addr}")).await;
        assert!(matches!(result, Err(SdkError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn tcp_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnector::default().open(&addr.to_string()).await;
        assert!(matches!(result, Err(SdkError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn memory_connector_hands_out_peers() {
        let connector = MemoryConnector::new();
        let link = connector.open("memory://relay").await.unwrap();
        let peer = connector.accept().await.unwrap();
        assert_eq!(peer.endpoint, "memory://relay");

        ControlLink::new(link.writer.clone())
            .send(&Outbound::Heartbeat { nonce: 9 })
            .unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some(r#"{"op":3,"d":9}"#));

        assert!(peer.close(Some(4006)).await);
        assert_eq!(link.reader.recv().await, Ok(LinkEvent::Closed(Some(4006))));

        drop(link);
        assert!(peer.is_closed_by_client());
    }

    #[tokio::test]
    async fn refusing_memory_connector_counts_attempts() {
        let connector = MemoryConnector::new();
        connector.set_refusing(true);
        assert!(connector.open("a").await.is_err());
        assert!(connector.open("b").await.is_err());
        assert_eq!(connector.open_count(), 2);
    }
}
