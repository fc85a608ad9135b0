use async_channel::Receiver;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use voicegate_sdk::config::MEDIA_QUEUE_CAPACITY;
use voicegate_sdk::{
    Channel, CloseCode, ConnectTarget, ConnectionState, Disposition, MemoryConnector, MemoryPeer,
    SdkError, SessionConfig, SessionEvent, VoiceSession,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// Relay side of a session: the control peer plus a UDP media endpoint.
struct TestRelay {
    control: MemoryPeer,
    media: UdpSocket,
}

impl TestRelay {
    async fn accept(connector: &MemoryConnector) -> Self {
        let control = tokio::time::timeout(TIMEOUT, connector.accept())
            .await
            .expect("No connection within timeout")
            .expect("Connector closed");
        let media = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind relay socket");
        TestRelay { control, media }
    }

    fn media_port(&self) -> u16 {
        self.media.local_addr().expect("Relay socket has no address").port()
    }

    async fn recv_message(&self) -> Value {
        let text = tokio::time::timeout(TIMEOUT, self.control.recv())
            .await
            .expect("No control message within timeout")
            .expect("Client closed the control channel");
        serde_json::from_str(&text).expect("Client sent invalid JSON")
    }

    async fn send(&self, text: &str) {
        assert!(self.control.send_frame(text).await, "Client went away");
    }

    async fn hello(&self, interval_ms: u64) {
        self.send(&format!(r#"{{"op":8,"d":{{"heartbeat_interval":{interval_ms}}}}}"#))
            .await;
    }

    async fn ready(&self, ssrc: u32) {
        self.send(&format!(
            r#"{{"op":2,"d":{{"ssrc":{ssrc},"ip":"127.0.0.1","port":{},"modes":["xsalsa20_poly1305"]}}}}"#,
            self.media_port()
        ))
        .await;
    }

    /// Answers the discovery probe, reporting `127.0.0.1:8080` as the
    /// client's address. Returns where the probe came from.
    async fn answer_discovery(&self) -> SocketAddr {
        let mut buf = [0u8; 256];
        let (n, client) = tokio::time::timeout(TIMEOUT, self.media.recv_from(&mut buf))
            .await
            .expect("No discovery probe within timeout")
            .expect("Relay socket failed");
        assert_eq!(n, 70);
        assert_eq!(&buf[..4], &[0, 0, 0, 1]);
        assert!(buf[4..n].iter().all(|&b| b == 0));

        let mut reply = vec![0, 0, 0, 1];
        reply.extend_from_slice(b"127.0.0.1\0");
        reply.resize(68, 0);
        reply.extend_from_slice(&8080u16.to_be_bytes());
        self.media
            .send_to(&reply, client)
            .await
            .expect("Failed to send discovery reply");
        client
    }
}

fn target() -> ConnectTarget {
    ConnectTarget {
        endpoint: "memory://relay".to_string(),
        server_id: "guild".to_string(),
        user_id: "alice".to_string(),
        session_id: "session-1".to_string(),
        token: "token".to_string(),
    }
}

/// Collects events up to and including the first one matching `pred`.
async fn wait_for(
    events: &Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("Expected event did not arrive")
            .expect("Event stream closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_handshake_discovery_and_media() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());
    let events = session.event_stream();

    session.connect(target()).expect("Failed to start connecting");
    let relay = TestRelay::accept(&connector).await;

    let identify = relay.recv_message().await;
    assert_eq!(identify["op"], 0);
    assert_eq!(identify["d"]["user_id"], "alice");
    assert_eq!(identify["d"]["session_id"], "session-1");

    relay.hello(5000).await;
    relay.ready(7).await;
    let client = relay.answer_discovery().await;

    let select = relay.recv_message().await;
    assert_eq!(select["op"], 1);
    assert_eq!(select["d"]["protocol"], "udp");
    assert_eq!(select["d"]["data"]["address"], "127.0.0.1");
    assert_eq!(select["d"]["data"]["port"], 8080);
    assert_eq!(select["d"]["data"]["mode"], "xsalsa20_poly1305");

    relay
        .send(r#"{"op":4,"d":{"mode":"xsalsa20_poly1305","secret_key":[9,8,7]}}"#)
        .await;
    let seen = wait_for(&events, |e| matches!(e, SessionEvent::SessionDescription(_))).await;

    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::AwaitingHello,
            ConnectionState::Identifying,
            ConnectionState::Ready,
        ]
    );
    assert_eq!(seen.iter().filter(|e| matches!(e, SessionEvent::Ready(_))).count(), 1);
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Discovered(local) if local.address == "127.0.0.1" && local.port == 8080
    )));
    assert_eq!(session.state(), ConnectionState::Ready);
    assert_eq!(
        session.local_address().map(|local| (local.address, local.port)),
        Some(("127.0.0.1".to_string(), 8080))
    );

    // relay -> client
    let media = session.media_stream();
    relay
        .media
        .send_to(b"inbound-frame", client)
        .await
        .expect("Failed to send media");
    let received = tokio::time::timeout(TIMEOUT, media.recv())
        .await
        .expect("No media within timeout")
        .expect("Media stream closed");
    assert_eq!(received, b"inbound-frame".to_vec());

    // client -> relay; the only datagram after the probe
    session
        .send_media(b"outbound-frame")
        .await
        .expect("Failed to send media");
    let mut buf = [0u8; 256];
    let (n, _) = tokio::time::timeout(TIMEOUT, relay.media.recv_from(&mut buf))
        .await
        .expect("No media within timeout")
        .expect("Relay socket failed");
    assert_eq!(&buf[..n], b"outbound-frame");

    session.disconnect().expect("Failed to disconnect");
    let seen = wait_for(&events, |e| {
        matches!(e, SessionEvent::Closed { channel: Channel::Control })
    })
    .await;
    let closed: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Closed { channel } => Some(*channel),
            _ => None,
        })
        .collect();
    assert_eq!(closed, vec![Channel::Data, Channel::Control]);

    assert_eq!(session.send_media(b"late").await, Err(SdkError::NotReady));
    assert!(!session.is_ended());
}

#[tokio::test]
async fn test_participants_and_speaking() {
    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());
    let events = session.event_stream();

    session.connect(target()).expect("Failed to start connecting");
    let relay = TestRelay::accept(&connector).await;
    relay.recv_message().await;
    relay.hello(5000).await;
    relay.ready(7).await;
    relay.answer_discovery().await;
    relay.recv_message().await;

    relay
        .send(r#"{"op":12,"d":{"user_id":"bob","audio_ssrc":42}}"#)
        .await;
    relay
        .send(r#"{"op":5,"d":{"user_id":"bob","ssrc":42,"speaking":1}}"#)
        .await;
    wait_for(&events, |e| matches!(e, SessionEvent::Speaking { ssrc: 42, .. })).await;

    let participants = session.participants();
    let bob = participants.get(42).expect("bob should be registered");
    assert_eq!(bob.user_id, "bob");
    assert_eq!(bob.speaking, 1);
    assert_eq!(participants.get(99), None);

    session.set_speaking(1).expect("Failed to queue speaking update");
    let speaking = relay.recv_message().await;
    assert_eq!(speaking["op"], 5);
    assert_eq!(speaking["d"]["ssrc"], 7);
    assert_eq!(speaking["d"]["speaking"], 1);
}

#[tokio::test]
async fn test_undrained_media_stream_is_capped() {
    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());
    let events = session.event_stream();

    session.connect(target()).expect("Failed to start connecting");
    let relay = TestRelay::accept(&connector).await;
    relay.recv_message().await;
    relay.hello(5000).await;
    relay.ready(7).await;
    let client = relay.answer_discovery().await;
    wait_for(&events, |e| matches!(e, SessionEvent::Discovered(_))).await;

    // paced so the loopback socket buffer never overflows
    for batch in 0..(2 * MEDIA_QUEUE_CAPACITY / 16) {
        for i in 0..16 {
            let seq = u16::try_from(batch * 16 + i).expect("sequence fits in u16");
            relay
                .media
                .send_to(&seq.to_be_bytes(), client)
                .await
                .expect("Failed to send media");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let media = session.media_stream();
    tokio::time::timeout(TIMEOUT, async {
        while !media.is_full() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Media stream never filled up");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(media.len(), MEDIA_QUEUE_CAPACITY);

    let first = media.recv().await.expect("Media stream closed");
    assert_eq!(first, 0u16.to_be_bytes().to_vec());
    assert!(!session.is_ended());
}

#[tokio::test]
async fn test_fatal_close_ends_the_session() {
    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());
    let events = session.event_stream();

    session.connect(target()).expect("Failed to start connecting");
    let relay = TestRelay::accept(&connector).await;
    relay.recv_message().await;

    assert!(relay.control.close(Some(4006)).await);
    wait_for(&events, |e| {
        matches!(e, SessionEvent::Error(SdkError::FatalClose(CloseCode::SessionInvalid)))
    })
    .await;

    assert!(session.is_ended());
    assert_eq!(
        session.state(),
        ConnectionState::Disconnected(Disposition::Fatal)
    );
    assert_eq!(session.connect(target()), Err(SdkError::SessionEnded));
    assert_eq!(connector.open_count(), 1);
}

#[tokio::test]
async fn test_recoverable_close_reconnects() {
    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());

    session.connect(target()).expect("Failed to start connecting");
    let first = TestRelay::accept(&connector).await;
    first.recv_message().await;
    assert!(first.control.close(Some(4014)).await);

    let second = TestRelay::accept(&connector).await;
    let identify = second.recv_message().await;
    assert_eq!(identify["op"], 0);
    assert_eq!(connector.open_count(), 2);
    assert!(!session.is_ended());
}

#[tokio::test]
async fn test_reconnect_budget_is_exhausted() {
    let connector = MemoryConnector::new();
    connector.set_refusing(true);
    let session = VoiceSession::new(
        connector.clone(),
        SessionConfig::default().with_max_connect_attempts(3),
    );
    let events = session.event_stream();

    session.connect(target()).expect("Failed to start connecting");
    let seen = wait_for(&events, |e| {
        matches!(e, SessionEvent::Error(SdkError::ReconnectBudgetExhausted { .. }))
    })
    .await;

    assert!(seen.contains(&SessionEvent::Error(SdkError::ReconnectBudgetExhausted {
        attempts: 3
    })));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, SessionEvent::TransportError { channel: Channel::Control, .. }))
            .count(),
        3
    );
    assert_eq!(connector.open_count(), 3);
    assert_eq!(session.connect(target()), Err(SdkError::SessionEnded));
}

#[tokio::test]
async fn test_dropping_the_session_closes_the_control_channel() {
    let connector = MemoryConnector::new();
    let session = VoiceSession::new(connector.clone(), SessionConfig::default());

    session.connect(target()).expect("Failed to start connecting");
    let relay = TestRelay::accept(&connector).await;
    relay.recv_message().await;

    drop(session);
    let next = tokio::time::timeout(TIMEOUT, relay.control.recv())
        .await
        .expect("Control channel was not closed");
    assert_eq!(next, None);
}
