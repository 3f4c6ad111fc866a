use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use topic_ws::core::CLOSE_NORMAL;
use topic_ws::testing::{MockAcceptor, MockServer, MockTransport};
use topic_ws::ws::{ConnectionHandle, ConnectionObserver};
use topic_ws::{
    ConnectionState, Endpoint, Envelope, TransportConfig, WebSocketError, WsDisconnectCause,
};

const BASE_URL: &str = "ws://mock.local";
const WAIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Connect,
    Message(String),
    Disconnect(WsDisconnectCause),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl ConnectionObserver for Recorder {
    fn on_connect(&mut self) {
        self.events.lock().push(Event::Connect);
    }

    fn on_message(&mut self, envelope: Envelope) {
        self.events
            .lock()
            .push(Event::Message(envelope.topic().to_string()));
    }

    fn on_disconnect(&mut self, cause: &WsDisconnectCause) {
        self.events.lock().push(Event::Disconnect(cause.clone()));
    }
}

type Handle = ConnectionHandle<Recorder, MockTransport>;

fn spawn_connection(config: TransportConfig) -> (Handle, Recorder, MockTransport, MockAcceptor) {
    let (transport, acceptor) = MockTransport::channel_pair();
    let recorder = Recorder::default();
    let handle = ConnectionHandle::spawn(transport.clone(), config, recorder.clone());
    (handle, recorder, transport, acceptor)
}

async fn wait_for_state(
    mut state: watch::Receiver<ConnectionState>,
    pred: impl FnMut(&ConnectionState) -> bool,
) -> ConnectionState {
    let reached = *tokio::time::timeout(WAIT, state.wait_for(pred))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
    reached
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn open(handle: &Handle, acceptor: &mut MockAcceptor) -> MockServer {
    handle
        .connect(Endpoint::new("/ws/test", "token-123"))
        .await
        .expect("connect accepted");
    let server = acceptor.accept_timeout(WAIT).await.expect("socket opened");
    wait_for_state(handle.watch_state(), |s| s.is_connected()).await;
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_resolves_url_sends_token_and_fires_on_connect_once() {
    let (handle, recorder, transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    assert_eq!(handle.state(), ConnectionState::Disconnected);

    let server = open(&handle, &mut acceptor).await;

    assert_eq!(server.request().url, "ws://mock.local/ws/test");
    assert_eq!(server.request().token, "token-123");
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(recorder.events(), vec![Event::Connect]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_is_single_flight_while_active() {
    let (handle, recorder, transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let endpoint = Endpoint::new("/ws/test", "token-123");

    handle.connect(endpoint.clone()).await.unwrap();
    // Still `Connecting`: ignored.
    handle.connect(endpoint.clone()).await.unwrap();
    let _server = acceptor.accept_timeout(WAIT).await.expect("socket opened");
    wait_for_state(handle.watch_state(), |s| s.is_connected()).await;
    // `Connected`: ignored too.
    handle.connect(endpoint).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connect_count(), 1);
    assert!(acceptor.try_accept().is_none());
    assert_eq!(recorder.count(|e| *e == Event::Connect), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_token_and_unresolvable_url_fail_before_any_handshake() {
    let (handle, recorder, transport, _acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let err = handle
        .connect(Endpoint::new("/ws/test", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::MissingToken));
    assert_eq!(err.to_string(), "No authentication token found");

    let (unconfigured, _, unconfigured_transport, _acceptor) =
        spawn_connection(TransportConfig::default());
    let err = unconfigured
        .connect(Endpoint::new("/ws/test", "token-123"))
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::UnresolvableUrl { .. }));

    assert_eq!(transport.connect_count(), 0);
    assert_eq!(unconfigured_transport.connect_count(), 0);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(unconfigured.state(), ConnectionState::Disconnected);
    assert!(recorder.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_dropped_and_the_socket_survives() {
    let (handle, recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let server = open(&handle, &mut acceptor).await;

    server.send_text("not json").unwrap();
    server.send_text(r#"{"cpu":1}"#).unwrap();
    server.send_text(r#"["type"]"#).unwrap();
    server
        .send_text(r#"{"type":"notification","text":"deployed"}"#)
        .unwrap();

    wait_until(|| recorder.count(|e| matches!(e, Event::Message(_))) == 1).await;
    assert_eq!(
        recorder.events(),
        vec![Event::Connect, Event::Message("notification".to_string())]
    );
    assert!(handle.state().is_connected());

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.malformed, 3);
    assert_eq!(stats.messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_are_delivered_in_socket_order() {
    let (handle, recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let server = open(&handle, &mut acceptor).await;

    for topic in ["a", "b", "c", "a"] {
        server.send_text(format!(r#"{{"type":"{topic}"}}"#)).unwrap();
    }

    wait_until(|| recorder.count(|e| matches!(e, Event::Message(_))) == 4).await;
    let topics: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Message(topic) => Some(topic),
            _ => None,
        })
        .collect();
    assert_eq!(topics, ["a", "b", "c", "a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_drop_reports_disconnect_once() {
    let (handle, recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let mut server = open(&handle, &mut acceptor).await;

    server.drop_socket();
    wait_for_state(handle.watch_state(), |s| *s == ConnectionState::Disconnected).await;
    wait_until(|| recorder.count(|e| matches!(e, Event::Disconnect(_))) == 1).await;

    assert_eq!(
        recorder.events(),
        vec![
            Event::Connect,
            Event::Disconnect(WsDisconnectCause::RemoteClosed {
                code: None,
                reason: "stream ended".to_string(),
            }),
        ]
    );
    // Sends after the drop go nowhere.
    assert!(!handle.send_text(r#"{"type":"late"}"#).await);
    assert!(server.recv_outbound_timeout(WAIT).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_frame_carries_code_and_reason() {
    let (handle, recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let server = open(&handle, &mut acceptor).await;

    server.send_close(1001, "going away").unwrap();
    wait_until(|| recorder.count(|e| matches!(e, Event::Disconnect(_))) == 1).await;

    assert_eq!(handle.state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.events().last(),
        Some(&Event::Disconnect(WsDisconnectCause::RemoteClosed {
            code: Some(1001),
            reason: "going away".to_string(),
        }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_sends_close_and_is_idempotent() {
    let (handle, recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let mut server = open(&handle, &mut acceptor).await;

    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);

    match server.recv_outbound_timeout(WAIT).await {
        Some(topic_ws::core::WsFrame::Close(Some(close))) => assert_eq!(close.code, CLOSE_NORMAL),
        other => panic!("expected close frame, got {other:?}"),
    }
    // Writer is gone after the close.
    assert!(server.recv_outbound_timeout(WAIT).await.is_none());

    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(
        recorder.events(),
        vec![
            Event::Connect,
            Event::Disconnect(WsDisconnectCause::ClientRequested)
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_before_connect_closes_without_callbacks() {
    let (handle, recorder, transport, _acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));

    handle.disconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);

    // A closed connection ignores reconnect requests.
    handle.reconnect().await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(transport.connect_count(), 0);
    assert!(recorder.events().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_after_disconnect_opens_a_fresh_socket() {
    let (handle, recorder, transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let first = open(&handle, &mut acceptor).await;
    handle.disconnect().await.unwrap();

    let second = open(&handle, &mut acceptor).await;
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(recorder.count(|e| *e == Event::Connect), 2);

    // Only the live socket feeds the observer.
    let _ = first.send_text(r#"{"type":"stale"}"#);
    second.send_text(r#"{"type":"fresh"}"#).unwrap();
    wait_until(|| recorder.count(|e| matches!(e, Event::Message(_))) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        recorder.count(|e| matches!(e, Event::Message(_))),
        1,
        "stale socket delivered a frame"
    );
    assert!(recorder.events().contains(&Event::Message("fresh".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_handshake_returns_to_disconnected_without_on_disconnect() {
    let (handle, recorder, transport, _acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    transport.refuse_connections(true);

    handle
        .connect(Endpoint::new("/ws/test", "token-123"))
        .await
        .unwrap();
    wait_for_state(handle.watch_state(), |s| *s == ConnectionState::Disconnected).await;

    assert_eq!(transport.connect_count(), 1);
    assert!(recorder.events().is_empty());
    assert_eq!(handle.stats().await.unwrap().connects, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sends_only_reach_an_open_socket() {
    let (handle, _recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));

    assert!(!handle.send_text(r#"{"type":"early"}"#).await);

    let mut server = open(&handle, &mut acceptor).await;
    assert!(handle.send_text(r#"{"type":"ping"}"#).await);
    let frame = server.recv_outbound_timeout(WAIT).await.expect("frame sent");
    assert_eq!(frame.as_text(), Some(r#"{"type":"ping"}"#));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.dropped_sends, 1);
    assert!(stats.uptime.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_the_open_socket() {
    let (handle, _recorder, _transport, mut acceptor) =
        spawn_connection(TransportConfig::new(BASE_URL));
    let mut server = open(&handle, &mut acceptor).await;

    handle.shutdown().await;

    assert!(server.recv_outbound_timeout(WAIT).await.is_some_and(|f| f.is_close()));
    assert_eq!(handle.state(), ConnectionState::Closed);
}
