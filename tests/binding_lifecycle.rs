use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use topic_ws::core::ExponentialBackoffReconnect;
use topic_ws::testing::{MockAcceptor, MockServer, MockTransport};
use topic_ws::{
    BindOptions, Binding, BindingDeps, BindingPhase, BindingStatus, ConnectionState,
    StaticCredentials, TopicHandler, TransportConfig, WsDisconnectCause,
};

const WAIT: Duration = Duration::from_secs(2);

fn deps(token: Option<&str>) -> (BindingDeps<MockTransport>, MockTransport, MockAcceptor) {
    let (transport, acceptor) = MockTransport::channel_pair();
    let credentials = match token {
        Some(token) => StaticCredentials::new(token),
        None => StaticCredentials::empty(),
    };
    let config =
        TransportConfig::new("ws://mock.local").with_status_poll_interval(Duration::from_millis(20));
    (
        BindingDeps::new(transport.clone(), credentials, config),
        transport,
        acceptor,
    )
}

fn counting() -> (TopicHandler, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let handler = TopicHandler::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, hits)
}

async fn wait_for_status(
    mut status: watch::Receiver<BindingStatus>,
    pred: impl FnMut(&BindingStatus) -> bool,
) -> BindingStatus {
    let reached = *tokio::time::timeout(WAIT, status.wait_for(pred))
        .await
        .expect("timed out waiting for binding status")
        .expect("status channel closed");
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

async fn bound(binding: &Binding<MockTransport>, acceptor: &mut MockAcceptor) -> MockServer {
    let server = acceptor.accept_timeout(WAIT).await.expect("socket opened");
    wait_for_status(binding.watch_status(), |s| s.phase == BindingPhase::Bound).await;
    server
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn missing_token_logs_and_never_builds_a_client() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (deps, transport, _acceptor) = deps(None);
    let mut binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;

    let output = logs.contents();
    let line = output
        .lines()
        .find(|l| l.contains("No authentication token found"))
        .expect("missing token is logged");
    assert!(line.contains("ERROR"), "logged at error level: {line}");

    assert!(binding.client().is_none());
    assert_eq!(binding.clients_constructed(), 0);
    assert_eq!(transport.connect_count(), 0);
    assert_eq!(binding.status(), BindingStatus::default());
    assert!(!binding.is_connected());
    assert!(!binding.is_polling());

    // Explicit connect behaves the same.
    assert!(!binding.connect().await);
    assert_eq!(binding.clients_constructed(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_token_from_any_store_never_builds_a_client() {
    let (transport, _acceptor) = MockTransport::channel_pair();
    let config =
        TransportConfig::new("ws://mock.local").with_status_poll_interval(Duration::from_millis(20));
    let deps = BindingDeps::new(transport.clone(), || Some("   ".to_string()), config);

    let mut binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;

    assert!(binding.client().is_none());
    assert_eq!(binding.clients_constructed(), 0);
    assert_eq!(transport.connect_count(), 0);
    assert!(!binding.is_polling());
    assert_eq!(binding.status(), BindingStatus::default());

    assert!(!binding.connect().await);
    assert_eq!(binding.clients_constructed(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_bind_builds_one_client_and_reaches_bound() {
    let connects = Arc::new(AtomicUsize::new(0));
    let options = {
        let connects = Arc::clone(&connects);
        BindOptions::auto().on_connect(move || {
            connects.fetch_add(1, Ordering::SeqCst);
        })
    };
    let (deps, transport, mut acceptor) = deps(Some("token-xyz"));
    let binding = Binding::bind("/ws/test", options, deps).await;

    assert_eq!(binding.clients_constructed(), 1);
    assert!(matches!(
        binding.status().phase,
        BindingPhase::Binding | BindingPhase::Bound
    ));
    assert!(binding.is_polling());

    let server = bound(&binding, &mut acceptor).await;
    assert_eq!(server.request().url, "ws://mock.local/ws/test");
    assert_eq!(server.request().token, "token-xyz");

    let status = binding.status();
    assert!(status.is_connected);
    assert_eq!(status.connection_state, ConnectionState::Connected);
    wait_until(|| connects.load(Ordering::SeqCst) == 1).await;
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_bind_waits_for_connect() {
    let (deps, transport, mut acceptor) = deps(Some("token-xyz"));
    let mut binding = Binding::bind("/ws/test", BindOptions::default(), deps).await;

    assert!(binding.client().is_none());
    assert_eq!(binding.status().phase, BindingPhase::Unbound);
    assert!(!binding.send(&"hello").await);
    assert_eq!(transport.connect_count(), 0);

    assert!(binding.connect().await);
    let _server = bound(&binding, &mut acceptor).await;
    assert_eq!(binding.clients_constructed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriptions_route_frames_and_unbind_releases_them() {
    let (deps, _transport, mut acceptor) = deps(Some("token-xyz"));
    let mut binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;
    let registry = Arc::clone(binding.registry());

    let (status_handler, status_hits) = counting();
    let (notice_handler, _) = counting();
    assert!(binding.subscribe("pipeline_status", status_handler));
    assert!(binding.subscriber().subscribe("notification", notice_handler));
    assert_eq!(binding.subscriber().subscription_count(), 2);

    let mut server = bound(&binding, &mut acceptor).await;
    server
        .send_text(r#"{"type":"pipeline_status","status":"running"}"#)
        .unwrap();
    wait_until(|| status_hits.load(Ordering::SeqCst) == 1).await;

    binding.unbind().await;

    assert!(registry.is_empty());
    assert_eq!(binding.subscriber().subscription_count(), 0);
    assert!(!binding.is_polling());
    assert!(binding.client().is_none());
    assert_eq!(binding.status(), BindingStatus::default());
    assert!(server.recv_outbound_timeout(WAIT).await.is_some_and(|f| f.is_close()));

    // Idempotent.
    binding.unbind().await;
    assert_eq!(binding.status(), BindingStatus::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_handle_is_stable_until_the_path_changes() {
    let (deps, _transport, _acceptor) = deps(Some("token-xyz"));
    let mut binding = Binding::new("/ws/test", BindOptions::default(), deps);

    let first = binding.subscriber().clone();
    assert!(first.ptr_eq(binding.subscriber()));
    assert!(first.ptr_eq(&binding.subscriber().clone()));

    binding.set_path("/ws/test").await;
    assert!(first.ptr_eq(binding.subscriber()));

    binding.set_path("/ws/other").await;
    assert!(!first.ptr_eq(binding.subscriber()));
    assert_eq!(binding.path(), "/ws/other");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_path_replaces_the_client_exactly_once() {
    let (deps, transport, mut acceptor) = deps(Some("token-xyz"));
    let mut binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;
    let (handler, hits) = counting();
    binding.subscribe("notification", handler);
    let old_registry = Arc::clone(binding.registry());

    let mut old_server = bound(&binding, &mut acceptor).await;
    assert_eq!(binding.clients_constructed(), 1);

    binding.set_path("/ws/other").await;

    assert_eq!(binding.clients_constructed(), 2);
    assert!(old_server.recv_outbound_timeout(WAIT).await.is_some_and(|f| f.is_close()));
    // Subscriptions are not carried over.
    assert!(old_registry.is_empty());
    assert!(binding.registry().is_empty());

    let new_server = bound(&binding, &mut acceptor).await;
    assert_eq!(new_server.request().url, "ws://mock.local/ws/other");
    assert_eq!(transport.connect_count(), 2);

    new_server.send_text(r#"{"type":"notification"}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Same path again: nothing rebuilt.
    binding.set_path("/ws/other").await;
    assert_eq!(binding.clients_constructed(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_drop_unbinds_and_connect_reuses_the_client() {
    let causes = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let causes = Arc::clone(&causes);
        BindOptions::auto().on_disconnect(move |cause: &WsDisconnectCause| {
            causes.lock().push(cause.clone())
        })
    };
    let (deps, transport, mut acceptor) = deps(Some("token-xyz"));
    let mut binding = Binding::bind("/ws/test", options, deps).await;
    let mut server = bound(&binding, &mut acceptor).await;

    server.drop_socket();
    let status = wait_for_status(binding.watch_status(), |s| !s.is_connected).await;
    assert_eq!(status.phase, BindingPhase::Unbound);
    assert_eq!(status.connection_state, ConnectionState::Disconnected);
    wait_until(|| causes.lock().len() == 1).await;
    assert!(binding.client().is_some());
    assert!(!binding.send(&"while down").await);

    assert!(binding.connect().await);
    let _server = bound(&binding, &mut acceptor).await;
    assert_eq!(binding.clients_constructed(), 1);
    assert_eq!(transport.connect_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_policy_rebinds_after_a_drop() {
    let options = BindOptions::auto().reconnect(|| {
        ExponentialBackoffReconnect::new(Duration::from_millis(10), Duration::from_millis(40), 2.0)
    });
    let (deps, _transport, mut acceptor) = deps(Some("token-xyz"));
    let binding = Binding::bind("/ws/test", options, deps).await;
    let mut server = bound(&binding, &mut acceptor).await;

    server.drop_socket();
    let _again = bound(&binding, &mut acceptor).await;
    assert_eq!(binding.clients_constructed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_forwards_only_while_bound() {
    let (deps, _transport, mut acceptor) = deps(Some("token-xyz"));
    let binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;
    let mut server = bound(&binding, &mut acceptor).await;

    assert!(binding.send(&[1, 2, 3]).await);
    let frame = server.recv_outbound_timeout(WAIT).await.expect("frame sent");
    assert_eq!(frame.as_text(), Some("[1,2,3]"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_binding_tears_everything_down() {
    let (deps, _transport, mut acceptor) = deps(Some("token-xyz"));
    let binding = Binding::bind("/ws/test", BindOptions::auto(), deps).await;
    let (handler, _) = counting();
    binding.subscribe("notification", handler);
    let registry = Arc::clone(binding.registry());
    let mut server = bound(&binding, &mut acceptor).await;

    drop(binding);

    assert!(registry.is_empty());
    assert!(server.recv_outbound_timeout(WAIT).await.is_some_and(|f| f.is_close()));
}
