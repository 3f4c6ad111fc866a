//! Transport client: one connection plus the topic registry it dispatches into.

use std::fmt;
use std::sync::Arc;

use kameo::prelude::WeakActorRef;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::core::{
    ConnectionState, ConnectionStats, Endpoint, Envelope, TransportConfig, WebSocketError,
    WebSocketResult, WsDisconnectCause, WsReconnectStrategy, jitter_delay,
};
use crate::registry::{TopicHandler, TopicRegistry, call_isolated};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;
use crate::ws::connection::flatten_send;
use crate::ws::{ConnectionActor, ConnectionCommand, ConnectionHandle, ConnectionObserver};

pub type MessageHook = Arc<dyn Fn(&Envelope) + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectHook = Arc<dyn Fn(&WsDisconnectCause) + Send + Sync>;

/// Optional lifecycle callbacks. `on_message` sees every valid envelope before
/// topic dispatch.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub on_message: Option<MessageHook>,
    pub on_connect: Option<ConnectHook>,
    pub on_disconnect: Option<DisconnectHook>,
}

impl ClientHooks {
    pub fn on_message(mut self, f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(&WsDisconnectCause) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("on_message", &self.on_message.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

pub struct ClientOptions {
    /// Registry to dispatch into. Sharing one lets callers subscribe before the
    /// client exists.
    pub registry: Arc<TopicRegistry>,
    pub hooks: ClientHooks,
    /// `None` keeps the connection down after a drop until `connect()` is called.
    pub reconnect: Option<Box<dyn WsReconnectStrategy>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            registry: Arc::new(TopicRegistry::new()),
            hooks: ClientHooks::default(),
            reconnect: None,
        }
    }
}

/// What the reconnect policy task hears from the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PolicySignal {
    Connected,
    Dropped,
}

/// Bridges connection events into hooks, the registry and the reconnect policy.
pub struct ClientObserver {
    path: String,
    registry: Arc<TopicRegistry>,
    hooks: ClientHooks,
    policy: Option<mpsc::UnboundedSender<PolicySignal>>,
}

impl ClientObserver {
    fn signal(&self, signal: PolicySignal) {
        if let Some(tx) = &self.policy {
            let _ = tx.send(signal);
        }
    }
}

impl ConnectionObserver for ClientObserver {
    fn on_connect(&mut self) {
        self.signal(PolicySignal::Connected);
        if let Some(hook) = &self.hooks.on_connect {
            call_isolated("on_connect", &self.path, || hook());
        }
    }

    fn on_message(&mut self, envelope: Envelope) {
        if let Some(hook) = &self.hooks.on_message {
            call_isolated("on_message", envelope.topic(), || hook(&envelope));
        }
        self.registry.dispatch(&envelope);
    }

    fn on_disconnect(&mut self, cause: &WsDisconnectCause) {
        if *cause != WsDisconnectCause::ClientRequested {
            self.signal(PolicySignal::Dropped);
        }
        if let Some(hook) = &self.hooks.on_disconnect {
            call_isolated("on_disconnect", &self.path, || hook(cause));
        }
    }
}

type ClientConnection<T> = ConnectionHandle<ClientObserver, T>;

/// One endpoint's connection and its subscriptions.
///
/// Subscriptions live in the registry, not the connection, so they survive
/// `disconnect()` and apply again after the next `connect()`. Dropping the client
/// closes the socket.
pub struct TransportClient<T: WsTransport = TungsteniteTransport> {
    endpoint: Endpoint,
    registry: Arc<TopicRegistry>,
    connection: ClientConnection<T>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl<T: WsTransport> TransportClient<T> {
    /// Must be called inside a tokio runtime.
    pub fn new(
        endpoint: Endpoint,
        transport: T,
        config: TransportConfig,
        options: ClientOptions,
    ) -> Self {
        let ClientOptions {
            registry,
            hooks,
            reconnect,
        } = options;
        let (policy_tx, policy_rx) = match reconnect {
            Some(policy) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some((policy, rx)))
            }
            None => (None, None),
        };
        let observer = ClientObserver {
            path: endpoint.path().to_string(),
            registry: Arc::clone(&registry),
            hooks,
            policy: policy_tx,
        };
        let connection = ConnectionHandle::spawn(transport, config, observer);
        let reconnect_task = policy_rx.map(|(policy, signals)| {
            spawn_reconnect_policy(
                policy,
                signals,
                connection.watch_state(),
                connection.downgrade(),
                endpoint.path().to_string(),
            )
        });

        Self {
            endpoint,
            registry,
            connection,
            reconnect_task,
        }
    }

    pub async fn connect(&self) -> WebSocketResult<()> {
        self.connection.connect(self.endpoint.clone()).await
    }

    /// Close the socket. Subscriptions are kept.
    pub async fn disconnect(&self) -> WebSocketResult<()> {
        self.connection.disconnect().await
    }

    /// Serialize `payload` as JSON and write it. `false` if not connected or the
    /// payload does not serialize.
    pub async fn send<P>(&self, payload: &P) -> bool
    where
        P: Serialize + ?Sized,
    {
        match sonic_rs::to_string(payload) {
            Ok(text) => self.connection.send_text(text).await,
            Err(err) => {
                let err = WebSocketError::Serialize(err.to_string());
                warn!(path = %self.endpoint.path(), error = %err, "outbound payload dropped");
                false
            }
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.connection.send_text(text).await
    }

    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> bool {
        self.registry.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &str, handler: &TopicHandler) -> bool {
        self.registry.unsubscribe(topic, handler)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn stats(&self) -> WebSocketResult<ConnectionStats> {
        self.connection.stats().await
    }

    /// Disconnect and wait for the connection actor to stop.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.connection.shutdown().await;
    }
}

impl<T: WsTransport> Drop for TransportClient<T> {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

impl<T: WsTransport> fmt::Debug for TransportClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.connection_state())
            .finish()
    }
}

/// Re-open the socket after unexpected drops.
///
/// Driven by the observer: only a drop of a `Connected` socket starts a retry
/// round, so `Closed` and a failed first connect never do. A round keeps retrying
/// until a handshake succeeds, the policy gives up, or the state moves elsewhere.
fn spawn_reconnect_policy<T: WsTransport>(
    mut policy: Box<dyn WsReconnectStrategy>,
    mut signals: mpsc::UnboundedReceiver<PolicySignal>,
    mut state: watch::Receiver<ConnectionState>,
    actor: WeakActorRef<ConnectionActor<ClientObserver, T>>,
    path: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if signal == PolicySignal::Connected {
                policy.reset();
                continue;
            }

            loop {
                if !policy.should_retry() {
                    warn!(path = %path, "reconnect attempts exhausted");
                    break;
                }
                let delay = jitter_delay(policy.next_delay());
                info!(path = %path, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                tokio::time::sleep(delay).await;

                if *state.borrow() != ConnectionState::Disconnected {
                    debug!(path = %path, "reconnect skipped; state moved on");
                    break;
                }
                let Some(actor) = actor.upgrade() else {
                    return;
                };
                if let Err(err) = flatten_send(actor.ask(ConnectionCommand::Reconnect).await) {
                    warn!(path = %path, error = %err, "reconnect request failed");
                    break;
                }
                drop(actor);

                let outcome = match state
                    .wait_for(|s| *s != ConnectionState::Reconnecting)
                    .await
                {
                    Ok(outcome) => *outcome,
                    Err(_) => return,
                };
                match outcome {
                    ConnectionState::Disconnected => continue,
                    ConnectionState::Connected => policy.reset(),
                    _ => {}
                }
                break;
            }
        }
    })
}
