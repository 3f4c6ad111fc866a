//! Lifetime-scoped adapter between a consumer and one transport client.
//!
//! A [`Binding`] owns at most one [`TransportClient`] for its current path, keeps a
//! reactive [`BindingStatus`], and remembers every subscription made through its
//! [`Subscriber`] so teardown releases exactly what was registered.
//!
//! ```text
//! Unbound --connect--> Binding --Connected--> Bound
//!    ^                                          |
//!    +-----------drop / unbind / set_path-------+
//! ```

use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::client::{
    ClientHooks, ClientOptions, ConnectHook, DisconnectHook, MessageHook, TransportClient,
};
use crate::core::{
    ConnectionState, Endpoint, Envelope, TransportConfig, WebSocketError, WsDisconnectCause,
    WsReconnectStrategy,
};
use crate::credentials::{CredentialStore, EnvCredentials};
use crate::registry::{TopicHandler, TopicRegistry};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

/// Builds a fresh reconnect policy for each client a binding constructs.
pub type ReconnectFactory = Arc<dyn Fn() -> Box<dyn WsReconnectStrategy> + Send + Sync>;

#[derive(Clone, Default)]
pub struct BindOptions {
    /// Connect as part of `bind` and after every path change.
    pub auto_connect: bool,
    pub on_message: Option<MessageHook>,
    pub on_connect: Option<ConnectHook>,
    pub on_disconnect: Option<DisconnectHook>,
    pub reconnect: Option<ReconnectFactory>,
}

impl BindOptions {
    pub fn auto() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

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

    pub fn reconnect<S, F>(mut self, factory: F) -> Self
    where
        S: WsReconnectStrategy,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.reconnect = Some(Arc::new(move || {
            Box::new(factory()) as Box<dyn WsReconnectStrategy>
        }));
        self
    }
}

impl fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindOptions")
            .field("auto_connect", &self.auto_connect)
            .field("on_message", &self.on_message.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("reconnect", &self.reconnect.is_some())
            .finish()
    }
}

/// Collaborators a binding needs to build clients.
#[derive(Clone)]
pub struct BindingDeps<T: WsTransport = TungsteniteTransport> {
    pub transport: T,
    pub credentials: Arc<dyn CredentialStore>,
    pub config: TransportConfig,
}

impl<T: WsTransport> BindingDeps<T> {
    pub fn new(transport: T, credentials: impl CredentialStore, config: TransportConfig) -> Self {
        Self {
            transport,
            credentials: Arc::new(credentials),
            config,
        }
    }
}

impl BindingDeps<TungsteniteTransport> {
    /// Tungstenite transport, `TOPIC_WS_TOKEN` credentials, env-derived config.
    pub fn from_env() -> Self {
        Self::new(
            TungsteniteTransport::default(),
            EnvCredentials::default(),
            TransportConfig::from_env(),
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindingPhase {
    #[default]
    Unbound,
    Binding,
    Bound,
    Unbinding,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindingStatus {
    pub phase: BindingPhase,
    pub is_connected: bool,
    pub connection_state: ConnectionState,
}

impl BindingStatus {
    fn from_connection(state: ConnectionState) -> Self {
        let phase = match state {
            ConnectionState::Connected => BindingPhase::Bound,
            ConnectionState::Connecting | ConnectionState::Reconnecting => BindingPhase::Binding,
            ConnectionState::Disconnected | ConnectionState::Closed => BindingPhase::Unbound,
        };
        Self {
            phase,
            is_connected: state.is_connected(),
            connection_state: state,
        }
    }
}

struct SubscriberInner {
    registry: Arc<TopicRegistry>,
    owned: Mutex<Vec<(String, TopicHandler)>>,
}

/// Subscribe/unsubscribe handle for one bound path.
///
/// Clones share state; [`Binding::subscriber`] returns the same handle until the
/// path changes.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                registry,
                owned: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> bool {
        let added = self.inner.registry.subscribe(topic, handler.clone());
        if added {
            self.inner.owned.lock().push((topic.to_string(), handler));
        }
        added
    }

    pub fn unsubscribe(&self, topic: &str, handler: &TopicHandler) -> bool {
        self.inner
            .owned
            .lock()
            .retain(|(t, h)| !(t == topic && h == handler));
        self.inner.registry.unsubscribe(topic, handler)
    }

    /// Subscriptions made through this handle and not yet released.
    pub fn subscription_count(&self) -> usize {
        self.inner.owned.lock().len()
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.inner.registry
    }

    pub fn ptr_eq(&self, other: &Subscriber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Unsubscribe everything registered through this handle.
    pub(crate) fn release_all(&self) -> usize {
        let owned = std::mem::take(&mut *self.inner.owned.lock());
        for (topic, handler) in &owned {
            self.inner.registry.unsubscribe(topic, handler);
        }
        owned.len()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

/// One consumer's view of one websocket path.
pub struct Binding<T: WsTransport = TungsteniteTransport> {
    path: String,
    options: BindOptions,
    deps: BindingDeps<T>,
    subscriber: Subscriber,
    client: Option<TransportClient<T>>,
    status: Arc<watch::Sender<BindingStatus>>,
    poller: Option<JoinHandle<()>>,
    clients_built: u64,
    // Bumped on every teardown; hooks and pollers from older clients check it.
    generation: Arc<AtomicU64>,
}

impl<T: WsTransport> Binding<T> {
    /// Create a binding for `path`, connecting right away when `auto_connect` is set.
    pub async fn bind(path: impl Into<String>, options: BindOptions, deps: BindingDeps<T>) -> Self {
        let mut binding = Self::new(path, options, deps);
        if binding.options.auto_connect {
            binding.connect().await;
        }
        binding
    }

    /// Create an unbound binding regardless of `auto_connect`.
    pub fn new(path: impl Into<String>, options: BindOptions, deps: BindingDeps<T>) -> Self {
        let (status, _) = watch::channel(BindingStatus::default());
        Self {
            path: path.into(),
            options,
            deps,
            subscriber: Subscriber::new(Arc::new(TopicRegistry::new())),
            client: None,
            status: Arc::new(status),
            poller: None,
            clients_built: 0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start connecting. Returns whether a connection attempt is underway.
    ///
    /// A missing token or unresolvable url is logged and leaves the binding
    /// `Unbound`; no client is built for a missing token.
    pub async fn connect(&mut self) -> bool {
        if let Some(client) = &self.client {
            return match client.connect().await {
                Ok(()) => {
                    self.publish_progress(client.connection_state());
                    true
                }
                Err(err) => {
                    debug!(path = %self.path, error = %err, "reconnect on existing client failed");
                    false
                }
            };
        }

        // Blank counts as absent whatever the store returns.
        let Some(token) = self
            .deps
            .credentials
            .token()
            .filter(|token| !token.trim().is_empty())
        else {
            error!(path = %self.path, "{}", WebSocketError::MissingToken);
            self.publish(BindingStatus::default());
            return false;
        };

        let client = TransportClient::new(
            Endpoint::new(self.path.clone(), token),
            self.deps.transport.clone(),
            self.deps.config.clone(),
            ClientOptions {
                registry: Arc::clone(self.subscriber.registry()),
                hooks: self.client_hooks(),
                reconnect: self.options.reconnect.as_ref().map(|factory| factory()),
            },
        );
        self.clients_built += 1;
        self.publish(BindingStatus {
            phase: BindingPhase::Binding,
            is_connected: false,
            connection_state: ConnectionState::Connecting,
        });
        self.poller = Some(self.spawn_poller(client.watch_state()));

        match client.connect().await {
            Ok(()) => {
                info!(path = %self.path, clients = self.clients_built, "binding connecting");
                self.publish_progress(client.connection_state());
                self.client = Some(client);
                true
            }
            Err(err) => {
                // Already logged by the connection; nothing was opened.
                debug!(path = %self.path, error = %err, "binding stays unbound");
                if let Some(poller) = self.poller.take() {
                    poller.abort();
                }
                client.shutdown().await;
                self.publish(BindingStatus::default());
                false
            }
        }
    }

    /// Release every subscription made through this binding, stop the status poll,
    /// and close the client. Safe to call repeatedly.
    pub async fn unbind(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let released = self.subscriber.release_all();
        let had_client = self.client.is_some();
        if had_client {
            self.publish(BindingStatus {
                phase: BindingPhase::Unbinding,
                ..self.status()
            });
        }
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(client) = self.client.take() {
            if let Err(err) = client.disconnect().await {
                debug!(path = %self.path, error = %err, "disconnect during unbind failed");
            }
            client.shutdown().await;
        }
        if had_client || released > 0 {
            info!(path = %self.path, released, "binding released");
        }
        self.publish(BindingStatus::default());
    }

    /// Re-point the binding. A different path tears down the current client and
    /// subscriber; with `auto_connect` a new client is built for the new path.
    pub async fn set_path(&mut self, path: impl Into<String>) {
        if self.repath(path.into()).await && self.options.auto_connect {
            self.connect().await;
        }
    }

    /// Tear down and switch to `path` without connecting. Returns whether the path
    /// changed.
    pub(crate) async fn repath(&mut self, path: String) -> bool {
        if path == self.path {
            return false;
        }
        self.unbind().await;
        debug!(from = %self.path, to = %path, "binding path changed");
        self.path = path;
        self.subscriber = Subscriber::new(Arc::new(TopicRegistry::new()));
        true
    }

    /// Serialize and send `payload`. `false` while no socket is open.
    pub async fn send<P>(&self, payload: &P) -> bool
    where
        P: Serialize + ?Sized,
    {
        match &self.client {
            Some(client) => client.send(payload).await,
            None => {
                debug!(path = %self.path, "send on unbound binding ignored");
                false
            }
        }
    }

    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> bool {
        self.subscriber.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &str, handler: &TopicHandler) -> bool {
        self.subscriber.unsubscribe(topic, handler)
    }

    pub fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        self.subscriber.registry()
    }

    pub fn client(&self) -> Option<&TransportClient<T>> {
        self.client.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &BindOptions {
        &self.options
    }

    pub fn status(&self) -> BindingStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<BindingStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status().connection_state
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Number of transport clients this binding has constructed.
    pub fn clients_constructed(&self) -> u64 {
        self.clients_built
    }

    fn publish(&self, next: BindingStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Publish the state seen right after a connect call. The `on_connect` hook may
    /// already have reported `Bound`; a stale in-flight read must not undo that.
    fn publish_progress(&self, state: ConnectionState) {
        let next = BindingStatus::from_connection(state);
        self.status.send_if_modified(|current| {
            if *current == next
                || (current.phase == BindingPhase::Bound && next.phase == BindingPhase::Binding)
            {
                return false;
            }
            *current = next;
            true
        });
    }

    fn client_hooks(&self) -> ClientHooks {
        let generation = self.generation.load(Ordering::SeqCst);
        let live = {
            let current = Arc::clone(&self.generation);
            move || current.load(Ordering::SeqCst) == generation
        };

        let on_connect = {
            let live = live.clone();
            let status = Arc::clone(&self.status);
            let user = self.options.on_connect.clone();
            move || {
                if !live() {
                    return;
                }
                status.send_replace(BindingStatus::from_connection(ConnectionState::Connected));
                if let Some(user) = &user {
                    user();
                }
            }
        };
        let on_disconnect = {
            let live = live.clone();
            let status = Arc::clone(&self.status);
            let user = self.options.on_disconnect.clone();
            move |cause: &WsDisconnectCause| {
                if !live() {
                    return;
                }
                let state = match cause {
                    WsDisconnectCause::ClientRequested => ConnectionState::Closed,
                    _ => ConnectionState::Disconnected,
                };
                status.send_replace(BindingStatus::from_connection(state));
                if let Some(user) = &user {
                    user(cause);
                }
            }
        };
        let on_message = self.options.on_message.clone().map(|user| {
            let live = live.clone();
            Arc::new(move |envelope: &Envelope| {
                if live() {
                    user(envelope);
                }
            }) as MessageHook
        });

        ClientHooks {
            on_message,
            on_connect: Some(Arc::new(on_connect)),
            on_disconnect: Some(Arc::new(on_disconnect)),
        }
    }

    /// Sample the connection state on a fixed interval to catch transitions that
    /// happen outside the connect/disconnect hooks (e.g. `Reconnecting`).
    fn spawn_poller(&self, state: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let current = Arc::clone(&self.generation);
        let generation = current.load(Ordering::SeqCst);
        let interval = self.deps.config.status_poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if current.load(Ordering::SeqCst) != generation {
                    break;
                }
                let next = BindingStatus::from_connection(*state.borrow());
                status.send_if_modified(|s| {
                    if *s == next {
                        return false;
                    }
                    *s = next;
                    true
                });
            }
        })
    }
}

impl<T: WsTransport> Drop for Binding<T> {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.subscriber.release_all();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        // Dropping the client stops its connection actor, which closes the socket.
        drop(self.client.take());
    }
}

impl<T: WsTransport> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("path", &self.path)
            .field("status", &self.status())
            .field("clients_constructed", &self.clients_built)
            .finish()
    }
}
