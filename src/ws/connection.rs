//! One authenticated websocket connection, owned by a kameo actor.
//!
//! The socket reader runs as a plain task outside the actor and forwards parsed
//! envelopes as messages; the writer is a per-socket [`WsWriterActor`]. State is
//! published through a watch channel so callers can read it without a round trip.
//!
//! Every socket and every handshake is tagged with an epoch. Anything arriving with
//! an older epoch belongs to a socket that has already been torn down and is dropped.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::writer::{WriterWrite, WsWriterActor};
use crate::core::{
    CLOSE_NORMAL, ConnectionState, ConnectionStats, Endpoint, Envelope, EnvelopeError,
    TransportConfig, WebSocketError, WebSocketResult, WsDisconnectCause, WsFrame,
};
use crate::transport::{WsConnectRequest, WsTransport};

/// Upper bound on how long a disconnect waits for the close frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives the lifecycle and traffic of one connection.
///
/// Callbacks run on the connection actor, in socket order.
pub trait ConnectionObserver: Send + 'static {
    fn on_connect(&mut self) {}

    fn on_message(&mut self, envelope: Envelope);

    /// Only fired for a connection that had reached `Connected`.
    fn on_disconnect(&mut self, _cause: &WsDisconnectCause) {}
}

pub struct ConnectionArgs<O, T> {
    pub transport: T,
    pub config: TransportConfig,
    pub observer: O,
    pub state: watch::Sender<ConnectionState>,
}

pub struct ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    transport: T,
    config: TransportConfig,
    observer: O,
    state: watch::Sender<ConnectionState>,
    actor_ref: WeakActorRef<Self>,
    endpoint: Option<Endpoint>,
    epoch: u64,
    handshake_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    writer_ref: Option<ActorRef<WsWriterActor<T::Writer>>>,
    connected_at: Option<Instant>,
    stats: ConnectionStats,
}

impl<O, T> Actor for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Args = ConnectionArgs<O, T>;
    type Error = WebSocketError;

    fn name() -> &'static str {
        "ConnectionActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> WebSocketResult<Self> {
        let ConnectionArgs {
            transport,
            config,
            observer,
            state,
        } = args;

        Ok(Self {
            transport,
            config,
            observer,
            state,
            actor_ref: ctx.downgrade(),
            endpoint: None,
            epoch: 0,
            handshake_task: None,
            reader_task: None,
            writer_ref: None,
            connected_at: None,
            stats: ConnectionStats::default(),
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> WebSocketResult<()> {
        let was_connected = self.current_state().is_connected();
        self.teardown_socket(was_connected).await;
        self.set_state(ConnectionState::Closed);
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        async move {
            error!(error = ?err, "ConnectionActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

/// Lifecycle commands.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Open a socket to `endpoint`. Ignored while a handshake or socket is active.
    Connect(Endpoint),
    /// Re-open the last endpoint after a drop. Ignored once explicitly closed.
    Reconnect,
    Disconnect,
}

/// Send one text frame. Replies `false` when no socket is open.
#[derive(Debug)]
pub struct SendText(pub String);

pub struct GetConnectionStats;

pub(crate) struct ConnectionEvent {
    epoch: u64,
    kind: ConnectionEventKind,
}

pub(crate) enum ConnectionEventKind {
    Envelope(Envelope),
    Malformed(EnvelopeError),
    Dropped(WsDisconnectCause),
}

pub(crate) struct HandshakeComplete<T: WsTransport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

pub(crate) struct HandshakeFailed {
    epoch: u64,
    error: WebSocketError,
}

impl<O, T> KameoMessage<ConnectionCommand> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = WebSocketResult<()>;

    async fn handle(
        &mut self,
        command: ConnectionCommand,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        match command {
            ConnectionCommand::Connect(endpoint) => {
                self.handle_connect(Some(endpoint), ConnectionState::Connecting)
            }
            ConnectionCommand::Reconnect => {
                if self.current_state() == ConnectionState::Closed {
                    debug!(path = %self.path(), "reconnect ignored; connection closed by client");
                    return Ok(());
                }
                self.handle_connect(None, ConnectionState::Reconnecting)
            }
            ConnectionCommand::Disconnect => {
                self.handle_disconnect().await;
                Ok(())
            }
        }
    }
}

impl<O, T> KameoMessage<SendText> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = WebSocketResult<bool>;

    async fn handle(
        &mut self,
        SendText(text): SendText,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let writer = match (&self.writer_ref, self.current_state()) {
            (Some(writer), ConnectionState::Connected) => writer.clone(),
            (_, state) => {
                self.stats.dropped_sends += 1;
                debug!(path = %self.path(), %state, "dropping outbound message; socket not open");
                return Ok(false);
            }
        };

        match flatten_send(
            writer
                .ask(WriterWrite {
                    frame: WsFrame::text(text),
                })
                .await,
        ) {
            Ok(()) => {
                self.stats.sent += 1;
                Ok(true)
            }
            Err(err) => {
                warn!(path = %self.path(), error = %err, "websocket writer send failed");
                self.stats.dropped_sends += 1;
                self.handle_drop(WsDisconnectCause::WriteFailure {
                    error: err.to_string(),
                })
                .await;
                Ok(false)
            }
        }
    }
}

impl<O, T> KameoMessage<GetConnectionStats> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = WebSocketResult<ConnectionStats>;

    async fn handle(
        &mut self,
        _message: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(ConnectionStats {
            uptime: self.connected_at.map(|at| at.elapsed()),
            ..self.stats.clone()
        })
    }
}

impl<O, T> KameoMessage<ConnectionEvent> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = ();

    async fn handle(&mut self, event: ConnectionEvent, _ctx: &mut Context<Self, Self::Reply>) {
        if event.epoch != self.epoch || !self.current_state().is_connected() {
            return;
        }
        match event.kind {
            ConnectionEventKind::Envelope(envelope) => {
                self.stats.messages += 1;
                self.observer.on_message(envelope);
            }
            ConnectionEventKind::Malformed(err) => {
                self.stats.malformed += 1;
                let err = WebSocketError::from(err);
                warn!(path = %self.path(), error = %err, "dropping websocket frame");
            }
            ConnectionEventKind::Dropped(cause) => self.handle_drop(cause).await,
        }
    }
}

impl<O, T> KameoMessage<HandshakeComplete<T>> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: HandshakeComplete<T>, _ctx: &mut Context<Self, Self::Reply>) {
        let state = self.current_state();
        if msg.epoch != self.epoch
            || !matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
        {
            // Dropping reader and writer closes the stale socket.
            debug!(path = %self.path(), %state, "discarding stale handshake");
            return;
        }
        self.handshake_task = None;

        self.writer_ref = Some(WsWriterActor::spawn(WsWriterActor::new(msg.writer)));
        self.reader_task = Some(self.spawn_reader(msg.epoch, msg.reader));
        self.connected_at = Some(Instant::now());
        self.stats.connects += 1;
        self.set_state(ConnectionState::Connected);

        info!(path = %self.path(), "websocket connection established");
        self.observer.on_connect();
    }
}

impl<O, T> KameoMessage<HandshakeFailed> for ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    type Reply = ();

    async fn handle(&mut self, msg: HandshakeFailed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch {
            return;
        }
        self.handshake_task = None;
        warn!(path = %self.path(), error = %msg.error, "websocket handshake failed");
        self.set_state(ConnectionState::Disconnected);
    }
}

impl<O, T> ConnectionActor<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(path = %self.path(), from = %prev, to = %next, "connection state changed");
        }
    }

    fn path(&self) -> &str {
        self.endpoint.as_ref().map(Endpoint::path).unwrap_or("")
    }

    fn handle_connect(
        &mut self,
        endpoint: Option<Endpoint>,
        next: ConnectionState,
    ) -> WebSocketResult<()> {
        let state = self.current_state();
        if state.is_active() {
            debug!(path = %self.path(), %state, "connect ignored; connection already active");
            return Ok(());
        }

        let Some(endpoint) = endpoint.or_else(|| self.endpoint.clone()) else {
            return Err(WebSocketError::InvalidState(
                "no endpoint to reconnect to".to_string(),
            ));
        };
        if !endpoint.has_token() {
            error!(path = %endpoint.path(), "{}", WebSocketError::MissingToken);
            return Err(WebSocketError::MissingToken);
        }
        let url = match self.config.resolve(endpoint.path()) {
            Ok(url) => url,
            Err(err) => {
                error!(path = %endpoint.path(), error = %err, "cannot resolve websocket url");
                return Err(err);
            }
        };

        let request = WsConnectRequest {
            url,
            token: endpoint.token().to_string(),
        };
        self.endpoint = Some(endpoint);
        self.epoch += 1;
        self.set_state(next);
        info!(path = %self.path(), url = %request.url, %next, "opening websocket");

        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let connect = self.transport.connect(request, self.config.buffers);
        self.handshake_task = Some(tokio::spawn(async move {
            let result = connect.await;
            let Some(actor) = actor_ref.upgrade() else {
                return;
            };
            match result {
                Ok((reader, writer)) => {
                    let _ = actor
                        .tell(HandshakeComplete::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Err(error) => {
                    let _ = actor.tell(HandshakeFailed { epoch, error }).send().await;
                }
            }
        }));
        Ok(())
    }

    fn spawn_reader(&self, epoch: u64, mut reader: T::Reader) -> JoinHandle<()> {
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            loop {
                let kind = match reader.next().await {
                    Some(Ok(WsFrame::Text(bytes))) => match Envelope::parse(bytes) {
                        Ok(envelope) => ConnectionEventKind::Envelope(envelope),
                        Err(err) => ConnectionEventKind::Malformed(err),
                    },
                    Some(Ok(WsFrame::Binary(bytes))) => {
                        debug!(len = bytes.len(), "ignoring binary websocket frame");
                        continue;
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(WsFrame::Ping(_))) | Some(Ok(WsFrame::Pong(_))) => continue,
                    Some(Ok(WsFrame::Close(frame))) => {
                        ConnectionEventKind::Dropped(WsDisconnectCause::RemoteClosed {
                            code: frame.as_ref().map(|f| f.code),
                            reason: frame
                                .map(|f| String::from_utf8_lossy(&f.reason).into_owned())
                                .unwrap_or_default(),
                        })
                    }
                    Some(Err(err)) => ConnectionEventKind::Dropped(WsDisconnectCause::ReadFailure {
                        error: err.to_string(),
                    }),
                    None => ConnectionEventKind::Dropped(WsDisconnectCause::RemoteClosed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }),
                };

                let last = matches!(kind, ConnectionEventKind::Dropped(_));
                let Some(actor) = actor_ref.upgrade() else {
                    break;
                };
                if actor
                    .tell(ConnectionEvent { epoch, kind })
                    .send()
                    .await
                    .is_err()
                    || last
                {
                    break;
                }
            }
        })
    }

    async fn handle_drop(&mut self, cause: WsDisconnectCause) {
        let was_connected = self.current_state().is_connected();
        info!(path = %self.path(), %cause, "websocket connection lost");
        self.teardown_socket(false).await;
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.observer.on_disconnect(&cause);
        }
    }

    async fn handle_disconnect(&mut self) {
        let state = self.current_state();
        if state == ConnectionState::Closed {
            return;
        }
        let was_connected = state.is_connected();
        self.teardown_socket(was_connected).await;
        self.set_state(ConnectionState::Closed);
        info!(path = %self.path(), "websocket closed by client");
        if was_connected {
            self.observer
                .on_disconnect(&WsDisconnectCause::ClientRequested);
        }
    }

    /// Stop everything tied to the current socket and invalidate its epoch.
    async fn teardown_socket(&mut self, send_close: bool) {
        self.epoch += 1;
        self.connected_at = None;
        if let Some(task) = self.handshake_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        let Some(writer) = self.writer_ref.take() else {
            return;
        };
        if send_close {
            let close = writer.ask(WriterWrite {
                frame: WsFrame::close(CLOSE_NORMAL, "client disconnect"),
            });
            match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(path = %self.path(), "close frame not sent"),
                Err(_) => debug!(path = %self.path(), "close frame timed out"),
            }
        }
        let _ = writer.stop_gracefully().await;
        writer.wait_for_shutdown().await;
    }
}

/// Collapse kameo's delivery errors into the crate error type.
pub(crate) fn flatten_send<R, M>(
    result: Result<R, SendError<M, WebSocketError>>,
) -> WebSocketResult<R> {
    match result {
        Ok(reply) => Ok(reply),
        Err(SendError::HandlerError(err)) => Err(err),
        Err(_) => Err(WebSocketError::ActorError(
            "connection actor unavailable".to_string(),
        )),
    }
}

/// Owner of one connection actor.
///
/// Dropping the handle stops the actor, which closes any open socket.
pub struct ConnectionHandle<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    actor: ActorRef<ConnectionActor<O, T>>,
    state: watch::Receiver<ConnectionState>,
}

impl<O, T> ConnectionHandle<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    pub fn spawn(transport: T, config: TransportConfig, observer: O) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let actor = ConnectionActor::spawn(ConnectionArgs {
            transport,
            config,
            observer,
            state: state_tx,
        });
        Self { actor, state }
    }

    /// Start a handshake. Returns once the attempt is underway; watch the state for
    /// the outcome.
    pub async fn connect(&self, endpoint: Endpoint) -> WebSocketResult<()> {
        flatten_send(self.actor.ask(ConnectionCommand::Connect(endpoint)).await)
    }

    pub async fn reconnect(&self) -> WebSocketResult<()> {
        flatten_send(self.actor.ask(ConnectionCommand::Reconnect).await)
    }

    pub async fn disconnect(&self) -> WebSocketResult<()> {
        flatten_send(self.actor.ask(ConnectionCommand::Disconnect).await)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        match flatten_send(self.actor.ask(SendText(text.into())).await) {
            Ok(sent) => sent,
            Err(err) => {
                debug!(error = %err, "send failed");
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn stats(&self) -> WebSocketResult<ConnectionStats> {
        flatten_send(self.actor.ask(GetConnectionStats).await)
    }

    pub(crate) fn downgrade(&self) -> WeakActorRef<ConnectionActor<O, T>> {
        self.actor.downgrade()
    }

    /// Stop the actor and wait for its teardown to finish.
    pub async fn shutdown(&self) {
        let _ = self.actor.stop_gracefully().await;
        self.actor.wait_for_shutdown().await;
    }
}

impl<O, T> Drop for ConnectionHandle<O, T>
where
    O: ConnectionObserver,
    T: WsTransport,
{
    fn drop(&mut self) {
        if !self.actor.is_alive() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let actor = self.actor.clone();
            runtime.spawn(async move {
                let _ = actor.stop_gracefully().await;
            });
        }
    }
}
