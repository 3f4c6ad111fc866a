//! In-memory transport for driving connections, clients and bindings in tests.
//!
//! [`MockTransport::channel_pair`] returns the transport plus a [`MockAcceptor`].
//! Every successful `connect` hands the acceptor one [`MockServer`], which plays the
//! remote end of that socket: it sees outbound frames, pushes inbound ones, and can
//! drop the socket.

use std::pin::Pin;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::{WebSocketBufferConfig, WebSocketError, WsFrame};
use crate::transport::{WsConnectRequest, WsTransport, WsTransportConnectFuture};

struct MockShared {
    accept_tx: mpsc::UnboundedSender<MockServer>,
    requests: Mutex<Vec<WsConnectRequest>>,
    attempts: AtomicUsize,
    refuse: AtomicBool,
}

/// Transport whose sockets are pairs of in-memory channels.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn channel_pair() -> (Self, MockAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(MockShared {
                    accept_tx,
                    requests: Mutex::new(Vec::new()),
                    attempts: AtomicUsize::new(0),
                    refuse: AtomicBool::new(false),
                }),
            },
            MockAcceptor { rx: accept_rx },
        )
    }

    /// Fail every subsequent handshake until switched back off.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every handshake request seen so far, refused ones included.
    pub fn requests(&self) -> Vec<WsConnectRequest> {
        self.shared.requests.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        request: WsConnectRequest,
        _buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.attempts.fetch_add(1, Ordering::SeqCst);
            shared.requests.lock().push(request.clone());
            if shared.refuse.load(Ordering::SeqCst) {
                return Err(WebSocketError::ConnectionFailed(
                    "mock transport refused connection".to_string(),
                ));
            }

            let (sent_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, rx) = mpsc::unbounded_channel();
            // With no acceptor the server half is dropped and the socket ends at once.
            let _ = shared.accept_tx.send(MockServer {
                request,
                outbound_rx,
                inbound_tx: Some(inbound_tx),
            });
            Ok((MockReader { rx }, MockWriter { sent_tx }))
        })
    }
}

/// Receives the server side of each accepted mock socket, in connect order.
pub struct MockAcceptor {
    rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockAcceptor {
    pub async fn accept(&mut self) -> Option<MockServer> {
        self.rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockServer> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .unwrap_or_default()
    }

    /// A socket that was already accepted, without waiting.
    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.rx.try_recv().ok()
    }
}

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MockServerError {
    #[error("mock socket already dropped")]
    SocketDropped,
    #[error("mock client side is gone")]
    ChannelClosed,
}

/// Remote end of one mock socket.
pub struct MockServer {
    request: WsConnectRequest,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
}

impl MockServer {
    /// The handshake request that opened this socket.
    pub fn request(&self) -> &WsConnectRequest {
        &self.request
    }

    /// Next frame written by the client. `None` once the client's writer is gone.
    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    pub fn send_inbound(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::text(text))
    }

    /// Send a close frame, as a server shutting the socket down would.
    pub fn send_close(&self, code: u16, reason: &'static str) -> Result<(), MockServerError> {
        self.send_inbound(WsFrame::close(code, reason))
    }

    /// End the inbound stream without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    /// Whether the client still holds the write half.
    pub fn is_client_open(&self) -> bool {
        !self.outbound_rx.is_closed()
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, WebSocketError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = WebSocketError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .sent_tx
            .send(item)
            .map_err(|_| WebSocketError::TransportError {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
