use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{WebSocketBufferConfig, WebSocketError, WsFrame};

pub mod tungstenite;

/// Everything a transport needs to open one authenticated socket.
#[derive(Clone, PartialEq, Eq)]
pub struct WsConnectRequest {
    pub url: String,
    /// Bearer token; the transport decides how it travels (tungstenite uses the
    /// `Authorization` header).
    pub token: String,
}

impl fmt::Debug for WsConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnectRequest")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), WebSocketError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The connection actor owns state and policy; the transport only opens sockets and
/// exposes them as a frame stream plus a frame sink, so tests can swap in
/// [`crate::testing::MockTransport`].
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, WebSocketError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = WebSocketError> + Send + Unpin + 'static;

    fn connect(
        &self,
        request: WsConnectRequest,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
