//! tokio-tungstenite transport.
//!
//! The socket is split once; each half is adapted to [`WsFrame`] with plain
//! combinators, so the reader and writer types are just named adapter stacks.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    future::{self, Ready},
    sink::{SinkMapErr, With},
    stream::{Map, SplitSink, SplitStream},
};
use http::{HeaderValue, header::AUTHORIZATION};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Error as TungsteniteError, Message as TungsteniteMessage, Utf8Bytes,
        client::IntoClientRequest,
        protocol::{CloseFrame, WebSocketConfig},
    },
};

use super::{WsConnectRequest, WsTransport, WsTransportConnectFuture};
use crate::core::{WebSocketBufferConfig, WebSocketError, WsCloseFrame, WsFrame};
use crate::tls::install_rustls_crypto_provider;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ReadFn = fn(Result<TungsteniteMessage, TungsteniteError>) -> Result<WsFrame, WebSocketError>;
type WriteErrFn = fn(TungsteniteError) -> WebSocketError;
type WriteFn = fn(WsFrame) -> Ready<Result<TungsteniteMessage, WebSocketError>>;

/// Inbound half: tungstenite messages mapped to frames.
pub type TungsteniteReader = Map<SplitStream<Socket>, ReadFn>;

/// Outbound half: frames mapped to tungstenite messages.
pub type TungsteniteWriter = With<
    SinkMapErr<SplitSink<Socket, TungsteniteMessage>, WriteErrFn>,
    TungsteniteMessage,
    WsFrame,
    Ready<Result<TungsteniteMessage, WebSocketError>>,
    WriteFn,
>;

fn transport_error(context: &'static str, err: impl ToString) -> WebSocketError {
    WebSocketError::TransportError {
        context,
        error: err.to_string(),
    }
}

fn read_frame(msg: Result<TungsteniteMessage, TungsteniteError>) -> Result<WsFrame, WebSocketError> {
    msg.map(msg_to_frame)
        .map_err(|err| transport_error("read", err))
}

fn write_error(err: TungsteniteError) -> WebSocketError {
    transport_error("write", err)
}

fn write_frame(frame: WsFrame) -> Ready<Result<TungsteniteMessage, WebSocketError>> {
    future::ready(Ok(frame_to_msg(frame)))
}

fn msg_to_frame(msg: TungsteniteMessage) -> WsFrame {
    match msg {
        TungsteniteMessage::Text(text) => WsFrame::Text(Bytes::from(text)),
        TungsteniteMessage::Binary(bytes) => WsFrame::Binary(bytes),
        TungsteniteMessage::Ping(bytes) => WsFrame::Ping(bytes),
        TungsteniteMessage::Pong(bytes) => WsFrame::Pong(bytes),
        TungsteniteMessage::Close(close) => WsFrame::Close(close.map(|c| WsCloseFrame {
            code: c.code.into(),
            reason: Bytes::from(c.reason),
        })),
        // Raw frames only surface when reading with a custom codec.
        TungsteniteMessage::Frame(_) => WsFrame::Binary(Bytes::new()),
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        // A text frame that is not UTF-8 would fail the peer's validation.
        WsFrame::Text(bytes) => Utf8Bytes::try_from(bytes.clone())
            .map(TungsteniteMessage::Text)
            .unwrap_or(TungsteniteMessage::Binary(bytes)),
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(close) => TungsteniteMessage::Close(close.map(|c| CloseFrame {
            code: c.code.into(),
            reason: Utf8Bytes::try_from(c.reason).unwrap_or_default(),
        })),
    }
}

fn socket_config(buffers: WebSocketBufferConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .write_buffer_size(buffers.write_buffer_bytes)
        .max_write_buffer_size(buffers.max_write_buffer_bytes)
        .max_message_size(Some(buffers.max_message_bytes))
        .max_frame_size(Some(buffers.max_frame_bytes))
}

/// Production transport backed by tokio-tungstenite.
///
/// The bearer token travels as an `Authorization: Bearer` handshake header.
#[derive(Clone, Default)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    /// Use a specific TLS connector for `wss://` urls.
    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }
}

impl WsTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(
        &self,
        request: WsConnectRequest,
        buffers: WebSocketBufferConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut handshake = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|err| transport_error("request", err))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", request.token))
                .map_err(|err| transport_error("auth_header", err))?;
            handshake.headers_mut().insert(AUTHORIZATION, bearer);

            let (socket, _response) = connect_async_tls_with_config(
                handshake,
                Some(socket_config(buffers)),
                true,
                connector,
            )
            .await
            .map_err(|err| WebSocketError::ConnectionFailed(err.to_string()))?;

            let (write, read) = socket.split();
            let reader: TungsteniteReader = read.map(read_frame as ReadFn);
            let writer: TungsteniteWriter = write
                .sink_map_err(write_error as WriteErrFn)
                .with(write_frame as WriteFn);
            Ok((reader, writer))
        })
    }
}
