use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::envelope::EnvelopeError;

/// Convenience result alias for websocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// Canonical error surface shared across the transport layer.
///
/// Precondition failures (`MissingToken`, `UnresolvableUrl`) are returned by the
/// connection-level API; the binding layer logs and swallows them so they never
/// reach consumer code.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("No authentication token found")]
    MissingToken,

    #[error("Unresolvable websocket url for path {path:?}: {reason}")]
    UnresolvableUrl { path: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] EnvelopeError),

    #[error("Serialize failed: {0}")]
    Serialize(String),

    #[error("Actor error: {0}")]
    ActorError(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// State of one physical connection.
///
/// Exactly one value is current at any instant; it is published through a watch
/// channel so reads never touch the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Handshake started by a reconnect policy after a drop.
    Reconnecting,
    /// Explicitly disconnected. A later connect is still allowed.
    Closed,
}

impl ConnectionState {
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Handshake in flight or socket open.
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        // Dashboard events are small JSON documents; 1 MiB leaves room for snapshots.
        Self {
            write_buffer_bytes: 64 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 1 << 20,
            max_frame_bytes: 1 << 20,
        }
    }
}

/// Canonical disconnect causes reported to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsDisconnectCause {
    /// Server sent a close frame or the stream ended.
    RemoteClosed { code: Option<u16>, reason: String },
    ReadFailure { error: String },
    WriteFailure { error: String },
    /// `disconnect()` was called while connected.
    ClientRequested,
}

impl fmt::Display for WsDisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WsDisconnectCause::RemoteClosed { code, reason } => match code {
                Some(code) => write!(f, "remote closed (code={code} reason={reason})"),
                None => write!(f, "remote closed ({reason})"),
            },
            WsDisconnectCause::ReadFailure { error } => write!(f, "read failure: {error}"),
            WsDisconnectCause::WriteFailure { error } => write!(f, "write failure: {error}"),
            WsDisconnectCause::ClientRequested => f.write_str("client requested"),
        }
    }
}

/// Abstract reconnect strategy trait.
///
/// Strategies are driven from outside the connection, which itself never retries.
pub trait WsReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
    fn should_retry(&self) -> bool;
}

/// Counters kept by a connection actor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Successful handshakes.
    pub connects: u64,
    /// Envelopes forwarded to the observer.
    pub messages: u64,
    pub malformed: u64,
    pub sent: u64,
    /// Sends rejected because the socket was not open.
    pub dropped_sends: u64,
    /// Age of the current socket, if open.
    pub uptime: Option<Duration>,
}
