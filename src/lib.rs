//! Authenticated, topic-multiplexed websocket transport.
//!
//! Layers, leaves first:
//! - [`ws::connection`]: a kameo actor owning one socket; parses frames into
//!   [`Envelope`]s and never reconnects on its own.
//! - [`registry`]: topic → handler table with isolated, ordered dispatch.
//! - [`client`]: a connection plus a registry, with an optional reconnect policy.
//! - [`binding`]: lifetime-scoped ownership of one client per path, reactive status,
//!   and symmetric subscription cleanup.
//! - [`consumer`]: latest-snapshot caches, including live system metrics.

pub mod binding;
pub mod client;
pub mod consumer;
pub mod core;
pub mod credentials;
pub mod registry;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use binding::{BindOptions, Binding, BindingDeps, BindingPhase, BindingStatus, Subscriber};
pub use client::{ClientHooks, ClientOptions, TransportClient};
pub use consumer::{LatestSnapshot, RealtimeMetrics, SnapshotState, SystemMetrics};
pub use core::{
    ConnectionState, ConnectionStats, Endpoint, Envelope, TransportConfig, WebSocketError,
    WebSocketResult, WsDisconnectCause,
};
pub use credentials::{CredentialStore, EnvCredentials, StaticCredentials};
pub use registry::{TopicHandler, TopicRegistry};
pub use transport::{WsTransport, tungstenite::TungsteniteTransport};
pub use ws::{ConnectionHandle, ConnectionObserver};
