//! Consumers built purely on subscribe/unsubscribe.

use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::binding::{BindOptions, Binding, BindingDeps, BindingStatus, Subscriber};
use crate::core::Envelope;
use crate::registry::TopicHandler;
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

pub const SYSTEM_METRICS: &str = "system_metrics";

/// Default path of the metrics stream.
pub const METRICS_PATH: &str = "/ws/metrics";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotState {
    /// Most recent envelope on the topic, kept whole.
    pub value: Option<Envelope>,
    /// Local receipt time of `value`.
    pub last_update: Option<SystemTime>,
}

struct Attachment {
    subscriber: Subscriber,
    status: watch::Receiver<BindingStatus>,
}

/// Caches the latest envelope seen on one topic.
pub struct LatestSnapshot {
    topic: String,
    state: Arc<watch::Sender<SnapshotState>>,
    handler: TopicHandler,
    attached: Option<Attachment>,
}

impl LatestSnapshot {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let (state, _) = watch::channel(SnapshotState::default());
        let state = Arc::new(state);
        let handler = {
            let topic = topic.clone();
            let state = Arc::clone(&state);
            TopicHandler::new(move |envelope| {
                if envelope.topic() != topic {
                    return;
                }
                state.send_replace(SnapshotState {
                    value: Some(envelope.clone()),
                    last_update: Some(SystemTime::now()),
                });
            })
        };
        Self {
            topic,
            state,
            handler,
            attached: None,
        }
    }

    /// Subscribe through `binding`, replacing any previous attachment.
    pub fn attach<T: WsTransport>(&mut self, binding: &Binding<T>) -> bool {
        self.detach();
        let subscriber = binding.subscriber().clone();
        let added = subscriber.subscribe(&self.topic, self.handler.clone());
        self.attached = Some(Attachment {
            subscriber,
            status: binding.watch_status(),
        });
        added
    }

    /// Unsubscribe the handler registered by `attach`.
    pub fn detach(&mut self) -> bool {
        match self.attached.take() {
            Some(attachment) => attachment.subscriber.unsubscribe(&self.topic, &self.handler),
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Feed one envelope directly; envelopes on other topics are ignored.
    pub fn handle(&self, envelope: &Envelope) {
        self.handler.call(envelope);
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handler(&self) -> &TopicHandler {
        &self.handler
    }

    pub fn value(&self) -> Option<Envelope> {
        self.state.borrow().value.clone()
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.state.borrow().last_update
    }

    pub fn snapshot(&self) -> SnapshotState {
        self.state.borrow().clone()
    }

    /// Changes only when a matching envelope arrives.
    pub fn watch(&self) -> watch::Receiver<SnapshotState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.attached
            .as_ref()
            .is_some_and(|a| a.status.borrow().is_connected)
    }
}

impl Drop for LatestSnapshot {
    fn drop(&mut self) {
        self.detach();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub percent: f64,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent: f64,
}

/// Payload of a `system_metrics` envelope. `timestamp` is the server's, verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: String,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
}

/// Live system metrics: a binding on the metrics path plus a `system_metrics`
/// snapshot attached to it.
pub struct RealtimeMetrics<T: WsTransport = TungsteniteTransport> {
    binding: Binding<T>,
    snapshot: LatestSnapshot,
}

impl<T: WsTransport> RealtimeMetrics<T> {
    /// Bind [`METRICS_PATH`] and connect.
    pub async fn mount(deps: BindingDeps<T>) -> Self {
        Self::mount_with(METRICS_PATH, BindOptions::auto(), deps).await
    }

    pub async fn mount_with(
        path: impl Into<String>,
        options: BindOptions,
        deps: BindingDeps<T>,
    ) -> Self {
        let mut binding = Binding::new(path, options, deps);
        let mut snapshot = LatestSnapshot::new(SYSTEM_METRICS);
        // Attach before connecting so the first frame is not missed.
        snapshot.attach(&binding);
        if binding.options().auto_connect {
            binding.connect().await;
        }
        Self { binding, snapshot }
    }

    /// Switch paths; the snapshot follows the new binding. The cached value is kept
    /// until the new stream delivers.
    pub async fn set_path(&mut self, path: impl Into<String>) {
        if !self.binding.repath(path.into()).await {
            return;
        }
        self.snapshot.attach(&self.binding);
        if self.binding.options().auto_connect {
            self.binding.connect().await;
        }
    }

    pub async fn unmount(mut self) {
        self.snapshot.detach();
        self.binding.unbind().await;
    }

    /// Latest metrics, if one has arrived and decodes.
    pub fn metrics(&self) -> Option<SystemMetrics> {
        let envelope = self.snapshot.value()?;
        match envelope.decode::<SystemMetrics>() {
            Ok(metrics) => Some(metrics),
            Err(err) => {
                warn!(topic = SYSTEM_METRICS, error = %err, "undecodable system metrics payload");
                None
            }
        }
    }

    pub fn value(&self) -> Option<Envelope> {
        self.snapshot.value()
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.snapshot.last_update()
    }

    pub fn watch(&self) -> watch::Receiver<SnapshotState> {
        self.snapshot.watch()
    }

    pub fn is_connected(&self) -> bool {
        self.binding.is_connected()
    }

    pub fn snapshot(&self) -> &LatestSnapshot {
        &self.snapshot
    }

    pub fn binding(&self) -> &Binding<T> {
        &self.binding
    }

    /// Deliver an envelope as if it came off the socket.
    pub fn handle(&self, envelope: &Envelope) {
        debug!(topic = envelope.topic(), "metrics envelope delivered directly");
        self.binding.registry().dispatch(envelope);
    }
}
