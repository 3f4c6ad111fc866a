//! Topic → handler table shared between a client and the code subscribing on it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

use crate::core::Envelope;

/// A handler for one topic.
///
/// Identity is the allocation: clones of one handler are the same handler, two
/// handlers built from identical closures are not.
#[derive(Clone)]
pub struct TopicHandler(Arc<dyn Fn(&Envelope) + Send + Sync>);

impl TopicHandler {
    pub fn new(f: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, envelope: &Envelope) {
        (self.0)(envelope)
    }
}

impl PartialEq for TopicHandler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TopicHandler {}

impl fmt::Debug for TopicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicHandler({:p})", Arc::as_ptr(&self.0))
    }
}

impl<F> From<F> for TopicHandler
where
    F: Fn(&Envelope) + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

/// Run `f`, logging instead of unwinding if it panics. Returns whether it completed.
///
/// `scope` is the topic for topic handlers and the endpoint path for lifecycle hooks.
pub(crate) fn call_isolated(handler: &str, scope: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(scope, handler, panic = %message, "handler panicked");
            false
        }
    }
}

/// Mapping from topic name to the ordered list of handlers registered on it.
///
/// A handler appears at most once per topic. Topics without handlers are removed.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: RwLock<HashMap<String, Vec<TopicHandler>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `topic`. Returns `false` if it was already registered.
    pub fn subscribe(&self, topic: &str, handler: TopicHandler) -> bool {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(topic.to_string()).or_default();
        if list.contains(&handler) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Remove `handler` from `topic`. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, topic: &str, handler: &TopicHandler) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h != handler);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    /// Invoke every handler registered on the envelope's topic, in registration order.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe. A
    /// panicking handler is logged and the remaining handlers still run. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let snapshot = match self.handlers.read().get(envelope.topic()) {
            Some(list) => list.clone(),
            None => {
                trace!(topic = envelope.topic(), "no handlers for topic");
                return 0;
            }
        };
        for handler in &snapshot {
            call_isolated("topic", envelope.topic(), || handler.call(envelope));
        }
        snapshot.len()
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.handlers.read().get(topic).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}
