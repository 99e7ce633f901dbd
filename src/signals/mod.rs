//! In-process signal bus.
//!
//! Collaborators announce asynchronous facts ("window closed", "token lost")
//! on string topics. Subscribers receive an explicit [`SubscriptionHandle`];
//! cancelling it is the only way to stop delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{DesktopId, WindowId};

pub type SignalHandler = Arc<dyn Fn(Signal) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Signal {
    pub topic: String,
    pub payload: Value,
}

pub mod topics {
    use super::{DesktopId, WindowId};

    /// Fired by the main application when a desktop asks to be torn down.
    pub fn desktop_closed(desktop_id: &DesktopId) -> String {
        format!("desktop.{}.closed", desktop_id)
    }

    /// Fired by the window host once a window is gone.
    pub fn lab_closed(window_id: &WindowId) -> String {
        format!("lab.{}.closed", window_id)
    }

    pub const TRANSPORT_TOKEN_LOST: &str = "transport.token.lost";
    pub const SERVER_IDENTITY_CHANGED: &str = "server.identity.changed";
}

struct Subscriber {
    id: u64,
    handler: SignalHandler,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = self.topics.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: SignalHandler = Arc::new(move |signal| Box::pin(handler(signal)));

        self.inner
            .topics
            .lock()
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, handler });
        debug!("Subscribed #{} to {}", id, topic);

        SubscriptionHandle {
            id,
            topic,
            bus: Arc::downgrade(&self.inner),
            cancelled: AtomicBool::new(false),
        }
    }

    fn handlers_for(&self, topic: &str) -> Vec<SignalHandler> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default()
    }

    /// Fire-and-forget delivery. Handlers run on their own tasks, so this is
    /// safe to call while holding a coordinator lock.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let handlers = self.handlers_for(topic);
        debug!("Publishing {} to {} handler(s)", topic, handlers.len());
        for handler in &handlers {
            let signal = Signal {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            tokio::spawn(handler(signal));
        }
        handlers.len()
    }

    /// Delivers and waits until every handler has finished.
    pub async fn emit(&self, topic: &str, payload: Value) -> usize {
        let handlers = self.handlers_for(topic);
        debug!("Emitting {} to {} handler(s)", topic, handlers.len());
        let tasks = handlers.iter().map(|handler| {
            tokio::spawn(handler(Signal {
                topic: topic.to_string(),
                payload: payload.clone(),
            }))
        });
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Handler for {} panicked: {}", topic, e);
            }
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map(Vec::len).unwrap_or(0)
    }
}

/// Live registration on a [`SignalBus`] topic.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
    bus: Weak<BusInner>,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    /// Stops delivery. Returns `false` when the handle was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.topic, self.id);
        }
        debug!("Cancelled subscription #{} on {}", self.id, self.topic);
        true
    }
}
