//! Event bus interface consumed by the workflow manager
//!
//! The platform bus implementation is external; the engine only needs
//! subscribe-with-filter. An in-process implementation is provided for the
//! worker binary and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use garrison_domain::ServerEvent;

/// Default subscriber channel capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Subscription filter: which event types to receive
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// Event types to receive; empty means all
    pub event_types: Vec<String>,

    /// Buffered channel capacity
    pub capacity: usize,
}

impl EventFilter {
    /// Unrestricted filter with the default capacity
    #[must_use]
    pub fn all() -> Self {
        Self {
            event_types: Vec::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Filter to specific event types
    #[must_use]
    pub fn for_types(event_types: Vec<String>) -> Self {
        Self {
            event_types,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    fn matches(&self, event: &ServerEvent) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == &event.event_type)
    }
}

/// A live subscription: an id, the event channel, and an unsubscribe handle.
///
/// Unsubscribes on drop; the manager holds this handle rather than the bus
/// holding manager callbacks.
pub struct Subscription {
    /// Subscription identifier
    pub id: Uuid,

    /// Channel of matched events
    pub receiver: mpsc::Receiver<ServerEvent>,

    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Explicitly unsubscribe from the bus
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Trait for event bus implementations (consumed side)
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Subscribe with a filter, returning a buffered subscription
    async fn subscribe(&self, filter: EventFilter) -> Subscription;
}

// =============================================================================
// In-Process Bus
// =============================================================================

struct Subscriber {
    filter: EventFilter,
    sender: mpsc::Sender<ServerEvent>,
}

/// In-process event bus backed by bounded per-subscriber channels.
///
/// Publishing never blocks: a full subscriber channel drops the event for
/// that subscriber with a warning.
#[derive(Default)]
pub struct InProcessEventBus {
    subscribers: Arc<Mutex<HashMap<Uuid, Subscriber>>>,
}

impl InProcessEventBus {
    /// Create a new bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to all matching subscribers
    pub fn publish(&self, event: &ServerEvent) {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(event) {
                continue;
            }
            if let Err(e) = subscriber.sender.try_send(event.clone()) {
                tracing::warn!(subscription = %id, event_type = %event.event_type,
                    error = %e, "dropping event for slow subscriber");
            }
        }
    }

    /// Number of active subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(filter.capacity.max(1));

        {
            let mut subscribers = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.insert(id, Subscriber { filter, sender });
        }

        let registry = Arc::clone(&self.subscribers);
        let unsubscribe = Box::new(move || {
            if let Ok(mut subscribers) = registry.lock() {
                subscribers.remove(&id);
            }
        });

        Subscription {
            id,
            receiver,
            unsubscribe: Some(unsubscribe),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_domain::{ServerId, Value};

    fn event(event_type: &str) -> ServerEvent {
        ServerEvent::new(event_type, ServerId::new(), Value::empty_map())
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InProcessEventBus::new();
        let mut sub = bus.subscribe(EventFilter::all()).await;

        bus.publish(&event("chat_message"));
        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.event_type, "chat_message");
    }

    #[tokio::test]
    async fn test_type_filter() {
        let bus = InProcessEventBus::new();
        let mut sub = bus
            .subscribe(EventFilter::for_types(vec!["player_banned".to_string()]))
            .await;

        bus.publish(&event("chat_message"));
        bus.publish(&event("player_banned"));

        let received = sub.receiver.recv().await.unwrap();
        assert_eq!(received.event_type, "player_banned");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let bus = InProcessEventBus::new();
        let sub = bus.subscribe(EventFilter::all()).await;
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_event() {
        let bus = InProcessEventBus::new();
        let mut filter = EventFilter::all();
        filter.capacity = 1;
        let mut sub = bus.subscribe(filter).await;

        bus.publish(&event("a"));
        bus.publish(&event("b")); // dropped, channel full

        assert_eq!(sub.receiver.recv().await.unwrap().event_type, "a");
        assert!(sub.receiver.try_recv().is_err());
    }
}
