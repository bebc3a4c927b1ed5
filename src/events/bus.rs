//! Fan-out publish/subscribe bus with a bounded history ring
//!
//! Each subscription owns an unbounded channel. `publish` enqueues into
//! every matching channel while holding the registry lock, so every
//! subscriber observes events in publish order. Closed subscriber channels
//! are pruned on the next publish; a dropped [`Subscription`] unregisters
//! itself immediately.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{Event, EventKind};

/// Default number of events retained in history
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// What a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A single event kind
    Kind(EventKind),
    /// Every event (wildcard, `"*"`)
    All,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "{kind}"),
            Self::All => f.write_str("*"),
        }
    }
}

type SubscriberTx = mpsc::UnboundedSender<Arc<Event>>;

#[derive(Debug)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<Topic, Vec<(u64, SubscriberTx)>>,
    history: VecDeque<Arc<Event>>,
    capacity: usize,
}

impl Registry {
    fn deliver(&mut self, topic: Topic, event: &Arc<Event>) {
        let Some(subscribers) = self.subscribers.get_mut(&topic) else {
            return;
        };

        subscribers.retain(|(id, tx)| {
            if tx.send(Arc::clone(event)).is_ok() {
                true
            } else {
                tracing::warn!(
                    subscriber = id,
                    topic = %topic,
                    kind = %event.kind(),
                    "subscriber closed, dropping it"
                );
                false
            }
        });

        if subscribers.is_empty() {
            self.subscribers.remove(&topic);
        }
    }

    fn remove(&mut self, topic: Topic, id: u64) {
        if let Some(subscribers) = self.subscribers.get_mut(&topic) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            if subscribers.is_empty() {
                self.subscribers.remove(&topic);
            }
        }
    }
}

/// Snapshot of bus state for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub history_size: usize,
    pub buffer_size: usize,
    pub subscriber_count: usize,
    pub topics: Vec<String>,
}

/// In-process event bus
///
/// Cheap to clone; clones share subscribers and history.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl EventBus {
    /// Create a bus retaining at most `history_size` events
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        tracing::debug!(history_size, "event bus initialized");
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
                history: VecDeque::with_capacity(history_size),
                capacity: history_size,
            })),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event
    ///
    /// Delivers to subscribers of the event's kind, then to wildcard
    /// subscribers, then records it in history. Never waits for subscriber
    /// processing.
    pub fn publish(&self, event: Event) -> Arc<Event> {
        let event = Arc::new(event);
        let mut registry = self.registry();

        registry.deliver(Topic::Kind(event.kind()), &event);
        registry.deliver(Topic::All, &event);

        if registry.capacity > 0 {
            if registry.history.len() == registry.capacity {
                registry.history.pop_front();
            }
            registry.history.push_back(Arc::clone(&event));
        }
        drop(registry);

        tracing::debug!(
            kind = %event.kind(),
            request_id = event.request_id().unwrap_or("-"),
            "event published"
        );

        event
    }

    /// Subscribe to a kind or to every event
    #[must_use]
    pub fn subscribe(&self, topic: impl Into<Topic>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.entry(topic).or_default().push((id, tx));
        drop(registry);

        tracing::debug!(subscriber = id, topic = %topic, "new subscriber");

        Subscription {
            id,
            topic,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to every event
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(Topic::All)
    }

    /// Most recent events, newest first
    #[must_use]
    pub fn get_history(&self, limit: Option<usize>, kind: Option<EventKind>) -> Vec<Arc<Event>> {
        let registry = self.registry();
        registry
            .history
            .iter()
            .rev()
            .filter(|event| kind.is_none_or(|k| event.kind() == k))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop all retained history
    pub fn clear_history(&self) {
        self.registry().history.clear();
        tracing::info!("event history cleared");
    }

    /// Number of live subscriptions across all topics
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        let registry = self.registry();
        let mut topics: Vec<String> = registry.subscribers.keys().map(ToString::to_string).collect();
        topics.sort();

        BusStats {
            history_size: registry.history.len(),
            buffer_size: registry.capacity,
            subscriber_count: registry.subscribers.values().map(Vec::len).sum(),
            topics,
        }
    }
}

/// A live subscription; unregisters itself when dropped
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Wait for the next event
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.topic
    }
}

impl Stream for Subscription {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.topic, self.id);
            tracing::debug!(subscriber = self.id, topic = %self.topic, "unsubscribed");
        }
    }
}
