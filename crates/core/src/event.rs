//! Event bus: decoupled communication between the scheduling subsystems.
//!
//! Every signal in the runtime (timer ticks, perception changes, dispatch
//! results, delegation lifecycle) travels as an [`Event`] with a two-segment
//! type such as `trigger:workspace`. Subscribers register against an exact
//! type or a whole category (`trigger:*`).
//!
//! Delivery to subscribers is synchronous: `emit` invokes every matching
//! subscriber, in registration order, before it returns. A panicking
//! subscriber is isolated and logged; the remaining subscribers still run.
//!
//! Async consumers that only observe (log sinks, dashboards) can use
//! [`EventBus::subscribe`] or [`EventBus::stream`] instead, which are backed by
//! a `tokio::sync::broadcast` channel and may lag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// A discrete, named occurrence. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `"<category>:<name>"`, e.g. `trigger:telegram`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Free-form payload, always a JSON object
    pub data: serde_json::Value,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        let data = if data.is_null() {
            serde_json::json!({})
        } else {
            data
        };
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// The segment before the colon (`trigger` for `trigger:cron`).
    pub fn category(&self) -> &str {
        self.event_type
            .split_once(':')
            .map_or(self.event_type.as_str(), |(category, _)| category)
    }

    /// The segment after the colon (`cron` for `trigger:cron`).
    pub fn name(&self) -> &str {
        self.event_type
            .split_once(':')
            .map_or("", |(_, name)| name)
    }

    /// Convenience accessor for string fields of `data`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

/// What a subscription listens for. Parsed once at registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// Exactly one event type.
    Exact(String),
    /// Every type in a category (`"<category>:*"`).
    Category(String),
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(":*") {
            Some(category) => EventPattern::Category(category.to_string()),
            None => EventPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventPattern::Exact(expected) => expected == event_type,
            EventPattern::Category(category) => event_type
                .strip_prefix(category.as_str())
                .is_some_and(|rest| rest.starts_with(':')),
        }
    }
}

impl From<&str> for EventPattern {
    fn from(pattern: &str) -> Self {
        EventPattern::parse(pattern)
    }
}

impl From<String> for EventPattern {
    fn from(pattern: String) -> Self {
        EventPattern::parse(&pattern)
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::Exact(event_type) => write!(f, "{event_type}"),
            EventPattern::Category(category) => write!(f, "{category}:*"),
        }
    }
}

/// Something that reacts to events. Implemented for plain closures.
pub trait Subscriber: Send + Sync {
    fn notify(&self, event: &Event);
}

impl<F> Subscriber for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn notify(&self, event: &Event) {
        self(event)
    }
}

/// Wrap a closure as a shareable subscriber handle.
///
/// Keep the returned `Arc` if you intend to call [`EventBus::off`] later;
/// removal is by handle identity.
pub fn handler<F>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Opaque handle returned by `on`/`once`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: EventPattern,
    subscriber: Arc<dyn Subscriber>,
    once: bool,
}

fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Typed publish/subscribe hub with category wildcards.
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    /// Create a new event bus. `capacity` bounds the broadcast buffer used by
    /// async observers; synchronous subscribers are unaffected by it.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Publish an event. `Value::Null` data becomes `{}`.
    ///
    /// Matching subscribers run synchronously, in registration order.
    /// One-shot subscriptions are removed before any of them runs, so a
    /// re-entrant `emit` from inside a handler cannot fire them twice.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) -> Arc<Event> {
        let event = Arc::new(Event::new(event_type, data));

        let targets: Vec<(SubscriptionId, Arc<dyn Subscriber>)> = {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let targets = subs
                .iter()
                .filter(|s| s.pattern.matches(event_type))
                .map(|s| (s.id, Arc::clone(&s.subscriber)))
                .collect();
            subs.retain(|s| !(s.once && s.pattern.matches(event_type)));
            targets
        };

        for (id, subscriber) in targets {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify(&event)));
            if outcome.is_err() {
                warn!(
                    event_type = %event.event_type,
                    subscription = id.0,
                    "Event subscriber panicked; remaining subscribers still notified"
                );
            }
        }

        // No async observers is fine
        let _ = self.sender.send(Arc::clone(&event));
        event
    }

    /// Publish an event with an empty payload.
    pub fn emit_empty(&self, event_type: &str) -> Arc<Event> {
        self.emit(event_type, serde_json::Value::Null)
    }

    /// Register a persistent subscriber.
    pub fn on(
        &self,
        pattern: impl Into<EventPattern>,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        self.register(pattern.into(), subscriber, false)
    }

    /// Register a subscriber that fires for at most one matching event.
    pub fn once(
        &self,
        pattern: impl Into<EventPattern>,
        subscriber: Arc<dyn Subscriber>,
    ) -> SubscriptionId {
        self.register(pattern.into(), subscriber, true)
    }

    /// Remove the most recent subscription registered with this pattern and
    /// subscriber handle. No-op when nothing matches.
    pub fn off(&self, pattern: impl Into<EventPattern>, subscriber: &Arc<dyn Subscriber>) {
        let pattern = pattern.into();
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = subs
            .iter()
            .rposition(|s| s.pattern == pattern && same_subscriber(&s.subscriber, subscriber))
        {
            subs.remove(pos);
            debug!(pattern = %pattern, "Subscriber removed");
        }
    }

    /// Remove a subscription by id. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() < before
    }

    /// Remove every subscription for `pattern`, or all subscriptions.
    pub fn remove_all(&self, pattern: Option<EventPattern>) {
        let mut subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match pattern {
            Some(pattern) => subs.retain(|s| s.pattern != pattern),
            None => subs.clear(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive every emitted event asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    /// Asynchronous stream of events matching `pattern`. Lagged events are
    /// skipped with a warning.
    pub fn stream(
        &self,
        pattern: impl Into<EventPattern>,
    ) -> impl Stream<Item = Arc<Event>> + Send + 'static {
        let pattern = pattern.into();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| match item {
            Ok(event) if pattern.matches(&event.event_type) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, pattern = %pattern, "Event stream lagged");
                None
            }
        })
    }

    fn register(
        &self,
        pattern: EventPattern,
        subscriber: Arc<dyn Subscriber>,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(pattern = %pattern, once, "Subscriber registered");
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                pattern,
                subscriber,
                once,
            });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
