//! In-process publish/subscribe bus for exec lifecycle events.
//!
//! Every subscription owns an unbounded queue, so `publish` never waits on a
//! slow subscriber, and events from one publisher reach each subscriber in the
//! order they were published. A subscriber whose queue is gone is pruned on the
//! next publish without affecting anyone else.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use mexec_topics::{TOPIC_EXEC_ERROR, TOPIC_EXEC_EXIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "onExecError")]
    ExecError,
    #[serde(rename = "onExecExit")]
    ExecExit,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::ExecError, EventKind::ExecExit];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ExecError => TOPIC_EXEC_ERROR,
            EventKind::ExecExit => TOPIC_EXEC_EXIT,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable event envelope (RFC3339 time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: String,
    pub kind: EventKind,
    pub payload: Value,
}

impl Event {
    pub fn new<T: Serialize>(kind: EventKind, payload: &T) -> Self {
        let time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let payload =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        Self {
            time,
            kind,
            payload,
        }
    }

    pub fn exec_exit(session_id: &str, code: Option<i32>) -> Self {
        Self::new(
            EventKind::ExecExit,
            &serde_json::json!({ "id": session_id, "code": code }),
        )
    }

    pub fn exec_error(session_id: &str, detail: &str) -> Self {
        Self::new(
            EventKind::ExecError,
            &serde_json::json!({ "id": session_id, "stack": detail }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("consumer closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Receives events on a dedicated delivery task owned by the bus.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    async fn accept(&self, event: Event) -> Result<(), DeliveryError>;
}

struct Subscriber {
    kinds: HashSet<EventKind>,
    tx: mpsc::UnboundedSender<Event>,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    shut_down: AtomicBool,
}

impl Inner {
    fn remove(&self, id: SubscriptionId) -> bool {
        match self.subscribers.write().remove(&id) {
            Some(sub) => {
                sub.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Channel-backed subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Event>,
    active: Arc<AtomicBool>,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next matching event, or `None` once unsubscribed or the bus shut down.
    /// Events still queued at unsubscribe time are discarded.
    pub async fn recv(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        self.active.load(Ordering::Acquire).then_some(event)
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        let event = self.rx.try_recv().ok()?;
        self.active.load(Ordering::Acquire).then_some(event)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id);
        }
    }
}

/// Process-wide event hub. Cloning shares the same subscriber set.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        if self.inner.shut_down.load(Ordering::Acquire) {
            // tx dropped here, so the first recv yields None
            active.store(false, Ordering::Release);
        } else {
            self.inner.subscribers.write().insert(
                id,
                Subscriber {
                    kinds: kinds.iter().copied().collect(),
                    tx,
                    active: active.clone(),
                },
            );
            trace!(subscription = %id, ?kinds, "subscribed");
        }
        Subscription {
            id,
            rx,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe a consumer for any of `kinds`. Deliveries run on a spawned task,
    /// so this must be called from within a tokio runtime. A consumer that fails
    /// to accept an event is unsubscribed.
    pub fn subscribe_any(&self, consumer: Arc<dyn Consumer>, kinds: &[EventKind]) -> SubscriptionId {
        let mut sub = self.subscribe(kinds);
        let id = sub.id();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let kind = event.kind;
                if let Err(err) = consumer.accept(event).await {
                    debug!(subscription = %id, %kind, %err, "consumer rejected event; unsubscribing");
                    break;
                }
            }
            // dropping `sub` removes the registration
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.remove(id);
        if removed {
            trace!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every subscription whose kind set contains its kind.
    /// Returns how many subscriptions accepted it into their queue.
    pub fn publish(&self, event: Event) -> usize {
        metrics::counter!("mexec_events_published_total", "kind" => event.kind.as_str())
            .increment(1);
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subs = self.inner.subscribers.read();
            for (id, sub) in subs.iter() {
                if !sub.kinds.contains(&event.kind) {
                    continue;
                }
                if sub.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            if self.inner.remove(id) {
                debug!(subscription = %id, "pruned subscription with closed queue");
            }
        }
        trace!(kind = %event.kind, delivered, "event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Drop every subscription. Later subscriptions are created closed.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.inner.subscribers.write().drain().collect();
        for (_, sub) in &drained {
            sub.active.store(false, Ordering::Release);
        }
        if !drained.is_empty() {
            warn!(count = drained.len(), "event bus shut down with live subscriptions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn delivers_only_to_matching_kinds() {
        let bus = Bus::new();
        let mut exits = bus.subscribe(&[EventKind::ExecExit]);
        let mut errors = bus.subscribe(&[EventKind::ExecError]);
        let mut both = bus.subscribe(&EventKind::ALL);

        assert_eq!(bus.publish(Event::exec_exit("s1", Some(0))), 2);

        let ev = exits.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::ExecExit);
        assert_eq!(ev.payload["id"], "s1");
        assert_eq!(both.recv().await.unwrap().kind, EventKind::ExecExit);
        assert!(errors.try_recv().is_none());
        assert!(exits.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::ExecExit]);
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert_eq!(bus.publish(Event::exec_exit("s1", Some(1))), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn queued_events_are_discarded_after_unsubscribe() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::ExecError]);
        bus.publish(Event::exec_error("s1", "boom"));
        bus.unsubscribe(sub.id());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let bus = Bus::new();
        let sub = bus.subscribe(&[EventKind::ExecExit]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&[EventKind::ExecExit]);
        for i in 0..50 {
            bus.publish(Event::exec_exit(&format!("s{i}"), Some(i)));
        }
        for i in 0..50 {
            let ev = sub.recv().await.unwrap();
            assert_eq!(ev.payload["code"], i);
        }
    }

    struct FailingConsumer;

    #[async_trait]
    impl Consumer for FailingConsumer {
        async fn accept(&self, _event: Event) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    struct ForwardingConsumer(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl Consumer for ForwardingConsumer {
        async fn accept(&self, event: Event) -> Result<(), DeliveryError> {
            self.0.send(event).map_err(|_| DeliveryError::Closed)
        }
    }

    #[tokio::test]
    async fn failing_consumer_is_isolated_and_pruned() {
        let bus = Bus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_any(Arc::new(FailingConsumer), &EventKind::ALL);
        bus.subscribe_any(Arc::new(ForwardingConsumer(tx)), &EventKind::ALL);

        bus.publish(Event::exec_error("s1", "first"));
        let ev = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.payload["stack"], "first");

        // the failing consumer's delivery task exits and drops its registration
        timeout(Duration::from_secs(1), async {
            while bus.subscriber_count() != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        bus.publish(Event::exec_error("s1", "second"));
        let ev = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.payload["stack"], "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribe_and_publish_delivers_exactly_once() {
        let bus = Bus::new();
        let kind_sets: [&[EventKind]; 3] = [
            &[EventKind::ExecExit],
            &[EventKind::ExecError],
            &[EventKind::ExecExit, EventKind::ExecError],
        ];

        let mut joins = Vec::new();
        for i in 0..100usize {
            let bus = bus.clone();
            let kinds = kind_sets[i % 3];
            joins.push(tokio::spawn(async move { (kinds, bus.subscribe(kinds)) }));
        }
        let mut subs = Vec::new();
        for join in joins {
            subs.push(join.await.unwrap());
        }
        assert_eq!(bus.subscriber_count(), 100);

        // 100 events split over 4 concurrent publishers
        let mut publishers = Vec::new();
        for p in 0..4i32 {
            let bus = bus.clone();
            publishers.push(tokio::spawn(async move {
                for n in 0..25i32 {
                    let seq = p * 25 + n;
                    let event = if seq % 2 == 0 {
                        Event::exec_exit(&format!("p{p}"), Some(seq))
                    } else {
                        Event::exec_error(&format!("p{p}"), &seq.to_string())
                    };
                    bus.publish(event);
                }
            }));
        }
        for publisher in publishers {
            publisher.await.unwrap();
        }

        for (kinds, sub) in subs.iter_mut() {
            // 50 events of each kind were published
            let expected = kinds.len() * 50;
            let mut seen = 0;
            let mut last_per_publisher: HashMap<String, i64> = HashMap::new();
            while let Some(ev) = sub.try_recv() {
                assert!(kinds.contains(&ev.kind));
                let seq = match ev.kind {
                    EventKind::ExecExit => ev.payload["code"].as_i64().unwrap(),
                    EventKind::ExecError => ev.payload["stack"].as_str().unwrap().parse().unwrap(),
                };
                let publisher = ev.payload["id"].as_str().unwrap().to_string();
                if let Some(prev) = last_per_publisher.insert(publisher, seq) {
                    assert!(prev < seq, "per-publisher order violated");
                }
                seen += 1;
            }
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&EventKind::ALL);
        bus.shutdown();
        assert!(sub.recv().await.is_none());
        let mut late = bus.subscribe(&EventKind::ALL);
        assert_eq!(bus.publish(Event::exec_exit("s", None)), 0);
        assert!(late.recv().await.is_none());
    }
}
