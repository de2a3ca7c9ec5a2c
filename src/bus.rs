// 事件总线：按用户扇出变更提示，慢订阅者直接丢弃。
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

pub const EVENT_AGENTS: &str = "agents";
pub const EVENT_TASKS: &str = "tasks";
pub const EVENT_CHANNELS: &str = "channels";
pub const EVENT_CHAINS: &str = "chains";
pub const EVENT_INPUTS: &str = "inputs";
pub const EVENT_EVENTS: &str = "events";
pub const EVENT_UPDATE: &str = "update";
pub const EVENT_NOTIFICATION: &str = "notification";

const SUBSCRIBER_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

struct Subscriber {
    user_id: String,
    tx: mpsc::Sender<BusEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// Process-local publish/subscribe hub. Delivery is a best-effort hint; the
/// store remains the source of truth.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriptions with an empty `user_id` receive every event (admin
    /// streams); otherwise only events for the matching tenant arrive.
    pub fn subscribe(&self, user_id: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(
            id,
            Subscriber {
                user_id: user_id.to_string(),
                tx,
            },
        );
        BusSubscription {
            id,
            bus: self.clone(),
            rx,
        }
    }

    pub fn publish(&self, event_type: &str, user_id: &str) {
        self.fan_out(event_type, user_id, None);
    }

    pub fn publish_with_payload(&self, event_type: &str, user_id: &str, payload: Value) {
        self.fan_out(event_type, user_id, Some(payload));
    }

    fn fan_out(&self, event_type: &str, user_id: &str, payload: Option<Value>) {
        let event_type = if event_type.is_empty() {
            EVENT_UPDATE
        } else {
            event_type
        };
        let event = BusEvent {
            event_type: event_type.to_string(),
            time: Utc::now(),
            payload,
        };

        let inner = self.inner.lock();
        for sub in inner.subscribers.values() {
            if user_id.is_empty() || sub.user_id.is_empty() || sub.user_id == user_id {
                // Full buffer means a slow consumer; drop rather than block.
                let _ = sub.tx.try_send(event.clone());
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

pub struct BusSubscription {
    id: u64,
    bus: EventBus,
    rx: mpsc::Receiver<BusEvent>,
}

impl Stream for BusSubscription {
    type Item = BusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn delivers_to_matching_user_only() {
        let bus = EventBus::new();
        let mut alice = bus.subscribe("alice");
        let mut admin = bus.subscribe("");

        bus.publish(EVENT_TASKS, "alice");
        bus.publish(EVENT_TASKS, "bob");

        let got = alice.next().await.expect("alice event");
        assert_eq!(got.event_type, EVENT_TASKS);
        // Nothing else queued for alice.
        assert!(alice.rx.try_recv().is_err());

        // Admin streams see both tenants.
        assert_eq!(admin.next().await.unwrap().event_type, EVENT_TASKS);
        assert_eq!(admin.next().await.unwrap().event_type, EVENT_TASKS);
    }

    #[tokio::test]
    async fn empty_type_defaults_to_update() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("alice");
        bus.publish("", "alice");
        assert_eq!(sub.next().await.unwrap().event_type, EVENT_UPDATE);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("alice");

        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(EVENT_TASKS, "alice");
        }

        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe("alice");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn payload_travels_with_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("alice");
        bus.publish_with_payload(
            EVENT_NOTIFICATION,
            "alice",
            serde_json::json!({"message": "hi"}),
        );
        let got = sub.next().await.unwrap();
        assert_eq!(got.event_type, EVENT_NOTIFICATION);
        assert_eq!(got.payload.unwrap()["message"], "hi");
    }
}
