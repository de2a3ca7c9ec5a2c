// 通知跟踪：进程内去重用户可见的代理提醒。
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

const NOTIFICATION_COOLDOWN_MINUTES: i64 = 5;

pub const NOTIFY_SETUP_WAITING: &str = "setup_waiting";

/// A stored notification visible to one user, keyed by `agent_id:type`.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub key: String,
    pub user_id: String,
    pub agent_id: String,
    pub agent_name: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub channel: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    /// Cooldown tracker, key `agent_id:type`.
    sent: HashMap<String, DateTime<Utc>>,
    /// Stored notifications per user.
    items: HashMap<String, Vec<Notification>>,
}

/// In-memory and non-durable: a UX optimization, not a delivery guarantee.
#[derive(Default)]
pub struct NotificationTracker {
    inner: Mutex<Inner>,
}

fn cooldown_key(agent_id: &str, notification_type: &str) -> String {
    format!("{agent_id}:{notification_type}")
}

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff this agent+type has not been pushed within the cooldown;
    /// arms the cooldown as a side effect.
    pub fn should_notify(&self, agent_id: &str, notification_type: &str) -> bool {
        let mut inner = self.inner.lock();
        let key = cooldown_key(agent_id, notification_type);
        let now = Utc::now();
        if let Some(last) = inner.sent.get(&key) {
            if now - *last < Duration::minutes(NOTIFICATION_COOLDOWN_MINUTES) {
                return false;
            }
        }
        inner.sent.insert(key, now);
        true
    }

    /// Stores a notification, replacing any existing entry with the same key.
    pub fn add(&self, notification: Notification) {
        let mut inner = self.inner.lock();
        let list = inner
            .items
            .entry(notification.user_id.clone())
            .or_default();
        if let Some(existing) = list.iter_mut().find(|n| n.key == notification.key) {
            *existing = notification;
            return;
        }
        list.push(notification);
    }

    pub fn list(&self, user_id: &str) -> Vec<Notification> {
        let inner = self.inner.lock();
        inner.items.get(user_id).cloned().unwrap_or_default()
    }

    /// Removes one notification for a user and disarms the cooldown.
    pub fn dismiss(&self, user_id: &str, agent_id: &str, notification_type: &str) {
        let mut inner = self.inner.lock();
        let key = cooldown_key(agent_id, notification_type);
        inner.sent.remove(&key);
        if let Some(list) = inner.items.get_mut(user_id) {
            list.retain(|n| n.key != key);
        }
    }

    /// Removes the agent+type notification across all users; used when the
    /// underlying condition clears.
    pub fn clear_by_agent(&self, agent_id: &str, notification_type: &str) {
        let mut inner = self.inner.lock();
        let key = cooldown_key(agent_id, notification_type);
        inner.sent.remove(&key);
        for list in inner.items.values_mut() {
            list.retain(|n| n.key != key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(user: &str, agent: &str, message: &str) -> Notification {
        Notification {
            key: cooldown_key(agent, NOTIFY_SETUP_WAITING),
            user_id: user.to_string(),
            agent_id: agent.to_string(),
            agent_name: format!("agent-{agent}"),
            notification_type: NOTIFY_SETUP_WAITING.to_string(),
            channel: String::new(),
            message: message.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cooldown_suppresses_repeat_sends() {
        let tracker = NotificationTracker::new();
        assert!(tracker.should_notify("a1", NOTIFY_SETUP_WAITING));
        assert!(!tracker.should_notify("a1", NOTIFY_SETUP_WAITING));
        // Different agent or type has its own cooldown.
        assert!(tracker.should_notify("a2", NOTIFY_SETUP_WAITING));
        assert!(tracker.should_notify("a1", "other"));
    }

    #[test]
    fn add_replaces_by_key() {
        let tracker = NotificationTracker::new();
        tracker.add(notification("u1", "a1", "first"));
        tracker.add(notification("u1", "a1", "second"));
        let list = tracker.list("u1");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].message, "second");
    }

    #[test]
    fn dismiss_clears_item_and_cooldown() {
        let tracker = NotificationTracker::new();
        assert!(tracker.should_notify("a1", NOTIFY_SETUP_WAITING));
        tracker.add(notification("u1", "a1", "waiting"));

        tracker.dismiss("u1", "a1", NOTIFY_SETUP_WAITING);
        assert!(tracker.list("u1").is_empty());
        // Cooldown disarmed: the next condition fires immediately.
        assert!(tracker.should_notify("a1", NOTIFY_SETUP_WAITING));
    }

    #[test]
    fn clear_by_agent_spans_users() {
        let tracker = NotificationTracker::new();
        tracker.add(notification("u1", "a1", "waiting"));
        tracker.add(notification("u2", "a1", "waiting"));
        tracker.clear_by_agent("a1", NOTIFY_SETUP_WAITING);
        assert!(tracker.list("u1").is_empty());
        assert!(tracker.list("u2").is_empty());
    }
}
