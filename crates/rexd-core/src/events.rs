//! Notification bus
//!
//! Per-session fan-out of server→client notifications. Each subscriber owns
//! a bounded queue; publish is non-blocking and drops the notification for
//! any subscriber whose queue is full, so a slow transport can never stall a
//! stream pump.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::JSONRPC_VERSION;

/// Queue depth per subscriber before drop-on-full kicks in.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 128;

/// One-way server→client message scoped to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Default)]
struct BusInner {
    next_sub_id: u64,
    subscribers: HashMap<String, HashMap<u64, mpsc::Sender<Notification>>>,
}

/// Session-keyed notification fan-out.
///
/// Cloning the bus shares the subscriber table; component tasks hold cheap
/// clones rather than references into an owner.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<BusInner>>,
}

/// Removes and closes the subscriber queue when dropped.
#[derive(Debug)]
pub struct SubscriptionGuard {
    inner: Arc<RwLock<BusInner>>,
    session_id: String,
    sub_id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.write().expect("event bus poisoned");
        if let Some(session_subs) = inner.subscribers.get_mut(&self.session_id) {
            session_subs.remove(&self.sub_id);
            if session_subs.is_empty() {
                inner.subscribers.remove(&self.session_id);
            }
        }
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a bounded queue for one session. Dropping the guard unsubscribes
    /// and closes the queue; the receiver then drains and ends.
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> (mpsc::Receiver<Notification>, SubscriptionGuard) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut inner = self.inner.write().expect("event bus poisoned");
        inner.next_sub_id += 1;
        let sub_id = inner.next_sub_id;
        inner
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(sub_id, tx);
        let guard = SubscriptionGuard {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            sub_id,
        };
        (rx, guard)
    }

    /// Non-blocking publish to every subscriber of `session_id`. A full
    /// queue drops the notification for that subscriber only.
    pub fn publish(&self, session_id: &str, method: &str, params: Value) {
        let notification = Notification::new(method, params);
        let inner = self.inner.read().expect("event bus poisoned");
        let Some(session_subs) = inner.subscribers.get(session_id) else {
            return;
        };
        for tx in session_subs.values() {
            if tx.try_send(notification.clone()).is_err() {
                trace!(session_id, method, "subscriber queue full, dropping");
            }
        }
    }

    /// Number of subscribers currently attached to a session.
    #[must_use]
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .expect("event bus poisoned")
            .subscribers
            .get(session_id)
            .map_or(0, |session_subs| session_subs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let (mut rx, _guard) = bus.subscribe("s_1");
        bus.publish("s_1", "exec.stdout", json!({"seq": 1}));
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.jsonrpc, "2.0");
        assert_eq!(evt.method, "exec.stdout");
        assert_eq!(evt.params["seq"], 1);
    }

    #[tokio::test]
    async fn test_publish_is_scoped_to_session() {
        let bus = EventBus::new();
        let (mut rx, _guard) = bus.subscribe("s_1");
        bus.publish("s_other", "exec.exit", json!({}));
        bus.publish("s_1", "exec.exit", json!({}));
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.method, "exec.exit");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_on_full_queue() {
        let bus = EventBus::new();
        let (mut rx, _guard) = bus.subscribe("s_1");
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish("s_1", "exec.stdout", json!({"seq": i}));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_queue() {
        let bus = EventBus::new();
        let (mut rx, guard) = bus.subscribe("s_1");
        assert_eq!(bus.subscriber_count("s_1"), 1);
        drop(guard);
        assert_eq!(bus.subscriber_count("s_1"), 0);
        assert!(rx.recv().await.is_none());
        // publishing after unsubscribe is a no-op
        bus.publish("s_1", "exec.exit", json!({}));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_fan_out() {
        let bus = EventBus::new();
        let (mut rx_a, _guard_a) = bus.subscribe("s_1");
        let (mut rx_b, _guard_b) = bus.subscribe("s_1");
        bus.publish("s_1", "pty.output", json!({"data": "x"}));
        assert_eq!(rx_a.recv().await.unwrap().method, "pty.output");
        assert_eq!(rx_b.recv().await.unwrap().method, "pty.output");
    }
}
