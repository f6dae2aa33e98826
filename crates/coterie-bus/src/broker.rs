use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::bus::SubscriptionId;

/// A system-wide event with no addressed recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Event type tag, e.g. `"workflow_completed"`.
    pub event_type: String,
    /// Opaque event payload.
    pub data: serde_json::Value,
    /// UTC timestamp of emission.
    pub timestamp: DateTime<Utc>,
}

type EventHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Synchronous fan-out of system-wide events.
///
/// Unlike the message bus, events have no recipient and are delivered
/// immediately on the emitter's thread. Handler panics are caught and
/// logged; one bad subscriber never affects the others. The most recent
/// events are kept in a bounded ring.
pub struct EventBroker {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
    history: Mutex<VecDeque<SystemEvent>>,
    capacity: usize,
}

impl EventBroker {
    /// Default ring capacity.
    pub const DEFAULT_CAPACITY: usize = 1_000;

    /// Create a broker with the default history capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a broker retaining at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Subscribe to one event type.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&SystemEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .entry(event_type.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        if let Some(subs) = handlers.get_mut(event_type) {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            return subs.len() < before;
        }
        false
    }

    /// Emit an event, invoking every current subscriber of its type before
    /// returning. The emitted event is returned for correlation.
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) -> SystemEvent {
        let event = SystemEvent {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        };

        {
            let mut history = self.history.lock();
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscribers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.event_type)
            .map(|subs| subs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in subscribers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event_type = %event.event_type, event_id = %event.id, "event handler panicked");
            }
        }

        event
    }

    /// Retained events, oldest first, optionally filtered by type, capped
    /// to the most recent `limit`.
    pub fn history(&self, event_type: Option<&str>, limit: usize) -> Vec<SystemEvent> {
        let history = self.history.lock();
        let matched: Vec<&SystemEvent> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .collect();
        let skip = matched.len().saturating_sub(limit);
        matched.into_iter().skip(skip).cloned().collect()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let broker = EventBroker::new();
        let count_a = Arc::new(Mutex::new(0));
        let count_b = Arc::new(Mutex::new(0));

        let a = Arc::clone(&count_a);
        broker.subscribe("task_completed", move |_| *a.lock() += 1);
        let b = Arc::clone(&count_b);
        broker.subscribe("task_completed", move |_| *b.lock() += 1);

        broker.emit("task_completed", json!({"task": "t1"}));
        broker.emit("task_completed", json!({"task": "t2"}));

        assert_eq!(*count_a.lock(), 2);
        assert_eq!(*count_b.lock(), 2);
    }

    #[test]
    fn test_subscribers_only_see_their_type() {
        let broker = EventBroker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        broker.subscribe("workflow_failed", move |e| {
            s.lock().push(e.data.clone());
        });

        broker.emit("workflow_completed", json!({"id": 1}));
        broker.emit("workflow_failed", json!({"id": 2}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["id"], json!(2));
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let broker = EventBroker::new();
        let count = Arc::new(Mutex::new(0));

        broker.subscribe("boom", |_| panic!("bad handler"));
        let c = Arc::clone(&count);
        broker.subscribe("boom", move |_| *c.lock() += 1);

        broker.emit("boom", json!({}));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let broker = EventBroker::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let sub = broker.subscribe("tick", move |_| *c.lock() += 1);

        broker.emit("tick", json!({}));
        assert!(broker.unsubscribe("tick", sub));
        broker.emit("tick", json!({}));

        assert_eq!(*count.lock(), 1);
        assert!(!broker.unsubscribe("tick", sub));
    }

    #[test]
    fn test_ring_history_and_filter() {
        let broker = EventBroker::with_capacity(3);
        broker.emit("a", json!({"n": 1}));
        broker.emit("b", json!({"n": 2}));
        broker.emit("a", json!({"n": 3}));
        broker.emit("a", json!({"n": 4}));

        // Oldest ("a" n=1) evicted by capacity.
        let all = broker.history(None, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data["n"], json!(2));

        let only_a = broker.history(Some("a"), 10);
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[0].data["n"], json!(3));
        assert_eq!(only_a[1].data["n"], json!(4));

        let limited = broker.history(Some("a"), 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].data["n"], json!(4));
    }

    #[test]
    fn test_emit_returns_event() {
        let broker = EventBroker::new();
        let event = broker.emit("workflow_started", json!({"workflow_id": "w1"}));
        assert_eq!(event.event_type, "workflow_started");
        assert_eq!(event.data["workflow_id"], json!("w1"));
    }
}
