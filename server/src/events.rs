//! Event bus (C11).
//!
//! In-process typed publish/subscribe for lifecycle, bell, activity, and
//! tunnel-state events. Publishers never block on subscribers: each
//! subscriber owns a bounded queue and, on overflow, the oldest *non-exit*
//! event is dropped while a per-subscriber dropped-count counter advances.
//! `session.exit` is never dropped (see [`Subscriber::push`]).
//!
//! Feeds the SSE broadcaster (C9) directly; a push-notification collaborator
//! (out of scope here) would subscribe the same way.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify, RwLock};

/// Bound on a subscriber's pending-event queue before drop-oldest kicks in.
const SUBSCRIBER_QUEUE_CAP: usize = 256;

/// Tagged event kinds, matching the wire `type` field exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionExit,
    SessionRename,
    SessionBell,
    SessionActivity,
    ServerUp,
    ServerDown,
    TunnelStarted,
    TunnelStopped,
    TestNotification,
}

impl EventKind {
    fn wire_type(self) -> &'static str {
        match self {
            EventKind::SessionStart => "session.start",
            EventKind::SessionExit => "session.exit",
            EventKind::SessionRename => "session.rename",
            EventKind::SessionBell => "session.bell",
            EventKind::SessionActivity => "session.activity",
            EventKind::ServerUp => "server.up",
            EventKind::ServerDown => "server.down",
            EventKind::TunnelStarted => "tunnel.started",
            EventKind::TunnelStopped => "tunnel.stopped",
            EventKind::TestNotification => "test.notification",
        }
    }
}

/// A single bus event: kind, optional session scope, payload, and a
/// monotonic per-broadcaster-instance sequence number.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub timestamp: u64,
    pub seq: u64,
    pub payload: Value,
}

impl Event {
    /// Render as the wire JSON object: `{type, session_id?, timestamp, seq, ...payload}`.
    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "type": self.kind.wire_type(),
            "timestamp": self.timestamp,
            "seq": self.seq,
        });
        if let Some(ref sid) = self.session_id {
            obj["session_id"] = json!(sid);
        }
        if let Value::Object(extra) = &self.payload {
            if let Value::Object(ref mut map) = obj {
                for (k, v) in extra {
                    map.insert(k.clone(), v.clone());
                }
            }
        }
        obj
    }
}

struct Subscriber {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Subscriber {
    fn new() -> Self {
        Subscriber {
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_CAP)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, event: Event) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= SUBSCRIBER_QUEUE_CAP {
            // Never drop the exit frame: evict the oldest non-exit event instead.
            if matches!(event.kind, EventKind::SessionExit) {
                if let Some(pos) = queue.iter().position(|e| !matches!(e.kind, EventKind::SessionExit)) {
                    queue.remove(pos);
                } else {
                    queue.pop_front();
                }
            } else {
                queue.pop_front();
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBusInner>,
    sub: Arc<Subscriber>,
}

impl Subscription {
    /// Await the next event observed in publish order for this subscriber.
    /// Returns `None` only if the bus has no more subscribers path (never in
    /// practice — subscriptions live as long as held).
    pub async fn recv(&self) -> Event {
        loop {
            {
                let mut queue = self.sub.queue.lock().await;
                if let Some(event) = queue.pop_front() {
                    return event;
                }
            }
            self.sub.notify.notified().await;
        }
    }

    /// Number of events dropped for this subscriber due to queue overflow.
    pub fn dropped_count(&self) -> u64 {
        self.sub.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = Arc::clone(&self.bus);
        let id = self.id;
        tokio::spawn(async move {
            bus.subscribers.write().await.remove(&id);
        });
    }
}

struct EventBusInner {
    subscribers: RwLock<std::collections::HashMap<u64, Arc<Subscriber>>>,
    next_sub_id: AtomicU64,
    seq: AtomicU64,
}

/// Typed pub/sub bus, cloneable, cheap to share via [`crate::state::AppState`].
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(EventBusInner {
                subscribers: RwLock::new(std::collections::HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                seq: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to all future events. Past events are never replayed (§4.9).
    pub async fn subscribe(&self) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber::new());
        self.inner.subscribers.write().await.insert(id, Arc::clone(&sub));
        Subscription {
            id,
            bus: Arc::clone(&self.inner),
            sub,
        }
    }

    /// Publish an event. Never blocks on a slow subscriber.
    pub async fn publish(&self, kind: EventKind, session_id: Option<String>, payload: Value) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let event = Event {
            kind,
            session_id,
            timestamp,
            seq,
            payload,
        };
        let subs: Vec<Arc<Subscriber>> = self.inner.subscribers.read().await.values().cloned().collect();
        for sub in subs {
            sub.push(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_publish_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        bus.publish(EventKind::ServerUp, None, json!({})).await;
        bus.publish(EventKind::ServerDown, None, json!({})).await;
        let first = sub.recv().await;
        let second = sub.recv().await;
        assert!(first.seq < second.seq);
        assert_eq!(first.kind, EventKind::ServerUp);
        assert_eq!(second.kind, EventKind::ServerDown);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        for _ in 0..(SUBSCRIBER_QUEUE_CAP + 10) {
            bus.publish(EventKind::TestNotification, None, json!({})).await;
        }
        assert_eq!(sub.dropped_count(), 10);
    }

    #[tokio::test]
    async fn exit_frame_survives_overflow() {
        let bus = EventBus::new();
        let sub = bus.subscribe().await;
        for _ in 0..(SUBSCRIBER_QUEUE_CAP + 5) {
            bus.publish(EventKind::TestNotification, None, json!({})).await;
        }
        bus.publish(EventKind::SessionExit, Some("abc".into()), json!({"exit_code": 0})).await;
        let mut saw_exit = false;
        while let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await {
            if matches!(event.kind, EventKind::SessionExit) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }
}
