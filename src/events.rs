//! Per-application fan-out of pipeline messages, backend events and
//! container output to live SSE subscribers.
//!
//! One bounded queue per application. Publishing never blocks: when the
//! queue is full, or nobody is subscribed, the message is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::runtime::RuntimeEvent;

/// Messages buffered per subscriber before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    BuildLog,
    ContainerLog,
    Success,
    Error,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::BuildLog => "build_log",
            Self::ContainerLog => "container_log",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamMessage {
    Connected(String),
    Log {
        kind: LogKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Backend(RuntimeEvent),
}

impl StreamMessage {
    pub fn log(kind: LogKind, message: impl Into<String>) -> Self {
        Self::Log {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Connected(message) => json!({
                "type": "connected",
                "message": sanitize(message),
            }),
            Self::Log {
                kind,
                message,
                timestamp,
            } => json!({
                "type": kind.as_str(),
                "message": sanitize(message),
                "timestamp": timestamp.to_rfc3339(),
            }),
            Self::Backend(event) => json!({
                "type": "docker_event",
                "event": event.event_type,
                "message": sanitize(&event.message),
                "data": {
                    "container_id": event.container_id,
                    "runtime": event.runtime,
                    "metadata": event.metadata,
                },
                "time": event.timestamp.timestamp(),
            }),
        }
    }
}

/// Escape `\n \r \t \b \f "` and strip every other control character.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '"' => out.push_str("\\\""),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

struct Slot {
    generation: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
pub struct LogHub {
    queues: RwLock<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl LogHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the queue for `app_id`, replacing any previous subscriber.
    pub fn subscribe(self: &Arc<Self>, app_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues
            .insert(app_id.to_string(), Slot { generation, tx })
            .is_some()
        {
            debug!(app_id, "Replaced previous log subscriber");
        }
        Subscription {
            rx,
            guard: SubscriptionGuard {
                hub: Arc::clone(self),
                app_id: app_id.to_string(),
                generation,
            },
        }
    }

    /// Enqueue without blocking; false when dropped.
    pub fn publish(&self, app_id: &str, message: &StreamMessage) -> bool {
        let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = queues.get(app_id) else {
            return false;
        };
        slot.tx.try_send(message.to_json().to_string()).is_ok()
    }

    pub fn log(&self, app_id: &str, kind: LogKind, message: impl Into<String>) -> bool {
        self.publish(app_id, &StreamMessage::log(kind, message))
    }

    pub fn has_subscriber(&self, app_id: &str) -> bool {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(app_id)
    }

    fn remove(&self, app_id: &str, generation: u64) {
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        if queues.get(app_id).map(|s| s.generation) == Some(generation) {
            queues.remove(app_id);
            debug!(app_id, "Log subscriber disconnected");
        }
    }
}

/// Removes the queue when the subscriber goes away, unless a newer
/// subscriber has replaced it.
struct SubscriptionGuard {
    hub: Arc<LogHub>,
    app_id: String,
    generation: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.remove(&self.app_id, self.generation);
    }
}

pub struct Subscription {
    rx: mpsc::Receiver<String>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn app_id(&self) -> &str {
        &self.guard.app_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeType;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a\nb\tc\"d"), "a\\nb\\tc\\\"d");
        assert_eq!(sanitize("bell\u{7}esc\u{1b}[0m"), "bellesc[0m");
        assert_eq!(sanitize("\r\u{8}\u{c}"), "\\r\\b\\f");
        assert_eq!(sanitize("plain ünïcode"), "plain ünïcode");
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let hub = LogHub::new();
        assert!(!hub.log("app_1", LogKind::Info, "nobody listening"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let hub = LogHub::new();
        let mut sub = hub.subscribe("app_1");
        for i in 0..QUEUE_CAPACITY {
            assert!(hub.log("app_1", LogKind::Info, format!("m{}", i)));
        }
        assert!(!hub.log("app_1", LogKind::Info, "overflow"));

        let first: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(first["message"], "m0");
        assert_eq!(first["type"], "info");
    }

    #[tokio::test]
    async fn test_drop_tears_down_queue() {
        let hub = LogHub::new();
        let sub = hub.subscribe("app_1");
        assert!(hub.has_subscriber("app_1"));
        assert_eq!(sub.app_id(), "app_1");
        drop(sub);
        assert!(!hub.has_subscriber("app_1"));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_and_old_drop_keeps_new() {
        let hub = LogHub::new();
        let old = hub.subscribe("app_1");
        let mut new = hub.subscribe("app_1");
        drop(old);
        assert!(hub.has_subscriber("app_1"));
        assert!(hub.log("app_1", LogKind::Success, "done"));
        let msg: Value = serde_json::from_str(&new.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "success");
    }

    #[test]
    fn test_publish_from_plain_threads() {
        let hub = LogHub::new();
        let mut sub = hub.subscribe("app_1");
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || hub.log("app_1", LogKind::Info, format!("t{}", i)))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        let mut received = 0;
        while sub.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[test]
    fn test_backend_event_shape() {
        let ev = RuntimeEvent::new(RuntimeType::Docker, "container_started", "c1", "up\n")
            .with_meta("image", "diplo-1-abc");
        let json = StreamMessage::Backend(ev).to_json();
        assert_eq!(json["type"], "docker_event");
        assert_eq!(json["event"], "container_started");
        assert_eq!(json["message"], "up\\n");
        assert_eq!(json["data"]["container_id"], "c1");
        assert_eq!(json["data"]["runtime"], "docker");
        assert!(json["time"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_connected_shape() {
        let json = StreamMessage::Connected("Connected to app_1".into()).to_json();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["message"], "Connected to app_1");
    }
}
