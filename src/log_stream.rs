//! Per-project log stream
//!
//! Every significant simulator transition becomes a [`LogEntry`] published
//! through the project's [`LogHub`]: a bounded newest-first ring buffer plus
//! fan-out to connected subscribers. Delivery is non-blocking for the
//! simulator; a subscriber whose queue is full or closed is dropped on the
//! spot. A fresh subscriber first gets a replay of the most recent buffered
//! entries in chronological order, then the live stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::config::LogStreamConfig;

/// Log event kinds emitted by simulators (plus the subscriber ack frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Stopped,
    Connected,
    Disconnected,
    MessageSent,
    Error,
    Warning,
    Info,
    ConnectionEstablished,
}

/// One log frame as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub device_name: String,
    pub event_type: EventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Set only on system frames (subscriber ack, not-running notice)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl LogEntry {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        event_type: EventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            event_type,
            message: message.into(),
            payload: None,
            project_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// System frame sent when a subscriber attaches
    pub fn connection_established(project_id: &str) -> Self {
        let mut entry = Self::new(
            "system",
            "System",
            EventType::ConnectionEstablished,
            format!("Connected to logs for project {}", project_id),
        );
        entry.project_id = Some(project_id.to_string());
        entry
    }
}

/// A live subscription: replayed history plus the live receiver
pub struct LogSubscription {
    pub replay: Vec<LogEntry>,
    pub receiver: mpsc::Receiver<LogEntry>,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<LogEntry>,
}

struct HubInner {
    /// Newest first
    ring: VecDeque<LogEntry>,
    subscribers: Vec<Subscriber>,
}

/// Ring buffer plus subscriber fan-out for one project
pub struct LogHub {
    capacity: usize,
    replay_count: usize,
    queue_depth: usize,
    next_id: AtomicU64,
    inner: Mutex<HubInner>,
}

impl LogHub {
    pub fn new(config: &LogStreamConfig) -> Self {
        Self {
            capacity: config.buffer_capacity.max(1),
            replay_count: config.replay_count,
            queue_depth: config.subscriber_queue.max(1),
            next_id: AtomicU64::new(0),
            inner: Mutex::new(HubInner {
                ring: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Append to the ring buffer and fan out to every live subscriber.
    /// Subscribers whose delivery fails are removed; the caller never blocks.
    pub fn publish(&self, entry: LogEntry) {
        let senders: Vec<(u64, mpsc::Sender<LogEntry>)> = {
            let mut inner = self.inner.lock().unwrap();
            inner.ring.push_front(entry.clone());
            while inner.ring.len() > self.capacity {
                inner.ring.pop_back();
            }
            inner
                .subscribers
                .iter()
                .map(|s| (s.id, s.sender.clone()))
                .collect()
        };

        // Deliver outside the lock so one slow subscriber cannot stall the hub
        let mut dead = Vec::new();
        for (id, sender) in senders {
            if sender.try_send(entry.clone()).is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Attach a subscriber: returns the replay slice (chronological, oldest
    /// of the replayed first) and the live receiver
    pub fn subscribe(&self) -> LogSubscription {
        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock().unwrap();
        let mut replay: Vec<LogEntry> = inner.ring.iter().take(self.replay_count).cloned().collect();
        replay.reverse();
        inner.subscribers.push(Subscriber { id, sender });

        LogSubscription { replay, receiver }
    }

    /// Snapshot of the buffer, newest first
    pub fn buffered(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().ring.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hub(capacity: usize, replay: usize, queue: usize) -> LogHub {
        LogHub::new(&LogStreamConfig {
            buffer_capacity: capacity,
            replay_count: replay,
            subscriber_queue: queue,
        })
    }

    fn entry(n: usize) -> LogEntry {
        LogEntry::new("d1", "sensor", EventType::Info, format!("event-{}", n))
    }

    #[test]
    fn test_ring_buffer_never_exceeds_capacity() {
        let hub = hub(100, 20, 16);
        for n in 0..150 {
            hub.publish(entry(n));
        }
        let buffered = hub.buffered();
        assert_eq!(buffered.len(), 100);
        // Newest first; oldest 50 evicted
        assert_eq!(buffered[0].message, "event-149");
        assert_eq!(buffered[99].message, "event-50");
    }

    #[test]
    fn test_replay_is_chronological_and_bounded() {
        let hub = hub(100, 20, 16);
        for n in 0..50 {
            hub.publish(entry(n));
        }

        let subscription = hub.subscribe();
        assert_eq!(subscription.replay.len(), 20);
        assert_eq!(subscription.replay[0].message, "event-30");
        assert_eq!(subscription.replay[19].message, "event-49");
    }

    #[test]
    fn test_replay_smaller_than_buffer() {
        let hub = hub(100, 20, 16);
        for n in 0..5 {
            hub.publish(entry(n));
        }
        let subscription = hub.subscribe();
        assert_eq!(subscription.replay.len(), 5);
        assert_eq!(subscription.replay[0].message, "event-0");
    }

    #[tokio::test]
    async fn test_live_stream_preserves_order() {
        let hub = hub(100, 20, 16);
        let mut subscription = hub.subscribe();

        for n in 0..5 {
            hub.publish(entry(n));
        }

        for n in 0..5 {
            let received = subscription.receiver.recv().await.unwrap();
            assert_eq!(received.message, format!("event-{}", n));
        }
    }

    #[tokio::test]
    async fn test_dead_subscriber_removed_on_fanout() {
        let hub = hub(100, 20, 16);
        let subscription = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(subscription);
        hub.publish(entry(0));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_removed_when_queue_full() {
        let hub = hub(100, 20, 2);
        let _subscription = hub.subscribe();

        // Queue depth 2: the third publish fails delivery and removes the
        // subscriber instead of blocking the publisher
        hub.publish(entry(0));
        hub.publish(entry(1));
        hub.publish(entry(2));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_connection_established_frame_shape() {
        let frame = LogEntry::connection_established("p1");
        assert_eq!(frame.device_id, "system");
        assert_eq!(frame.device_name, "System");
        assert_eq!(frame.event_type, EventType::ConnectionEstablished);
        assert_eq!(frame.project_id.as_deref(), Some("p1"));

        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event_type"], "connection_established");
    }

    proptest! {
        #[test]
        fn prop_buffer_keeps_most_recent(total in 1usize..400, capacity in 1usize..150) {
            let hub = hub(capacity, capacity.min(20), 16);
            for n in 0..total {
                hub.publish(entry(n));
            }
            let buffered = hub.buffered();
            prop_assert_eq!(buffered.len(), total.min(capacity));
            // Head of the ring is always the latest entry
            prop_assert_eq!(buffered[0].message.clone(), format!("event-{}", total - 1));
        }
    }
}
