//! Pub/sub channel fan-out (§4.6).
//!
//! Shaped like `r2e_core::ws::WsRooms` (a `DashMap<String, _>` keyed by
//! room name, fanning out to every member) but keyed by channel string
//! against a set of per-connection subscribers instead of a broadcast
//! sender, and delivering to transport sinks instead of a `broadcast`
//! channel — `publish` is best-effort per connection rather than an
//! awaited broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::ConnectionId;
use crate::wire::{ConnectionSink, Frame, FrameKind};

pub type Filter = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

struct Subscriber {
    sink: Arc<dyn ConnectionSink>,
    filter: Option<Filter>,
}

/// Maps channel keys to connected subscribers (§4.6). The `Basic`
/// manager — the only one the core contract requires — does exact-match
/// channel keys only; wildcard matching is left to other implementations,
/// per spec.md's explicit carve-out.
#[derive(Default)]
pub struct SubscriptionManager {
    channels: DashMap<String, HashMap<ConnectionId, Subscriber>>,
    dropped: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        SubscriptionManager::default()
    }

    pub fn subscribe(&self, connection: ConnectionId, channel: impl Into<String>, sink: Arc<dyn ConnectionSink>, filter: Option<Filter>) {
        self.channels
            .entry(channel.into())
            .or_default()
            .insert(connection, Subscriber { sink, filter });
    }

    pub fn unsubscribe(&self, connection: ConnectionId, channel: &str) {
        if let Some(mut subs) = self.channels.get_mut(channel) {
            subs.remove(&connection);
        }
    }

    /// Remove every subscription held by `connection`, across all
    /// channels. Called from `OnDisconnection` before any further publish
    /// can observe the closed connection (the atomicity invariant of
    /// §4.6).
    pub fn remove_connection(&self, connection: ConnectionId) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().remove(&connection);
        }
    }

    /// Deliver `payload` to every current subscriber of `channel`,
    /// evaluating each subscriber's filter if present. A subscriber whose
    /// sink reports a full send buffer has the payload dropped for it —
    /// the subscription itself is not torn down.
    pub fn publish(&self, channel: &str, payload: &serde_json::Value) {
        let Some(subs) = self.channels.get(channel) else { return };
        let encoded = bytes::Bytes::from(payload.to_string().into_bytes());
        for subscriber in subs.values() {
            if let Some(filter) = &subscriber.filter {
                if !filter(payload) {
                    continue;
                }
            }
            let frame = Frame::new(FrameKind::SubscriptionEvent, encoded.clone());
            if subscriber.sink.try_send(frame).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::SendError;
    use std::sync::Mutex;

    struct RecordingSink {
        received: Mutex<Vec<bytes::Bytes>>,
        fail: bool,
    }

    impl ConnectionSink for RecordingSink {
        fn try_send(&self, frame: Frame) -> Result<(), SendError> {
            if self.fail {
                return Err(SendError("buffer full".into()));
            }
            self.received.lock().unwrap().push(frame.payload);
            Ok(())
        }
    }

    #[test]
    fn publish_delivers_to_all_subscribers_of_a_channel() {
        let mgr = SubscriptionManager::new();
        let sinks: Vec<_> = (0..3)
            .map(|_| Arc::new(RecordingSink { received: Mutex::new(Vec::new()), fail: false }))
            .collect();
        for (i, sink) in sinks.iter().enumerate() {
            mgr.subscribe(ConnectionId::new(), "orders", sink.clone(), None);
            let _ = i;
        }
        mgr.publish("orders", &serde_json::json!({"id": 1}));
        for sink in &sinks {
            assert_eq!(sink.received.lock().unwrap().len(), 1);
        }
    }

    #[test]
    fn disconnect_stops_further_delivery() {
        let mgr = SubscriptionManager::new();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let sink1 = Arc::new(RecordingSink { received: Mutex::new(Vec::new()), fail: false });
        let sink2 = Arc::new(RecordingSink { received: Mutex::new(Vec::new()), fail: false });
        mgr.subscribe(c1, "orders", sink1.clone(), None);
        mgr.subscribe(c2, "orders", sink2.clone(), None);
        mgr.remove_connection(c1);
        mgr.publish("orders", &serde_json::json!({"id": 1}));
        assert_eq!(sink1.received.lock().unwrap().len(), 0);
        assert_eq!(sink2.received.lock().unwrap().len(), 1);
    }

    #[test]
    fn full_send_buffer_drops_payload_without_unsubscribing() {
        let mgr = SubscriptionManager::new();
        let c = ConnectionId::new();
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()), fail: true });
        mgr.subscribe(c, "orders", sink.clone(), None);
        mgr.publish("orders", &serde_json::json!({"id": 1}));
        assert_eq!(mgr.dropped_count(), 1);
        assert_eq!(mgr.subscriber_count("orders"), 1);
    }

    #[test]
    fn filter_excludes_non_matching_payloads() {
        let mgr = SubscriptionManager::new();
        let c = ConnectionId::new();
        let sink = Arc::new(RecordingSink { received: Mutex::new(Vec::new()), fail: false });
        let filter: Filter = Arc::new(|v| v.get("id").and_then(|v| v.as_i64()) == Some(2));
        mgr.subscribe(c, "orders", sink.clone(), Some(filter));
        mgr.publish("orders", &serde_json::json!({"id": 1}));
        mgr.publish("orders", &serde_json::json!({"id": 2}));
        assert_eq!(sink.received.lock().unwrap().len(), 1);
    }
}
