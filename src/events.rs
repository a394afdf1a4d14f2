use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::server::envelope::Envelope;

/// Buffered frames per subscriber. A subscriber that falls further behind
/// than this loses the oldest frames (drop-oldest, counted).
const BUS_CAPACITY: usize = 4096;

/// Process-wide event bus.
///
/// Services publish server-originated envelopes here; every WebSocket
/// connection subscribes and forwards frames to its client. Publish never
/// blocks — a slow subscriber lags and the overflow is counted.
pub struct EventBus {
    tx: broadcast::Sender<String>,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Broadcast a server-originated event envelope to all connections.
    pub fn publish(&self, event_type: &str, data: Value) {
        let env = Envelope::event(event_type, data);
        let frame = match serde_json::to_string(&env) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(err = %e, "unserializable event dropped");
                return;
            }
        };
        // No subscribers is fine — events are best-effort.
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Record `n` frames dropped for one lagging subscriber.
    pub fn note_lagged(&self, n: u64) {
        let total = self.dropped.fetch_add(n, Ordering::Relaxed) + n;
        tracing::warn!(skipped = n, total, "event bus overflow — slow subscriber skipped events");
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish("agent_exit", serde_json::json!({ "code": 0 }));
        let frame = rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "agent_exit");
        assert_eq!(v["data"]["code"], 0);
        assert!(v.get("id").is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("session_update", serde_json::json!({}));
        assert_eq!(bus.dropped_total(), 0);
    }

    #[test]
    fn lag_accounting_accumulates() {
        let bus = EventBus::new();
        bus.note_lagged(3);
        bus.note_lagged(4);
        assert_eq!(bus.dropped_total(), 7);
    }
}
