//! Real-time event fan-out for dashboards.
//!
//! Notifications are best effort: emitting never fails the caller.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub payload: serde_json::Value,
}

pub trait Notifier: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Publishes to every live subscriber of a broadcast channel.
///
/// Slow subscribers lose the oldest events; having no subscriber is fine.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        let notification = Notification {
            event: event.to_string(),
            payload,
        };
        if let Ok(receivers) = self.tx.send(notification) {
            tracing::debug!(event, receivers, "notification broadcast");
        }
    }
}

/// Writes notifications to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        tracing::info!(event, %payload, "notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();

        notifier.emit("new_plate_saved", json!({ "text": "ABC123" }));

        let received = rx.recv().await.expect("notification");
        assert_eq!(received.event, "new_plate_saved");
        assert_eq!(received.payload["text"], "ABC123");
    }

    #[test]
    fn test_broadcast_without_subscribers_is_fine() {
        let notifier = BroadcastNotifier::default();
        notifier.emit("new_plate_saved", json!({}));
        LogNotifier.emit("new_plate_saved", json!({}));
    }
}
