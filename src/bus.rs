//! In-process topic-per-call pub/sub for SSE subscribers
//!
//! Built on bounded broadcast channels: delivery is best-effort and in
//! publish order per subscriber; a slow subscriber loses its oldest pending
//! messages rather than blocking the publisher.

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::Envelope;

/// Per-subscriber channel capacity; overflow drops oldest
pub const SUBSCRIBER_CAPACITY: usize = 64;

pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Register a subscriber for one call's envelope stream
    pub fn subscribe(&self, call_id: &str) -> broadcast::Receiver<String> {
        self.topics
            .entry(call_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe()
    }

    /// Publish an envelope to every subscriber of the call. Never blocks.
    pub fn publish(&self, call_id: &str, envelope: &Envelope) {
        let Some(sender) = self.topics.get(call_id).map(|entry| entry.clone()) else {
            return;
        };
        if sender.send(envelope.to_json()).is_err() {
            // Last receiver is gone; release the topic.
            drop(sender);
            self.topics
                .remove_if(call_id, |_, sender| sender.receiver_count() == 0);
            debug!(call_id = %call_id, "event topic released");
        }
    }

    pub fn subscriber_count(&self, call_id: &str) -> usize {
        self.topics
            .get(call_id)
            .map(|entry| entry.receiver_count())
            .unwrap_or(0)
    }

    /// Final envelope to every open stream, used on process shutdown
    pub fn shutdown(&self) {
        for entry in self.topics.iter() {
            let envelope = Envelope::Status {
                call_id: entry.key().clone(),
                status: "shutdown".to_string(),
                timestamp: Utc::now(),
            };
            let _ = entry.value().send(envelope.to_json());
        }
        self.topics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Envelope {
        Envelope::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_publish_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe("RT-2");
        let mut second = bus.subscribe("RT-2");

        for call_id in ["a", "b", "c"] {
            bus.publish(
                "RT-2",
                &Envelope::Status {
                    call_id: call_id.to_string(),
                    status: "active".to_string(),
                    timestamp: Utc::now(),
                },
            );
        }

        for receiver in [&mut first, &mut second] {
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(receiver.recv().await.unwrap());
            }
            assert!(seen[0].contains("\"call_id\":\"a\""));
            assert!(seen[1].contains("\"call_id\":\"b\""));
            assert!(seen[2].contains("\"call_id\":\"c\""));
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("RT-none", &heartbeat());
        assert_eq!(bus.subscriber_count("RT-none"), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe("RT-full");

        for index in 0..(SUBSCRIBER_CAPACITY + 8) {
            bus.publish(
                "RT-full",
                &Envelope::Status {
                    call_id: format!("{index}"),
                    status: "active".to_string(),
                    timestamp: Utc::now(),
                },
            );
        }

        // The first reads report the lag, then deliver the retained tail in order.
        let mut delivered = Vec::new();
        loop {
            match receiver.try_recv() {
                Ok(payload) => delivered.push(payload),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(delivered.len(), SUBSCRIBER_CAPACITY);
        assert!(delivered
            .last()
            .unwrap()
            .contains(&format!("\"call_id\":\"{}\"", SUBSCRIBER_CAPACITY + 7)));
    }

    #[tokio::test]
    async fn test_topic_released_after_last_subscriber() {
        let bus = EventBus::new();
        let receiver = bus.subscribe("RT-gone");
        drop(receiver);
        bus.publish("RT-gone", &heartbeat());
        assert_eq!(bus.subscriber_count("RT-gone"), 0);
    }
}
