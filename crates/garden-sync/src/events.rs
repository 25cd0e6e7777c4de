//! Local event bus, and the task that pushes locally originated events to
//! the broker.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use garden_core::GardenEvent;

use crate::codec::{encode_event, event_headers};
use crate::supervisor::Lifecycle;
use crate::transport::MessageSink;

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of [`GardenEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GardenEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publishes `event`. Returns how many subscribers will see it.
    pub fn publish(&self, event: GardenEvent) -> usize {
        debug!(event = %event, "Publishing event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GardenEvent> {
        self.tx.subscribe()
    }
}

/// Sends every event that originated on `garden_name` to the sink's default
/// destination, until `lifecycle` stops or the bus closes.
///
/// Events received from other gardens are not re-published.
pub async fn forward_to_broker(
    mut events: broadcast::Receiver<GardenEvent>,
    sink: Arc<dyn MessageSink>,
    garden_name: String,
    lifecycle: Lifecycle,
) {
    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event forwarder fell behind, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = lifecycle.stopped() => break,
        };

        if event.garden != garden_name {
            continue;
        }

        let Some(destination) = sink.default_destination() else {
            debug!(event = %event, "No send destination configured, event not forwarded");
            continue;
        };

        match encode_event(&event) {
            Ok(body) => sink.send(body, event_headers(&garden_name), &destination).await,
            Err(e) => warn!(event = %event, error = %e, "Unable to encode event"),
        }
    }

    debug!("Event forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use crate::transport::HEADER_MODEL_CLASS;
    use garden_core::{User, MODEL_CLASS_EVENT};

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(GardenEvent::user_updated("parent", User::new("ada").to_synced())), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let event = GardenEvent::user_updated("parent", User::new("ada").to_synced());

        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_forwards_only_local_events() {
        let bus = EventBus::default();
        let sink = RecordingSink::new(Some("parent.events"));
        let lifecycle = Lifecycle::new();

        let forwarder = tokio::spawn(forward_to_broker(
            bus.subscribe(),
            sink.clone(),
            "parent".to_string(),
            lifecycle.clone(),
        ));

        bus.publish(GardenEvent::user_updated("child", User::new("bob").to_synced()));
        bus.publish(GardenEvent::user_updated("parent", User::new("ada").to_synced()));
        drop(bus);
        forwarder.await.unwrap();

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "parent.events");
        assert_eq!(sent[0].headers.get(HEADER_MODEL_CLASS).unwrap(), MODEL_CLASS_EVENT);
        assert!(sent[0].body.contains("\"ada\""));
    }
}
