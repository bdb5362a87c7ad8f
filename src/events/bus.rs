//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! The pipeline subscribes to it once through
//! [`EventPipeline::attach`](super::EventPipeline::attach); scripts publish
//! to it through `api.events.publish` when it is configured as the
//! [`EventPublisher`] capability.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::DomainEvent;
use crate::bridge::{CapabilityError, EventPublisher};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out hub for [`DomainEvent`]s.
///
/// When the buffer is full the oldest unconsumed events are dropped and slow
/// receivers observe `RecvError::Lagged`.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber and return how many received it.
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: DomainEvent) -> usize {
        tracing::trace!(event_id = %event.id, event_type = %event.event_type, "event published");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: DomainEvent) -> Result<(), CapabilityError> {
        EventBus::publish(self, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_subscriber_receives_the_event() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish(DomainEvent::new("acme", "order.created", json!({"id": 1})));
        assert_eq!(delivered, 2);

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.payload["id"], 1);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(DomainEvent::new("acme", "noop", json!(null))), 0);
    }
}
