use std::sync::Arc;

use super::pipeline::EventHandler;
use super::{DomainEvent, EventTask, StoreError, Subscription, SubscriptionStore};

/// Turns an event into the tasks of the subscriptions that accept it.
pub(crate) struct Router {
    subscriptions: Arc<dyn SubscriptionStore>,
    handler: Arc<dyn EventHandler>,
}

/// Result of routing one event.
pub(crate) struct Routed {
    pub tasks: Vec<EventTask>,
    /// Matching subscriptions whose filter rejected the event or failed.
    pub filtered_out: usize,
}

impl Router {
    pub(crate) fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            subscriptions,
            handler,
        }
    }

    pub(crate) async fn route(&self, event: &DomainEvent) -> Result<Routed, StoreError> {
        let candidates = self
            .subscriptions
            .find_active(&event.tenant_id, &event.event_type)
            .await?;

        let mut routed = Routed {
            tasks: Vec::with_capacity(candidates.len()),
            filtered_out: 0,
        };
        for subscription in candidates {
            if self.accepts(&subscription, event).await {
                routed.tasks.push(EventTask::new(subscription, event.clone()));
            } else {
                routed.filtered_out += 1;
            }
        }

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            matched = routed.tasks.len(),
            filtered_out = routed.filtered_out,
            "event routed"
        );
        Ok(routed)
    }

    async fn accepts(&self, subscription: &Subscription, event: &DomainEvent) -> bool {
        let Some(filter) = subscription.filter_expression() else {
            return true;
        };
        match self.handler.matches(subscription, filter, event).await {
            Ok(matched) => matched,
            Err(failure) => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    event_id = %event.id,
                    error = %failure,
                    "filter evaluation failed, treating as no match"
                );
                false
            }
        }
    }
}
