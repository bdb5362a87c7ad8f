use async_trait::async_trait;

use super::CapabilityError;
use crate::events::DomainEvent;

/// Backend for `api.events.publish`. Events arrive already stamped with the caller's tenant.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<(), CapabilityError>;
}
