//! Event-driven script delivery: routing, a bounded worker queue, retries and dead letters.

mod bus;
mod dead_letter;
mod memory;
mod pipeline;
mod router;
mod subscription;
mod task;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::EventBus;
pub use dead_letter::{DeadLetter, DeadLetterStore};
pub use memory::{MemoryDeadLetterStore, MemoryScriptStore, MemorySubscriptionStore};
pub use pipeline::{
    DeliveryFailure, EventHandler, EventPipeline, PipelineError, PipelineStats, PipelineStores,
};
pub use subscription::{ScriptStore, Subscription, SubscriptionStore};
pub use task::{EventTask, TaskState};

/// Something that happened in a tenant's domain, e.g. `"order.created"`.
///
/// Scripts see it as the `event` global with camelCase keys and the event
/// type under `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            tenant_id: tenant_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Failure of a persistence collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}
