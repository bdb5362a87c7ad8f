use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EventTask, StoreError};

/// A task that exhausted its retries, keyed by the id of the original task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub task: EventTask,
    /// Short classification, e.g. `"runtime"` or `"timeout"`.
    pub error_kind: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(task: EventTask, error_kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: task.origin_id(),
            task,
            error_kind: error_kind.into(),
            error: error.into(),
            failed_at: Utc::now(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.task.subscription.tenant_id
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert, or overwrite the entry with the same id.
    async fn upsert(&self, dead_letter: DeadLetter) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError>;
    /// Oldest first; all tenants when `tenant_id` is `None`.
    async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<DeadLetter>, StoreError>;
    async fn remove(&self, id: Uuid) -> Result<bool, StoreError>;
}
