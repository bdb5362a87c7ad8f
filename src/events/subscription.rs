use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreError;
use crate::script::Script;

/// Binds a script to an event type for one tenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub script_id: String,
    /// Exact type, `"*"`, or a `"prefix.*"` pattern.
    pub event_type: String,
    /// Guest-language expression evaluated against `event`; `None` or blank matches everything.
    pub filter: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    pub max_retries: u32,
    pub active: bool,
}

impl Subscription {
    pub fn new(
        tenant_id: impl Into<String>,
        script_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            script_id: script_id.into(),
            event_type: event_type.into(),
            filter: None,
            priority: 0,
            max_retries: 3,
            active: true,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// The filter text, if it is non-blank.
    pub fn filter_expression(&self) -> Option<&str> {
        self.filter.as_deref().map(str::trim).filter(|f| !f.is_empty())
    }

    pub fn matches_event_type(&self, event_type: &str) -> bool {
        let pattern = self.event_type.as_str();
        if pattern == "*" || pattern == event_type {
            return true;
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) => event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => false,
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or replace by id.
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
    async fn list(&self, tenant_id: &str) -> Result<Vec<Subscription>, StoreError>;
    /// Active subscriptions of `tenant_id` matching `event_type`, highest priority first.
    async fn find_active(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscription>, StoreError>;
}

#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn get(&self, tenant_id: &str, script_id: &str) -> Result<Option<Script>, StoreError>;
}
