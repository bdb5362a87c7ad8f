//! In-memory reference stores for development and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use super::{DeadLetter, DeadLetterStore, ScriptStore, StoreError, Subscription, SubscriptionStore};
use crate::script::Script;

/// Keeps insertion order so equal priorities resolve first-registered first.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn put(&self, subscription: Subscription) -> Result<(), StoreError> {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        match subscriptions.iter_mut().find(|s| s.id == subscription.id) {
            Some(existing) => *existing = subscription,
            None => subscriptions.push(subscription),
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        Ok(subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut subscriptions = self.subscriptions.write().unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        Ok(subscriptions.len() != before)
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        Ok(subscriptions
            .iter()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn find_active(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<Subscription> = subscriptions
            .iter()
            .filter(|s| s.active && s.tenant_id == tenant_id && s.matches_event_type(event_type))
            .cloned()
            .collect();
        matching.sort_by_key(|s| std::cmp::Reverse(s.priority));
        Ok(matching)
    }
}

#[derive(Debug, Default)]
pub struct MemoryScriptStore {
    scripts: RwLock<HashMap<(String, String), Script>>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: impl Into<String>, script: Script) {
        let mut scripts = self.scripts.write().unwrap_or_else(|e| e.into_inner());
        scripts.insert((tenant_id.into(), script.id.clone()), script);
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn get(&self, tenant_id: &str, script_id: &str) -> Result<Option<Script>, StoreError> {
        let scripts = self.scripts.read().unwrap_or_else(|e| e.into_inner());
        Ok(scripts
            .get(&(tenant_id.to_string(), script_id.to_string()))
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    entries: RwLock<HashMap<Uuid, DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn upsert(&self, dead_letter: DeadLetter) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(dead_letter.id, dead_letter);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(&id).cloned())
    }

    async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<DeadLetter>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut letters: Vec<DeadLetter> = entries
            .values()
            .filter(|d| tenant_id.is_none_or(|t| d.tenant_id() == t))
            .cloned()
            .collect();
        letters.sort_by_key(|d| d.failed_at);
        Ok(letters)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_active_orders_by_priority_and_skips_inactive() {
        let store = MemorySubscriptionStore::new();
        let low = Subscription::new("acme", "low", "order.created").with_priority(1);
        let high = Subscription::new("acme", "high", "order.created").with_priority(10);
        let off = Subscription::new("acme", "off", "order.created").deactivated();
        let other = Subscription::new("globex", "other", "order.created");
        for s in [low, high, off, other] {
            store.put(s).await.unwrap();
        }

        let found = store.find_active("acme", "order.created").await.unwrap();
        let ids: Vec<&str> = found.iter().map(|s| s.script_id.as_str()).collect();
        assert_eq!(ids, ["high", "low"]);
    }
}
