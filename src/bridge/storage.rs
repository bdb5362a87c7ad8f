use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::CapabilityError;

/// Backend for `api.storage`. Keys arrive already namespaced by tenant.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CapabilityError>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), CapabilityError>;
    /// Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool, CapabilityError>;
}

/// Physical key for a tenant's logical key.
pub fn namespaced_key(tenant_id: &str, key: &str) -> Result<String, CapabilityError> {
    if key.is_empty() {
        return Err(CapabilityError::InvalidArgument(
            "storage key must not be empty".into(),
        ));
    }
    Ok(format!("t/{tenant_id}/{key}"))
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every physical key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, CapabilityError> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), CapabilityError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CapabilityError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_with_the_tenant() {
        assert_eq!(namespaced_key("acme", "counter").unwrap(), "t/acme/counter");
        assert!(namespaced_key("acme", "").is_err());
    }
}
