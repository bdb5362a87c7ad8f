use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::CapabilityError;

/// Column every row carries to record its owning tenant.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Backend for `api.data`.
///
/// Implementations should scope by `tenant_id` themselves; the bridge
/// re-checks ownership on every row regardless.
#[async_trait]
pub trait DataAccess: Send + Sync {
    async fn query(
        &self,
        tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, CapabilityError>;

    async fn insert(
        &self,
        tenant_id: &str,
        collection: &str,
        row: Value,
    ) -> Result<Value, CapabilityError>;
}

/// Keep only rows owned by `tenant_id`.
pub(crate) fn scope_rows(tenant_id: &str, rows: Vec<Value>) -> Vec<Value> {
    let total = rows.len();
    let owned: Vec<Value> = rows
        .into_iter()
        .filter(|row| row.get(TENANT_COLUMN).and_then(Value::as_str) == Some(tenant_id))
        .collect();
    if owned.len() != total {
        tracing::warn!(
            tenant_id,
            dropped = total - owned.len(),
            "data backend returned rows of another tenant"
        );
    }
    owned
}

/// Overwrite the owner column of `row` with `tenant_id`.
pub(crate) fn stamp_row(tenant_id: &str, row: Value) -> Result<Value, CapabilityError> {
    match row {
        Value::Object(mut fields) => {
            fields.insert(TENANT_COLUMN.to_string(), Value::String(tenant_id.to_string()));
            Ok(Value::Object(fields))
        }
        _ => Err(CapabilityError::InvalidArgument(
            "inserted row must be an object".into(),
        )),
    }
}

fn matches_filter(row: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| row.get(k) == Some(v)),
        None => true,
    }
}

/// Collections of JSON rows held in memory. Filters are field equality.
///
/// Queries deliberately ignore the tenant so the bridge-side ownership
/// check is what scopes results.
#[derive(Debug, Default)]
pub struct MemoryData {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows as-is, bypassing ownership stamping.
    pub fn seed(&self, collection: &str, rows: impl IntoIterator<Item = Value>) {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, collection: &str) -> Vec<Value> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(collection).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DataAccess for MemoryData {
    async fn query(
        &self,
        _tenant_id: &str,
        collection: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, CapabilityError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_filter(row, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(
        &self,
        _tenant_id: &str,
        collection: &str,
        row: Value,
    ) -> Result<Value, CapabilityError> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn foreign_and_unowned_rows_are_dropped() {
        let rows = vec![
            json!({"id": 1, "tenant_id": "acme"}),
            json!({"id": 2, "tenant_id": "globex"}),
            json!({"id": 3}),
        ];
        let scoped = scope_rows("acme", rows);
        assert_eq!(scoped, vec![json!({"id": 1, "tenant_id": "acme"})]);
    }

    #[test]
    fn stamping_overrides_a_forged_owner() {
        let row = stamp_row("acme", json!({"sku": "x", "tenant_id": "globex"})).unwrap();
        assert_eq!(row["tenant_id"], "acme");
        assert!(stamp_row("acme", json!([1, 2])).is_err());
    }
}
