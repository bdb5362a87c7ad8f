use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::SetupError;
use crate::script::TriggerKind;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Who a script runs for. Authorization has already happened when this is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub tenant: TenantInfo,
    pub user: Option<UserInfo>,
    pub request_id: String,
    pub locale: String,
}

impl ExecutionContext {
    pub fn new(tenant_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            tenant: TenantInfo {
                id: tenant_id.into(),
                name: tenant_name.into(),
            },
            user: None,
            request_id: Uuid::new_v4().to_string(),
            locale: "en-US".to_string(),
        }
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.id
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        validate_tenant_id(&self.tenant.id)
    }

    /// The object exposed to scripts as `context`.
    pub(crate) fn to_script_value(
        &self,
        deadline_ms: u64,
        trigger: TriggerKind,
    ) -> serde_json::Value {
        json!({
            "tenant": self.tenant,
            "user": self.user,
            "requestId": self.request_id,
            "locale": self.locale,
            "deadlineMs": deadline_ms,
            "trigger": trigger.as_str(),
        })
    }
}

/// Tenant ids end up in storage keys, so they are restricted to `[A-Za-z0-9_-]`.
pub fn validate_tenant_id(id: &str) -> Result<(), SetupError> {
    if id.is_empty() {
        return Err(SetupError::MissingTenant);
    }
    let valid = id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(SetupError::InvalidTenant(id.to_string()));
    }
    Ok(())
}
