use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::{ExecutionContext, HttpRequest};
use crate::cache::CacheLookup;
use crate::governor::ResourceUsage;

/// A script body together with the identity it was stored under.
///
/// The source is reference counted; cloning a script never copies its text.
#[derive(Clone, Debug)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub source: Arc<str>,
}

impl Script {
    pub fn new(id: impl Into<String>, source: &str) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source: Arc::from(source),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What caused an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Cron,
    Http,
    Event,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Cron => "cron",
            TriggerKind::Http => "http",
            TriggerKind::Event => "event",
        }
    }
}

/// A request to run one script for one tenant.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub script: Script,
    pub context: ExecutionContext,
    pub trigger: TriggerKind,
    /// Exposed to the script as the read-only `input` global.
    pub input: serde_json::Value,
    /// Falls back to the executor default when `None`.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn manual(script: Script, context: ExecutionContext, input: serde_json::Value) -> Self {
        Self {
            script,
            context,
            trigger: TriggerKind::Manual,
            input,
            timeout: None,
        }
    }

    /// A cron firing; the script sees `input.cron` and `input.scheduledTime`.
    pub fn cron(
        script: Script,
        context: ExecutionContext,
        expression: &str,
        scheduled_time: u64,
    ) -> Self {
        Self {
            script,
            context,
            trigger: TriggerKind::Cron,
            input: serde_json::json!({
                "cron": expression,
                "scheduledTime": scheduled_time,
            }),
            timeout: None,
        }
    }

    /// An HTTP endpoint invocation; the script sees the request as `input`.
    pub fn http(script: Script, context: ExecutionContext, request: &HttpRequest) -> Self {
        Self {
            script,
            context,
            trigger: TriggerKind::Http,
            input: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Terminal state of an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Log level for captured script logs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub(crate) fn parse(level: &str) -> Self {
        match level {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One captured `console.*` line
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Outcome of an execution, also carried as the partial result of a failure.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Completion value of the script converted to JSON; `null` when not representable.
    pub output: serde_json::Value,
    pub logs: Vec<LogEvent>,
    pub duration: Duration,
    pub usage: ResourceUsage,
    /// Interpreter instance that ran the script, if one was acquired.
    pub sandbox_id: Option<u64>,
    /// Whether compilation hit the program cache, if compilation was reached.
    pub cache: Option<CacheLookup>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}
