use std::time::Duration;

use crate::bridge::SetupError;
use crate::governor::LimitViolation;
use crate::pool::PoolError;
use crate::script::ExecutionResult;

/// Why a watchdog-stopped execution ended without a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutCause {
    Deadline,
    Cancelled,
    /// The pool was closed while the execution held an instance.
    Shutdown,
}

/// Classification of a failed execution.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Compile-time failure; retrying the same source cannot succeed.
    #[error("syntax error: {message}")]
    Syntax { message: String },

    /// Uncaught exception thrown by the script, or a recovered host panic.
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        stack: Option<String>,
    },

    #[error("execution timed out after {}ms ({cause:?})", .elapsed.as_millis())]
    Timeout {
        elapsed: Duration,
        cause: TimeoutCause,
    },

    #[error("resource limit: {0}")]
    ResourceLimit(#[from] LimitViolation),

    #[error("no interpreter available: {0}")]
    PoolExhausted(#[source] PoolError),

    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),
}

impl ScriptError {
    /// Stable short name, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptError::Syntax { .. } => "syntax",
            ScriptError::Runtime { .. } => "runtime",
            ScriptError::Timeout { .. } => "timeout",
            ScriptError::ResourceLimit(_) => "resource_limit",
            ScriptError::PoolExhausted(_) => "pool_exhausted",
            ScriptError::Setup(_) => "setup",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ScriptError::Timeout { .. })
    }
}

/// A classified failure with the execution it belongs to.
///
/// `partial` holds whatever the execution produced before it stopped, most
/// importantly the log lines captured so far.
#[derive(Debug, thiserror::Error)]
#[error("script '{script_id}' for tenant '{tenant_id}' failed: {error}")]
pub struct ExecutionError {
    pub script_id: String,
    pub tenant_id: String,
    #[source]
    pub error: ScriptError,
    pub partial: ExecutionResult,
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}
