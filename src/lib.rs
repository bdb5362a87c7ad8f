//! Multi-tenant JavaScript script runtime on QuickJS.
//!
//! Scripts run in pooled, reset-on-release sandboxes under a watchdog that
//! enforces deadlines, cancellation and resource ceilings. Capabilities are
//! exposed through a tenant-scoped bridge, and an event pipeline delivers
//! domain events to subscribed scripts with retries and dead letters.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod governor;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod script;

pub use bridge::{
    Bridge, Capabilities, CapabilityError, EgressPolicy, ExecutionContext, ExecutionSession,
    SetupError, TenantInfo, UserInfo,
};
pub use cache::{CacheLookup, CacheStats, ProgramCache};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{ExecutionError, ScriptError, TimeoutCause};
pub use governor::{LimitViolation, ResourceGovernor, ResourceLimits, ResourceUsage};
pub use orchestrator::{ExecutionSetup, Executor};
pub use pool::{PoolError, PoolStats, SandboxPool};
pub use runtime::{RuntimeError, ScriptRuntime, ScriptRuntimeBuilder};
pub use script::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, LogEvent, LogLevel, Script, TriggerKind,
};

// Re-export rquickjs for custom `ExecutionSetup` implementations
pub use rquickjs;
