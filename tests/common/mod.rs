#![allow(dead_code)]

use serde_json::json;
use tenant_runtime_quickjs::{ExecutionContext, ExecutionRequest, RuntimeConfig, Script};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Small pool, short default deadline and immediate retries.
pub fn config() -> RuntimeConfig {
    init_tracing();
    let mut config = RuntimeConfig::default();
    config.pool.min_idle = 1;
    config.pool.max_size = Some(4);
    config.executor.default_timeout_ms = 5_000;
    config.pipeline.retry_backoff_ms = 0;
    config
}

/// Pool of exactly one sandbox, so consecutive runs reuse it.
pub fn single_sandbox_config() -> RuntimeConfig {
    let mut config = config();
    config.pool.min_idle = 1;
    config.pool.max_size = Some(1);
    config
}

pub fn tenant(id: &str) -> ExecutionContext {
    ExecutionContext::new(id, format!("{id} inc"))
}

pub fn request(tenant_id: &str, source: &str) -> ExecutionRequest {
    ExecutionRequest::manual(
        Script::new(format!("{tenant_id}-script"), source),
        tenant(tenant_id),
        json!({}),
    )
}
