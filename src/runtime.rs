use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Bridge, Capabilities, ExecutionContext};
use crate::cache::{CacheStats, ProgramCache};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::ExecutionError;
use crate::events::{DeliveryFailure, DomainEvent, EventHandler, EventTask, Subscription};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::orchestrator::Executor;
use crate::pool::{PoolError, PoolStats, SandboxPool};
use crate::script::{ExecutionRequest, ExecutionResult, Script, TriggerKind};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start sandbox pool: {0}")]
    Pool(#[from] PoolError),
}

/// Entry point for every trigger: manual, HTTP, cron and event.
///
/// Must be created inside a tokio runtime; the pool's maintenance loop is
/// spawned on it.
pub struct ScriptRuntime {
    config: RuntimeConfig,
    executor: Executor,
    capabilities: Capabilities,
    shutdown: CancellationToken,
}

pub struct ScriptRuntimeBuilder {
    config: RuntimeConfig,
    capabilities: Capabilities,
    metrics: Arc<dyn MetricsSink>,
}

impl ScriptRuntimeBuilder {
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<ScriptRuntime, RuntimeError> {
        self.config.validate()?;
        let pool = SandboxPool::new(self.config.pool.clone(), Arc::clone(&self.metrics))?;
        let cache = Arc::new(ProgramCache::new(self.config.cache.capacity));
        let executor = Executor::new(
            pool,
            cache,
            self.config.limits.clone(),
            self.config.executor.clone(),
            self.metrics,
        );
        Ok(ScriptRuntime {
            config: self.config,
            executor,
            capabilities: self.capabilities,
            shutdown: CancellationToken::new(),
        })
    }
}

impl ScriptRuntime {
    pub fn builder(config: RuntimeConfig) -> ScriptRuntimeBuilder {
        ScriptRuntimeBuilder {
            config,
            capabilities: Capabilities::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Runtime without capability backends or metrics.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run one request to a terminal state.
    pub async fn run(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let ExecutionRequest {
            script,
            context,
            trigger,
            input,
            timeout,
        } = request;
        let bridge = Bridge::new(context, trigger, self.capabilities.clone()).with_input(input);
        self.executor.execute(cancel, &script, bridge, timeout).await
    }

    /// Evaluate a subscription filter against `event` with the reduced bridge.
    ///
    /// The completion value is interpreted with JavaScript truthiness.
    pub async fn evaluate_filter(
        &self,
        tenant_id: &str,
        filter: &str,
        event: &DomainEvent,
    ) -> Result<bool, ExecutionError> {
        let script = Script::new(format!("filter:{tenant_id}"), filter);
        let context =
            ExecutionContext::new(tenant_id, tenant_id).with_request_id(event.id.to_string());
        let bridge = Bridge::reduced(context, event_value(event));
        let cancel = self.shutdown.child_token();
        let result = self
            .executor
            .execute(
                &cancel,
                &script,
                bridge,
                Some(self.config.pipeline.filter_timeout()),
            )
            .await?;
        Ok(truthy(&result.output))
    }

    /// Run a subscription's handler script for one event task.
    pub async fn run_event(
        &self,
        task: &EventTask,
        script: &Script,
    ) -> Result<ExecutionResult, ExecutionError> {
        let tenant_id = task.subscription.tenant_id.as_str();
        let context =
            ExecutionContext::new(tenant_id, tenant_id).with_request_id(task.id.to_string());
        let bridge = Bridge::new(context, TriggerKind::Event, self.capabilities.clone())
            .with_input(task.event.payload.clone())
            .with_event(event_value(&task.event));
        let cancel = self.shutdown.child_token();
        self.executor
            .execute(
                &cancel,
                script,
                bridge,
                Some(self.config.pipeline.handler_timeout()),
            )
            .await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.executor.pool().stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.executor.cache().stats()
    }

    /// Cancel event-driven runs and close the pool.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.executor.pool().close();
    }
}

#[async_trait]
impl EventHandler for ScriptRuntime {
    async fn matches(
        &self,
        subscription: &Subscription,
        filter: &str,
        event: &DomainEvent,
    ) -> Result<bool, DeliveryFailure> {
        self.evaluate_filter(&subscription.tenant_id, filter, event)
            .await
            .map_err(DeliveryFailure::from)
    }

    async fn handle(&self, task: &EventTask, script: Script) -> Result<(), DeliveryFailure> {
        self.run_event(task, &script)
            .await
            .map(|_| ())
            .map_err(DeliveryFailure::from)
    }
}

fn event_value(event: &DomainEvent) -> serde_json::Value {
    serde_json::to_value(event).unwrap_or(serde_json::Value::Null)
}

fn truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::truthy;
    use serde_json::json;

    #[test]
    fn filter_results_use_js_truthiness() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(truthy(&json!({})));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(null)));
    }
}
