//! Runtime configuration.
//!
//! Every section deserializes from TOML with `#[serde(default)]`, so a config
//! file only needs the keys it overrides. Durations are integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::governor::ResourceLimits;

/// Errors raised while loading or validating a [`RuntimeConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration for a [`ScriptRuntime`](crate::ScriptRuntime).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub limits: ResourceLimits,
    pub executor: ExecutorConfig,
    pub pipeline: PipelineConfig,
}

impl RuntimeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject combinations the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(max) = self.pool.max_size {
            if max == 0 {
                return Err(ConfigError::Invalid("pool.max_size must be > 0".into()));
            }
            if self.pool.min_idle > max {
                return Err(ConfigError::Invalid(format!(
                    "pool.min_idle ({}) exceeds pool.max_size ({max})",
                    self.pool.min_idle
                )));
            }
        }
        if self.pool.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("pool.probe_timeout_ms must be > 0".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.executor.watchdog_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "executor.watchdog_interval_ms must be > 0".into(),
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be > 0".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Interpreter pool sizing and instance lifecycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Instances created up front and kept warm by the maintenance loop.
    pub min_idle: usize,
    /// Hard ceiling on live instances. `None` grows elastically.
    pub max_size: Option<usize>,
    /// How long `acquire` waits for a released instance before growing.
    pub acquire_grace_ms: u64,
    /// Retire an instance this long after creation (0 = never).
    pub max_age_ms: u64,
    /// Retire an instance after this many acquisitions (0 = never).
    pub max_uses: u64,
    /// Bound on the liveness probe.
    pub probe_timeout_ms: u64,
    /// Period of the idle re-validation loop.
    pub maintenance_interval_ms: u64,
    /// QuickJS heap cap per instance (0 = engine default).
    pub memory_limit_bytes: usize,
    /// QuickJS stack cap per instance (0 = engine default).
    pub max_stack_bytes: usize,
    /// Freeze builtins and make baseline globals read-only at creation.
    pub harden_builtins: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_size: None,
            acquire_grace_ms: 20,
            max_age_ms: 10 * 60 * 1000,
            max_uses: 500,
            probe_timeout_ms: 25,
            maintenance_interval_ms: 30_000,
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
            harden_builtins: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_grace(&self) -> Duration {
        Duration::from_millis(self.acquire_grace_ms)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_ms > 0).then(|| Duration::from_millis(self.max_age_ms))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}

/// Compiled program cache sizing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of distinct programs kept (LRU evicted beyond).
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Orchestrator deadlines and watchdog cadence.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline applied when a request does not carry one.
    pub default_timeout_ms: u64,
    /// Single watchdog tick for deadline and resource-limit checks.
    pub watchdog_interval_ms: u64,
    /// How long to wait for an interrupted script to unwind before giving up on it.
    pub interrupt_grace_ms: u64,
    /// Captured log lines per execution; later lines are dropped.
    pub max_log_lines: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            watchdog_interval_ms: 10,
            interrupt_grace_ms: 250,
            max_log_lines: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// Event delivery pipeline sizing and retry policy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of worker loops pulling from the task queue.
    pub workers: usize,
    /// Bounded queue length; a full queue drops new tasks.
    pub queue_capacity: usize,
    /// Deadline for a single filter expression evaluation.
    pub filter_timeout_ms: u64,
    /// Deadline for an event handler script when the caller gives none.
    pub handler_timeout_ms: u64,
    /// Base delay before a retry is re-queued (0 = immediate).
    pub retry_backoff_ms: u64,
    /// Cap on the exponential retry delay.
    pub max_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            filter_timeout_ms: 100,
            handler_timeout_ms: 10_000,
            retry_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Delay before re-queuing the `attempt`-th retry (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if self.retry_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.retry_backoff_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.pool.min_idle, 2);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.executor.watchdog_interval_ms, 10);
        assert!(config.pool.harden_builtins);
    }

    #[test]
    fn partial_sections_override_only_given_keys() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [pool]
            max_size = 8
            min_idle = 1

            [limits]
            max_api_calls = 25

            [pipeline]
            workers = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_size, Some(8));
        assert_eq!(config.pool.min_idle, 1);
        assert_eq!(config.pool.probe_timeout_ms, 25);
        assert_eq!(config.limits.max_api_calls, 25);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.queue_capacity, 1024);
    }

    #[test]
    fn min_idle_above_ceiling_is_rejected() {
        let err = RuntimeConfig::from_toml_str("[pool]\nmax_size = 1\nmin_idle = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = RuntimeConfig::from_toml_str("[pool\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = PipelineConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 350,
            ..PipelineConfig::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(350));
    }
}
