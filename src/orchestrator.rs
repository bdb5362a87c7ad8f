//! One "run this script" operation over pool, cache and governor.
//!
//! The script runs on a blocking thread that owns the sandbox lease. The
//! async side is a watchdog: a single interval checks the deadline and the
//! governor, and the caller's token is watched alongside it. Whatever fires
//! first raises the interrupt and is recorded as the reason.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use rquickjs::Ctx;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::{Bridge, ExecutionSession, SessionParts, SetupError};
use crate::cache::{CacheLookup, ProgramCache};
use crate::config::ExecutorConfig;
use crate::error::{ExecutionError, ScriptError, TimeoutCause};
use crate::governor::{LimitViolation, ResourceGovernor, ResourceLimits, ResourceUsage};
use crate::metrics::{self, MetricsSink};
use crate::pool::{PoolError, SandboxLease, SandboxPool};
use crate::sandbox::{InterruptHandle, InterruptReason, JsException};
use crate::script::{ExecutionResult, ExecutionStatus, Script};

/// Installs execution-scoped globals before the program is compiled.
pub trait ExecutionSetup: Send + 'static {
    /// Tenant the execution is accounted to.
    fn tenant_id(&self) -> &str;

    fn install(&self, ctx: &Ctx<'_>, session: &ExecutionSession) -> Result<(), SetupError>;
}

impl ExecutionSetup for Bridge {
    fn tenant_id(&self) -> &str {
        self.context().tenant_id()
    }

    fn install(&self, ctx: &Ctx<'_>, session: &ExecutionSession) -> Result<(), SetupError> {
        Bridge::install(self, ctx, session)
    }
}

/// Where a failed run stopped.
#[derive(Debug)]
enum Failure {
    Setup(SetupError),
    Compile(JsException),
    Run(JsException),
    Panic(String),
}

/// What the blocking thread reports back.
struct RunOutcome {
    result: Result<serde_json::Value, Failure>,
    cache: Option<CacheLookup>,
    /// Captured before the lease is released, since release invalidates the handle.
    interrupt: Option<InterruptReason>,
}

pub struct Executor {
    pool: SandboxPool,
    cache: Arc<ProgramCache>,
    limits: ResourceLimits,
    config: ExecutorConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Executor {
    pub fn new(
        pool: SandboxPool,
        cache: Arc<ProgramCache>,
        limits: ResourceLimits,
        config: ExecutorConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            pool,
            cache,
            limits,
            config,
            metrics,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run `script` to a terminal state.
    ///
    /// `timeout` falls back to the configured default. Cancelling `cancel`
    /// ends the execution as a timeout with [`TimeoutCause::Cancelled`].
    pub async fn execute<S: ExecutionSetup>(
        &self,
        cancel: &CancellationToken,
        script: &Script,
        setup: S,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let execution_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "execute",
            %execution_id,
            script_id = %script.id,
            tenant_id = %setup.tenant_id(),
        );
        self.execute_inner(execution_id, cancel, script, setup, timeout)
            .instrument(span)
            .await
    }

    async fn execute_inner<S: ExecutionSetup>(
        &self,
        execution_id: Uuid,
        cancel: &CancellationToken,
        script: &Script,
        setup: S,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        let deadline = started + timeout;
        let tenant_id = setup.tenant_id().to_string();
        self.metrics.increment(metrics::EXECUTIONS_TOTAL);

        let failed_early = |error: ScriptError| {
            self.finish_err(
                script,
                &tenant_id,
                error,
                Partial {
                    execution_id,
                    started,
                    logs: Vec::new(),
                    usage: ResourceUsage::default(),
                    sandbox_id: None,
                    cache: None,
                },
            )
        };

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(failed_early(ScriptError::Timeout {
                    elapsed: started.elapsed(),
                    cause: TimeoutCause::Cancelled,
                }));
            }
            acquired = self.pool.acquire(deadline) => acquired,
        };
        let lease = match acquired {
            Ok(lease) => lease,
            Err(PoolError::Timeout) => {
                return Err(failed_early(ScriptError::Timeout {
                    elapsed: started.elapsed(),
                    cause: TimeoutCause::Deadline,
                }));
            }
            Err(err) => return Err(failed_early(ScriptError::PoolExhausted(err))),
        };

        let sandbox_id = lease.id();
        tracing::debug!(sandbox_id, use_count = lease.use_count(), "sandbox bound");
        let backstop =
            deadline.saturating_duration_since(Instant::now()) + self.config.interrupt_grace();
        lease.sandbox().arm_deadline(backstop);
        let _stop_on_drop = StopOnDrop(lease.interrupt().clone());

        let governor = Arc::new(ResourceGovernor::new());
        let session = ExecutionSession::new(SessionParts {
            execution_id,
            script_id: script.id.clone(),
            governor: Arc::clone(&governor),
            limits: self.limits.clone(),
            interrupt: lease.interrupt().clone(),
            max_log_lines: self.config.max_log_lines,
            deadline: deadline.into_std(),
            handle: tokio::runtime::Handle::current(),
        });

        let job = {
            let session = session.clone();
            let cache = Arc::clone(&self.cache);
            let script = script.clone();
            let governor = Arc::clone(&governor);
            move || run_on_sandbox(lease, &cache, &script, setup, &session, &governor)
        };
        let mut handle = tokio::task::spawn_blocking(job);

        let mut tick = tokio::time::interval(self.config.watchdog_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let grace = self.config.interrupt_grace();
        let mut stopped: Option<(InterruptReason, Instant)> = None;

        let joined = loop {
            tokio::select! {
                biased;
                joined = &mut handle => break Some(joined),
                _ = cancel.cancelled(), if stopped.is_none() => {
                    tracing::debug!("execution cancelled by caller");
                    session.stop(InterruptReason::Cancelled);
                    stopped = Some((InterruptReason::Cancelled, Instant::now()));
                }
                _ = tick.tick() => {
                    if let Some((_, at)) = &stopped {
                        if at.elapsed() >= grace {
                            break None;
                        }
                        continue;
                    }
                    let reason = if Instant::now() >= deadline {
                        Some(InterruptReason::Deadline)
                    } else {
                        governor.check_limits(&self.limits).err().map(InterruptReason::Limit)
                    };
                    if let Some(reason) = reason {
                        tracing::debug!(?reason, "watchdog interrupting script");
                        session.stop(reason.clone());
                        stopped = Some((reason, Instant::now()));
                    }
                }
            }
        };

        let partial = Partial {
            execution_id,
            started,
            logs: session.logs(),
            usage: governor.snapshot(),
            sandbox_id: Some(sandbox_id),
            cache: None,
        };

        let outcome = match joined {
            Some(Ok(outcome)) => outcome,
            Some(Err(join_error)) => RunOutcome {
                result: Err(Failure::Panic(join_error.to_string())),
                cache: None,
                interrupt: None,
            },
            None => {
                // Past the grace period; the blocking thread releases the sandbox when it unwinds.
                let elapsed = started.elapsed();
                let error = match stopped.map(|(reason, _)| reason) {
                    Some(InterruptReason::Limit(violation)) => {
                        ScriptError::ResourceLimit(violation)
                    }
                    Some(InterruptReason::Cancelled) => ScriptError::Timeout {
                        elapsed,
                        cause: TimeoutCause::Cancelled,
                    },
                    Some(InterruptReason::Shutdown) => ScriptError::Timeout {
                        elapsed,
                        cause: TimeoutCause::Shutdown,
                    },
                    Some(InterruptReason::Deadline) | None => ScriptError::Timeout {
                        elapsed,
                        cause: TimeoutCause::Deadline,
                    },
                };
                tracing::warn!(
                    sandbox_id,
                    "script did not unwind within the interrupt grace period"
                );
                return Err(self.finish_err(script, &tenant_id, error, partial));
            }
        };

        let partial = Partial {
            cache: outcome.cache,
            ..partial
        };

        match (outcome.result, outcome.interrupt) {
            (_, Some(InterruptReason::Limit(violation))) => Err(self.finish_err(
                script,
                &tenant_id,
                ScriptError::ResourceLimit(violation),
                partial,
            )),
            (Ok(output), _) => Ok(self.finish_ok(output, partial)),
            (Err(failure), reason) => {
                let error = self.classify(failure, reason, started.elapsed(), &governor);
                Err(self.finish_err(script, &tenant_id, error, partial))
            }
        }
    }

    fn classify(
        &self,
        failure: Failure,
        reason: Option<InterruptReason>,
        elapsed: Duration,
        governor: &ResourceGovernor,
    ) -> ScriptError {
        if let Failure::Setup(err) = failure {
            return ScriptError::Setup(err);
        }
        match reason {
            Some(InterruptReason::Deadline) => {
                return ScriptError::Timeout {
                    elapsed,
                    cause: TimeoutCause::Deadline,
                };
            }
            Some(InterruptReason::Cancelled) => {
                return ScriptError::Timeout {
                    elapsed,
                    cause: TimeoutCause::Cancelled,
                };
            }
            Some(InterruptReason::Shutdown) => {
                return ScriptError::Timeout {
                    elapsed,
                    cause: TimeoutCause::Shutdown,
                };
            }
            Some(InterruptReason::Limit(violation)) => return ScriptError::ResourceLimit(violation),
            None => {}
        }

        match failure {
            Failure::Setup(err) => ScriptError::Setup(err),
            Failure::Compile(ex) if ex.is_syntax_error() => ScriptError::Syntax {
                message: ex.message,
            },
            Failure::Compile(ex) | Failure::Run(ex) if ex.is_out_of_memory() => {
                ScriptError::ResourceLimit(LimitViolation::MemoryExceeded {
                    used: governor.memory(),
                    limit: self.pool.config().memory_limit_bytes as u64,
                })
            }
            Failure::Compile(ex) | Failure::Run(ex) => ScriptError::Runtime {
                message: ex.to_string(),
                stack: ex.stack,
            },
            Failure::Panic(message) => ScriptError::Runtime {
                message: format!("host panic: {message}"),
                stack: None,
            },
        }
    }

    fn record_cache(&self, cache: Option<CacheLookup>) {
        match cache {
            Some(CacheLookup::Hit) => self.metrics.increment(metrics::CACHE_HITS),
            Some(CacheLookup::Miss) => self.metrics.increment(metrics::CACHE_MISSES),
            None => {}
        }
    }

    fn finish_ok(&self, output: serde_json::Value, partial: Partial) -> ExecutionResult {
        self.record_cache(partial.cache);
        let result = partial.into_result(ExecutionStatus::Succeeded, output);
        self.metrics.observe(
            metrics::EXECUTION_DURATION_MS,
            result.duration.as_secs_f64() * 1000.0,
        );
        tracing::info!(
            duration_ms = result.duration.as_millis() as u64,
            api_calls = result.usage.api_calls,
            cache = ?result.cache,
            "script succeeded"
        );
        result
    }

    fn finish_err(
        &self,
        script: &Script,
        tenant_id: &str,
        error: ScriptError,
        partial: Partial,
    ) -> ExecutionError {
        self.record_cache(partial.cache);
        let status = if error.is_timeout() {
            self.metrics.increment(metrics::EXECUTION_TIMEOUTS);
            ExecutionStatus::TimedOut
        } else {
            ExecutionStatus::Failed
        };
        self.metrics.increment(metrics::EXECUTION_ERRORS);

        let result = partial.into_result(status, serde_json::Value::Null);
        self.metrics.observe(
            metrics::EXECUTION_DURATION_MS,
            result.duration.as_secs_f64() * 1000.0,
        );
        tracing::warn!(
            kind = error.kind(),
            error = %error,
            duration_ms = result.duration.as_millis() as u64,
            "script failed"
        );

        ExecutionError {
            script_id: script.id.clone(),
            tenant_id: tenant_id.to_string(),
            error,
            partial: result,
        }
    }
}

/// Stops the bound script when the execute future is dropped before it finishes.
///
/// Once the sandbox has been released the handle is stale and tripping it is a no-op.
struct StopOnDrop(InterruptHandle);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if self.0.trip(InterruptReason::Cancelled) {
            tracing::debug!("execution abandoned by caller, interrupting script");
        }
    }
}

/// Pieces of an [`ExecutionResult`] gathered before the terminal status is known.
struct Partial {
    execution_id: Uuid,
    started: Instant,
    logs: Vec<crate::script::LogEvent>,
    usage: ResourceUsage,
    sandbox_id: Option<u64>,
    cache: Option<CacheLookup>,
}

impl Partial {
    fn into_result(self, status: ExecutionStatus, output: serde_json::Value) -> ExecutionResult {
        ExecutionResult {
            execution_id: self.execution_id,
            status,
            output,
            logs: self.logs,
            duration: self.started.elapsed(),
            usage: self.usage,
            sandbox_id: self.sandbox_id,
            cache: self.cache,
        }
    }
}

/// Setting-Up, Compiling and Running on the thread that owns the lease.
///
/// The lease is dropped, and the sandbox released, before this returns.
fn run_on_sandbox<S: ExecutionSetup>(
    lease: SandboxLease,
    cache: &ProgramCache,
    script: &Script,
    setup: S,
    session: &ExecutionSession,
    governor: &ResourceGovernor,
) -> RunOutcome {
    let mut lookup = None;
    let result = catch_unwind(AssertUnwindSafe(|| {
        let sandbox = lease.sandbox();

        let installer = session.clone();
        sandbox
            .with(move |ctx| setup.install(&ctx, &installer))
            .map_err(Failure::Setup)?;

        let (program, hit) = cache
            .compile(&script.name, &script.source, |source| sandbox.check_syntax(source))
            .map_err(Failure::Compile)?;
        lookup = Some(hit);

        governor.start_running();
        sandbox.evaluate(program.source()).map_err(Failure::Run)
    }));

    let result = result.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(panic = %message, "panic while running script");
        Err(Failure::Panic(message))
    });

    let interrupt = lease.interrupt().reason();
    drop(lease);

    RunOutcome {
        result,
        cache: lookup,
        interrupt,
    }
}
