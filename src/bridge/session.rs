use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::CapabilityError;
use crate::governor::{ResourceGovernor, ResourceLimits};
use crate::sandbox::{InterruptHandle, InterruptReason};
use crate::script::{LogEvent, LogLevel};

/// Everything a capability needs to know about the execution calling it.
///
/// Cloned into every native function installed for one execution and
/// dropped with them when the sandbox is reset.
#[derive(Clone)]
pub struct ExecutionSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    execution_id: Uuid,
    script_id: String,
    governor: Arc<ResourceGovernor>,
    limits: ResourceLimits,
    interrupt: InterruptHandle,
    abort: CancellationToken,
    logs: Mutex<Vec<LogEvent>>,
    dropped_logs: Mutex<usize>,
    max_log_lines: usize,
    deadline: Instant,
    handle: tokio::runtime::Handle,
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("execution_id", &self.inner.execution_id)
            .field("script_id", &self.inner.script_id)
            .finish()
    }
}

pub(crate) struct SessionParts {
    pub execution_id: Uuid,
    pub script_id: String,
    pub governor: Arc<ResourceGovernor>,
    pub limits: ResourceLimits,
    pub interrupt: InterruptHandle,
    pub max_log_lines: usize,
    pub deadline: Instant,
    pub handle: tokio::runtime::Handle,
}

impl ExecutionSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                execution_id: parts.execution_id,
                script_id: parts.script_id,
                governor: parts.governor,
                limits: parts.limits,
                interrupt: parts.interrupt,
                abort: CancellationToken::new(),
                logs: Mutex::new(Vec::new()),
                dropped_logs: Mutex::new(0),
                max_log_lines: parts.max_log_lines,
                deadline: parts.deadline,
                handle: parts.handle,
            }),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.inner.execution_id
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.inner.governor
    }

    /// Time left before the execution deadline.
    pub fn remaining(&self) -> Duration {
        self.inner.deadline.saturating_duration_since(Instant::now())
    }

    /// Stop the execution: interrupt the interpreter and abort in-flight capability calls.
    pub(crate) fn stop(&self, reason: InterruptReason) -> bool {
        let tripped = self.inner.interrupt.trip(reason);
        self.inner.abort.cancel();
        tripped
    }

    /// Count one capability call and enforce every ceiling before it proceeds.
    pub fn charge_api_call(&self) -> Result<(), CapabilityError> {
        if let Some(reason) = self.inner.interrupt.reason() {
            return Err(CapabilityError::Interrupted(reason));
        }
        self.inner.governor.track_api_call();
        self.enforce_limits()
    }

    /// Account `bytes` moved across the boundary against the memory ceiling.
    pub fn track_bytes(&self, bytes: usize) -> Result<(), CapabilityError> {
        self.inner
            .governor
            .track_memory(i64::try_from(bytes).unwrap_or(i64::MAX));
        self.enforce_limits()
    }

    fn enforce_limits(&self) -> Result<(), CapabilityError> {
        match self.inner.governor.check_limits(&self.inner.limits) {
            Ok(()) => Ok(()),
            Err(violation) => {
                tracing::warn!(
                    execution_id = %self.inner.execution_id,
                    script_id = %self.inner.script_id,
                    %violation,
                    "resource limit hit in capability call"
                );
                self.stop(InterruptReason::Limit(violation.clone()));
                Err(CapabilityError::Limit(violation))
            }
        }
    }

    /// Drive `fut` to completion from the interpreter thread, bounded by the deadline.
    pub fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, CapabilityError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(CapabilityError::Timeout);
        }
        let abort = self.inner.abort.clone();
        self.inner.handle.block_on(async move {
            tokio::select! {
                _ = abort.cancelled() => Err(CapabilityError::Timeout),
                result = tokio::time::timeout(remaining, fut) => {
                    result.map_err(|_| CapabilityError::Timeout)
                }
            }
        })
    }

    pub fn log(&self, level: LogLevel, message: String) {
        tracing::debug!(
            execution_id = %self.inner.execution_id,
            script_id = %self.inner.script_id,
            ?level,
            "[JS] {message}"
        );
        let mut logs = self.inner.logs.lock().unwrap_or_else(|e| e.into_inner());
        if logs.len() >= self.inner.max_log_lines {
            *self.inner.dropped_logs.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            return;
        }
        logs.push(LogEvent { level, message });
    }

    /// Log lines captured so far.
    pub fn logs(&self) -> Vec<LogEvent> {
        self.inner
            .logs
            .lock()
            .map(|logs| logs.clone())
            .unwrap_or_default()
    }

    /// Lines discarded because the per-execution cap was reached.
    pub fn dropped_logs(&self) -> usize {
        self.inner
            .dropped_logs
            .lock()
            .map(|n| *n)
            .unwrap_or_default()
    }
}
