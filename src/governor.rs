use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-execution resource ceilings.
///
/// A zero value disables the corresponding check.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Approximate bytes moved through capabilities and logs.
    pub max_memory_bytes: u64,
    /// Time spent in the running phase.
    pub max_cpu_time_ms: u64,
    /// Capability invocations (HTTP, storage, data, events, logging).
    pub max_api_calls: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 32 * 1024 * 1024,
            max_cpu_time_ms: 5_000,
            max_api_calls: 1_000,
        }
    }
}

impl ResourceLimits {
    /// No ceilings at all.
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: 0,
            max_cpu_time_ms: 0,
            max_api_calls: 0,
        }
    }
}

/// A ceiling that an execution crossed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LimitViolation {
    #[error("memory limit exceeded ({used} of {limit} bytes)")]
    MemoryExceeded { used: u64, limit: u64 },

    #[error("CPU time limit exceeded ({used_ms}ms of {limit_ms}ms)")]
    CpuTimeExceeded { used_ms: u64, limit_ms: u64 },

    #[error("API call limit exceeded ({calls} of {limit} calls)")]
    ApiCallLimitExceeded { calls: u64, limit: u64 },
}

/// Point-in-time view of what an execution consumed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub elapsed: Duration,
    pub api_calls: u64,
}

/// Tracks resource consumption of exactly one execution.
///
/// Counters are atomics so capability closures on the interpreter thread and
/// the watchdog on the async side can share a governor without locking.
/// Bounds are soft: they are observed at capability calls and watchdog ticks,
/// never inside a running native operation.
#[derive(Debug)]
pub struct ResourceGovernor {
    started: Instant,
    running_since_ns: AtomicU64,
    api_calls: AtomicU64,
    memory: AtomicU64,
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            running_since_ns: AtomicU64::new(u64::MAX),
            api_calls: AtomicU64::new(0),
            memory: AtomicU64::new(0),
        }
    }

    /// Mark the start of the running phase; CPU time is measured from here.
    pub fn start_running(&self) {
        let offset = self.started.elapsed().as_nanos() as u64;
        self.running_since_ns.store(offset, Ordering::Release);
    }

    /// Count one capability invocation and return the new total.
    pub fn track_api_call(&self) -> u64 {
        self.api_calls.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Add (or with a negative delta, release) approximate allocation.
    pub fn track_memory(&self, delta: i64) {
        if delta >= 0 {
            self.memory.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            let release = delta.unsigned_abs();
            let _ = self
                .memory
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(release))
                });
        }
    }

    pub fn api_calls(&self) -> u64 {
        self.api_calls.load(Ordering::Acquire)
    }

    pub fn memory(&self) -> u64 {
        self.memory.load(Ordering::Acquire)
    }

    /// Time spent since [`start_running`](Self::start_running), zero before it.
    pub fn cpu_time(&self) -> Duration {
        let since = self.running_since_ns.load(Ordering::Acquire);
        if since == u64::MAX {
            return Duration::ZERO;
        }
        let now = self.started.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(since))
    }

    /// First violated ceiling, checked in memory, CPU, API-call order.
    pub fn check_limits(&self, limits: &ResourceLimits) -> Result<(), LimitViolation> {
        let used = self.memory();
        if limits.max_memory_bytes > 0 && used > limits.max_memory_bytes {
            return Err(LimitViolation::MemoryExceeded {
                used,
                limit: limits.max_memory_bytes,
            });
        }

        let cpu_ms = self.cpu_time().as_millis() as u64;
        if limits.max_cpu_time_ms > 0 && cpu_ms > limits.max_cpu_time_ms {
            return Err(LimitViolation::CpuTimeExceeded {
                used_ms: cpu_ms,
                limit_ms: limits.max_cpu_time_ms,
            });
        }

        let calls = self.api_calls();
        if limits.max_api_calls > 0 && calls > limits.max_api_calls {
            return Err(LimitViolation::ApiCallLimitExceeded {
                calls,
                limit: limits.max_api_calls,
            });
        }

        Ok(())
    }

    pub fn snapshot(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.memory(),
            elapsed: self.started.elapsed(),
            api_calls: self.api_calls(),
        }
    }
}
