//! Metrics sink contract.
//!
//! The runtime reports through [`MetricsSink`] and never owns an exporter.
//! Names are the constants below so sinks can map them to their own registry.

use std::collections::HashMap;
use std::sync::Mutex;

pub const EXECUTIONS_TOTAL: &str = "script_executions_total";
pub const EXECUTION_ERRORS: &str = "script_execution_errors_total";
pub const EXECUTION_TIMEOUTS: &str = "script_execution_timeouts_total";
pub const EXECUTION_DURATION_MS: &str = "script_execution_duration_ms";
pub const CACHE_HITS: &str = "script_cache_hits_total";
pub const CACHE_MISSES: &str = "script_cache_misses_total";
pub const POOL_IN_USE: &str = "script_pool_in_use";
pub const POOL_RETIRED: &str = "script_pool_retired_total";
pub const QUEUE_DEPTH: &str = "event_queue_depth";
pub const TASKS_DROPPED: &str = "event_tasks_dropped_total";
pub const TASKS_DELIVERED: &str = "event_tasks_delivered_total";
pub const TASKS_RETRIED: &str = "event_tasks_retried_total";
pub const TASKS_DEAD_LETTERED: &str = "event_tasks_dead_lettered_total";

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str);
    fn observe(&self, name: &'static str, value: f64);
    fn gauge(&self, name: &'static str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &'static str) {}
    fn observe(&self, _name: &'static str, _value: f64) {}
    fn gauge(&self, _name: &'static str, _value: f64) {}
}

/// Keeps counters and last gauge values in memory; handy for tests and debugging.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
    observations: Mutex<HashMap<&'static str, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }

    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.observations
            .lock()
            .ok()
            .and_then(|o| o.get(name).cloned())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += 1;
        }
    }

    fn observe(&self, name: &'static str, value: f64) {
        if let Ok(mut observations) = self.observations.lock() {
            observations.entry(name).or_default().push(value);
        }
    }

    fn gauge(&self, name: &'static str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name, value);
        }
    }
}
