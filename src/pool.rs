//! Pool of reusable sandboxes.
//!
//! The pool hands out [`SandboxLease`]s. A lease is the only way to reach a
//! sandbox, and dropping it resets the sandbox to its baseline and either
//! parks it again or retires it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::metrics::{self, MetricsSink};
use crate::sandbox::{InterruptHandle, InterruptReason, Sandbox, SandboxError, SandboxId};

static NEXT_SANDBOX_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no sandbox became available within {waited:?}")]
    Exhausted { waited: Duration },

    #[error("acquire deadline already passed")]
    Timeout,

    #[error("pool is closed")]
    Closed,

    #[error("failed to create sandbox: {0}")]
    Create(#[from] SandboxError),
}

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Instances alive, including ones being created.
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub retired: u64,
    pub acquired: u64,
    pub max_size: Option<usize>,
}

struct PoolInner {
    id: u64,
    config: PoolConfig,
    idle: Mutex<VecDeque<Sandbox>>,
    available: Notify,
    live: AtomicUsize,
    in_use: AtomicUsize,
    created: AtomicU64,
    retired: AtomicU64,
    acquired: AtomicU64,
    closed: AtomicBool,
    bound: Mutex<HashMap<SandboxId, InterruptHandle>>,
    shutdown: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
}

/// Shared handle to a sandbox pool. Cloning is cheap.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("id", &self.inner.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SandboxPool {
    /// Create the pool and pre-warm `min_idle` sandboxes.
    ///
    /// When called inside a tokio runtime the maintenance loop is started as well.
    pub fn new(config: PoolConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, PoolError> {
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            idle: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            live: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            bound: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            metrics,
        });

        for _ in 0..inner.config.min_idle {
            if !inner.try_reserve() {
                break;
            }
            let sandbox = inner.create_reserved()?;
            inner.park(sandbox);
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(maintenance_loop(
                Arc::downgrade(&inner),
                inner.shutdown.clone(),
                inner.config.maintenance_interval(),
            ));
        }

        tracing::info!(
            pool_id = inner.id,
            min_idle = inner.config.min_idle,
            max_size = ?inner.config.max_size,
            "sandbox pool ready"
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a sandbox, waiting at most until `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> Result<SandboxLease, PoolError> {
        let inner = &self.inner;
        let started = Instant::now();
        if inner.is_closed() {
            return Err(PoolError::Closed);
        }
        if started >= deadline {
            return Err(PoolError::Timeout);
        }
        let grace_until = started + inner.config.acquire_grace();

        loop {
            if inner.is_closed() {
                return Err(PoolError::Closed);
            }

            if let Some(sandbox) = inner.take_idle() {
                return Ok(inner.lease(sandbox));
            }

            let now = Instant::now();
            let may_grow = now >= grace_until || inner.live() < inner.config.min_idle;
            if may_grow && inner.try_reserve() {
                let creator = Arc::clone(inner);
                let sandbox = tokio::task::spawn_blocking(move || creator.create_reserved())
                    .await
                    .map_err(|e| {
                        inner.unreserve();
                        SandboxError::Engine(format!("sandbox creation task failed: {e}"))
                    })??;
                return Ok(inner.lease(sandbox));
            }

            if now >= deadline {
                let waited = now - started;
                tracing::warn!(pool_id = inner.id, ?waited, "sandbox pool exhausted");
                return Err(PoolError::Exhausted { waited });
            }

            let wake_at = if now < grace_until {
                grace_until.min(deadline)
            } else {
                deadline
            };
            tokio::select! {
                _ = inner.available.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Re-probe idle sandboxes and retire the ones that fail or expired.
    pub fn revalidate_idle(&self) {
        self.inner.revalidate_idle();
    }

    /// Destroy idle sandboxes, interrupt bound ones and refuse further leases.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();

        let drained: Vec<Sandbox> = {
            let mut idle = inner.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.drain(..).collect()
        };
        let destroyed = drained.len();
        for sandbox in drained {
            inner.destroy(sandbox);
        }

        let bound: Vec<InterruptHandle> = {
            let bound = inner.bound.lock().unwrap_or_else(|e| e.into_inner());
            bound.values().cloned().collect()
        };
        for handle in &bound {
            handle.trip(InterruptReason::Shutdown);
        }

        inner.available.notify_waiters();
        tracing::info!(
            pool_id = inner.id,
            destroyed,
            interrupted = bound.len(),
            "sandbox pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            live: inner.live(),
            idle: inner.idle.lock().map(|i| i.len()).unwrap_or(0),
            in_use: inner.in_use.load(Ordering::Acquire),
            created: inner.created.load(Ordering::Relaxed),
            retired: inner.retired.load(Ordering::Relaxed),
            acquired: inner.acquired.load(Ordering::Relaxed),
            max_size: inner.config.max_size,
        }
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Claim a slot for a new sandbox, respecting the ceiling.
    fn try_reserve(&self) -> bool {
        match self.config.max_size {
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(max) => self
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    (live < max).then_some(live + 1)
                })
                .is_ok(),
        }
    }

    fn unreserve(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.available.notify_one();
    }

    /// Build a sandbox into an already reserved slot; the slot is freed on failure.
    fn create_reserved(&self) -> Result<Sandbox, PoolError> {
        let id = NEXT_SANDBOX_ID.fetch_add(1, Ordering::Relaxed);
        match Sandbox::new(id, self.id, &self.config) {
            Ok(sandbox) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Ok(sandbox)
            }
            Err(err) => {
                self.unreserve();
                tracing::error!(pool_id = self.id, error = %err, "failed to create sandbox");
                Err(err.into())
            }
        }
    }

    /// Pop idle sandboxes until one is fit for use; unfit ones are retired.
    fn take_idle(self: &Arc<Self>) -> Option<Sandbox> {
        loop {
            let mut sandbox = {
                let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
                idle.pop_front()?
            };
            if sandbox.is_expired(&self.config) {
                self.retire(sandbox, "expired");
                continue;
            }
            if !sandbox.probe(self.config.probe_timeout()) {
                self.retire(sandbox, "probe failed");
                continue;
            }
            return Some(sandbox);
        }
    }

    fn lease(self: &Arc<Self>, mut sandbox: Sandbox) -> SandboxLease {
        let interrupt = sandbox.bind();
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sandbox.id(), interrupt.clone());
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let in_use = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.gauge(metrics::POOL_IN_USE, in_use as f64);

        if self.is_closed() {
            interrupt.trip(InterruptReason::Shutdown);
        }

        tracing::debug!(
            pool_id = self.id,
            sandbox_id = sandbox.id(),
            use_count = sandbox.use_count(),
            "sandbox acquired"
        );

        SandboxLease {
            sandbox: Some(sandbox),
            pool: Arc::clone(self),
            interrupt,
        }
    }

    fn release(self: &Arc<Self>, mut sandbox: Sandbox) {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sandbox.id());
        let in_use = self.in_use.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        self.metrics.gauge(metrics::POOL_IN_USE, in_use as f64);

        if self.is_closed() {
            self.destroy(sandbox);
            return;
        }
        if !sandbox.is_healthy() {
            self.retire(sandbox, "unhealthy");
            self.replenish();
            return;
        }
        if sandbox.is_expired(&self.config) {
            self.retire(sandbox, "expired");
            self.replenish();
            return;
        }
        if let Err(err) = sandbox.reset(self.config.probe_timeout()) {
            tracing::warn!(sandbox_id = sandbox.id(), error = %err, "sandbox reset failed");
            self.retire(sandbox, "reset failed");
            self.replenish();
            return;
        }
        if !sandbox.probe(self.config.probe_timeout()) {
            self.retire(sandbox, "probe failed");
            self.replenish();
            return;
        }

        tracing::trace!(sandbox_id = sandbox.id(), "sandbox released");
        self.park(sandbox);
    }

    fn park(&self, sandbox: Sandbox) {
        if self.is_closed() {
            self.destroy(sandbox);
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(sandbox);
        self.available.notify_one();
    }

    fn retire(&self, sandbox: Sandbox, reason: &'static str) {
        tracing::debug!(
            pool_id = self.id,
            sandbox_id = sandbox.id(),
            use_count = sandbox.use_count(),
            age = ?sandbox.age(),
            reason,
            "sandbox retired"
        );
        self.retired.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(metrics::POOL_RETIRED);
        self.destroy(sandbox);
    }

    fn destroy(&self, sandbox: Sandbox) {
        drop(sandbox);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.available.notify_one();
    }

    /// Top idle capacity back up to `min_idle` in the background.
    fn replenish(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let target = self.config.min_idle;
        while !self.is_closed()
            && self.live().saturating_sub(self.in_use.load(Ordering::Acquire)) < target
        {
            if !self.try_reserve() {
                break;
            }
            let inner = Arc::clone(self);
            handle.spawn_blocking(move || {
                if let Ok(sandbox) = inner.create_reserved() {
                    inner.park(sandbox);
                }
            });
        }
    }

    fn revalidate_idle(self: &Arc<Self>) {
        let count = self.idle.lock().map(|i| i.len()).unwrap_or(0);
        for _ in 0..count {
            let Some(mut sandbox) = self
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            else {
                break;
            };
            if sandbox.is_expired(&self.config) {
                self.retire(sandbox, "expired");
            } else if !sandbox.probe(self.config.probe_timeout()) {
                self.retire(sandbox, "probe failed");
            } else {
                self.park(sandbox);
            }
        }
        self.replenish();
    }
}

async fn maintenance_loop(pool: Weak<PoolInner>, shutdown: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        let result = tokio::task::spawn_blocking(move || inner.revalidate_idle()).await;
        if let Err(err) = result {
            tracing::error!(error = %err, "pool maintenance pass failed");
        }
    }
    tracing::debug!("pool maintenance loop stopped");
}

/// Exclusive use of one sandbox. Dropping the lease releases it to the pool.
pub struct SandboxLease {
    sandbox: Option<Sandbox>,
    pool: Arc<PoolInner>,
    interrupt: InterruptHandle,
}

impl SandboxLease {
    fn get(&self) -> &Sandbox {
        // Only `Drop` takes the sandbox out.
        match &self.sandbox {
            Some(sandbox) => sandbox,
            None => unreachable!("lease used after release"),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        self.get()
    }

    pub fn id(&self) -> SandboxId {
        self.get().id()
    }

    pub fn use_count(&self) -> u64 {
        self.get().use_count()
    }

    pub fn created_at(&self) -> std::time::Instant {
        self.get().created_at()
    }

    pub fn age(&self) -> Duration {
        self.get().age()
    }

    /// Interrupt handle for this binding only.
    pub fn interrupt(&self) -> &InterruptHandle {
        &self.interrupt
    }
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            self.pool.release(sandbox);
        }
    }
}
