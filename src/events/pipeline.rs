use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::router::Router;
use super::{
    DeadLetter, DeadLetterStore, DomainEvent, EventBus, EventTask, ScriptStore, StoreError,
    Subscription, SubscriptionStore, TaskState,
};
use crate::config::PipelineConfig;
use crate::error::{ExecutionError, ScriptError};
use crate::metrics::{self, MetricsSink};
use crate::script::Script;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("task queue is full")]
    QueueFull,

    #[error("dead letter {0} not found")]
    NotFound(Uuid),

    #[error("pipeline is already attached to an event bus")]
    AlreadyAttached,

    #[error("invalid task transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("pipeline is shut down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a delivery attempt or filter evaluation failed.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DeliveryFailure {
    pub kind: String,
    pub message: String,
    /// Syntax and setup failures cannot succeed on a retry.
    pub retryable: bool,
}

impl DeliveryFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl From<ExecutionError> for DeliveryFailure {
    fn from(err: ExecutionError) -> Self {
        let retryable = !matches!(err.error, ScriptError::Syntax { .. } | ScriptError::Setup(_));
        Self {
            kind: err.kind().to_string(),
            message: err.error.to_string(),
            retryable,
        }
    }
}

/// Runs filters and handler scripts on behalf of the pipeline.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Evaluate `filter` against `event` with no external capabilities.
    async fn matches(
        &self,
        subscription: &Subscription,
        filter: &str,
        event: &DomainEvent,
    ) -> Result<bool, DeliveryFailure>;

    /// Run the subscription's script for `task`.
    async fn handle(&self, task: &EventTask, script: Script) -> Result<(), DeliveryFailure>;
}

/// Persistence collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineStores {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub scripts: Arc<dyn ScriptStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub events: u64,
    pub enqueued: u64,
    pub filtered_out: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub queue_depth: usize,
    /// Tasks accepted and not yet delivered or dead-lettered.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    events: AtomicU64,
    enqueued: AtomicU64,
    filtered_out: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    in_flight: AtomicUsize,
}

struct PipelineInner {
    config: PipelineConfig,
    router: Router,
    scripts: Arc<dyn ScriptStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handler: Arc<dyn EventHandler>,
    sender: mpsc::Sender<EventTask>,
    metrics: Arc<dyn MetricsSink>,
    counters: Counters,
    settled: Notify,
    shutdown: CancellationToken,
    attached: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Router, bounded queue and worker pool for event-triggered scripts.
#[derive(Clone)]
pub struct EventPipeline {
    inner: Arc<PipelineInner>,
}

impl EventPipeline {
    /// Spawn `config.workers` worker loops on the current tokio runtime.
    pub fn start(
        config: PipelineConfig,
        stores: PipelineStores,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);
        let inner = Arc::new(PipelineInner {
            router: Router::new(stores.subscriptions, Arc::clone(&handler)),
            scripts: stores.scripts,
            dead_letters: stores.dead_letters,
            handler,
            sender,
            metrics,
            counters: Counters::default(),
            settled: Notify::new(),
            shutdown: CancellationToken::new(),
            attached: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                tokio::spawn(worker_loop(worker, Arc::clone(&inner), Arc::clone(&receiver)))
            })
            .collect();
        inner.track(handles);

        tracing::info!(
            workers,
            queue_capacity = inner.config.queue_capacity,
            "event pipeline started"
        );
        Self { inner }
    }

    /// Route `event` and enqueue a task per accepting subscription.
    ///
    /// Returns the number of tasks enqueued. A full queue drops tasks
    /// instead of waiting.
    pub async fn dispatch(&self, event: DomainEvent) -> Result<usize, PipelineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(PipelineError::Closed);
        }
        inner.counters.events.fetch_add(1, Ordering::Relaxed);

        let routed = inner.router.route(&event).await?;
        inner
            .counters
            .filtered_out
            .fetch_add(routed.filtered_out as u64, Ordering::Relaxed);

        let mut enqueued = 0;
        for task in routed.tasks {
            match inner.enqueue(task) {
                Ok(()) => enqueued += 1,
                Err(PipelineError::QueueFull) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(enqueued)
    }

    /// Subscribe to `bus` and dispatch everything published on it.
    pub fn attach(&self, bus: &EventBus) -> Result<(), PipelineError> {
        if self.inner.attached.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyAttached);
        }
        let mut receiver = bus.subscribe();
        let pipeline = self.clone();
        let shutdown = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(event) => {
                        if let Err(err) = pipeline.dispatch(event).await {
                            tracing::warn!(error = %err, "failed to dispatch event from bus");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bus receiver lagged, events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("event bus listener stopped");
        });
        self.inner.track(vec![handle]);
        Ok(())
    }

    /// Re-enter a dead letter as a fresh task with retry count zero.
    ///
    /// The dead letter stays in place until the replay is delivered.
    pub async fn replay(&self, dead_letter_id: Uuid) -> Result<Uuid, PipelineError> {
        let inner = &self.inner;
        let dead_letter = inner
            .dead_letters
            .get(dead_letter_id)
            .await?
            .ok_or(PipelineError::NotFound(dead_letter_id))?;

        let subscription = dead_letter.task.subscription.clone();
        let task = EventTask::replay(&dead_letter, subscription);
        let task_id = task.id;
        inner.enqueue(task)?;
        tracing::info!(%dead_letter_id, %task_id, "dead letter replayed");
        Ok(task_id)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.inner.counters;
        PipelineStats {
            events: c.events.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            filtered_out: c.filtered_out.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            queue_depth: self.inner.queue_depth(),
            in_flight: c.in_flight.load(Ordering::Acquire),
        }
    }

    /// Wait until no task is in flight; `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.inner.settled.notified();
            if self.inner.counters.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            tokio::select! {
                _ = settled => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.inner.counters.in_flight.load(Ordering::Acquire) == 0;
                }
            }
        }
    }

    /// Stop the workers and the bus listener and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("event pipeline stopped");
    }
}

impl PipelineInner {
    fn track(&self, handles: Vec<JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
    }

    fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn enqueue(&self, task: EventTask) -> Result<(), PipelineError> {
        match self.sender.try_send(task) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
                self.metrics.gauge(metrics::QUEUE_DEPTH, self.queue_depth() as f64);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment(metrics::TASKS_DROPPED);
                tracing::warn!(
                    task_id = %task.id,
                    subscription_id = %task.subscription.id,
                    event_id = %task.event.id,
                    "task queue full, dropping task"
                );
                Err(PipelineError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Closed),
        }
    }

    fn settle(&self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.settled.notify_waiters();
    }

    async fn succeeded(&self, mut task: EventTask) {
        if let Err(err) = task.advance(TaskState::Delivered) {
            tracing::error!(task_id = %task.id, error = %err, "task state corrupted");
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(metrics::TASKS_DELIVERED);

        if let Some(dead_letter_id) = task.replay_of {
            match self.dead_letters.remove(dead_letter_id).await {
                Ok(_) => tracing::info!(%dead_letter_id, "replayed dead letter delivered"),
                Err(err) => {
                    tracing::error!(%dead_letter_id, error = %err, "failed to remove dead letter")
                }
            }
        }
        tracing::debug!(task_id = %task.id, retry_count = task.retry_count, "task delivered");
        self.settle();
    }

    async fn failed(self: &Arc<Self>, mut task: EventTask, failure: DeliveryFailure) {
        if failure.retryable && task.can_retry() {
            if task.advance(TaskState::Retried).and_then(|()| task.requeue()).is_ok() {
                let delay = self.config.retry_delay(task.retry_count);
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment(metrics::TASKS_RETRIED);
                tracing::info!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    max_retries = task.subscription.max_retries,
                    ?delay,
                    error = %failure,
                    "task failed, retrying"
                );
                self.schedule_retry(task, delay);
                return;
            }
        }

        if let Err(err) = task.advance(TaskState::DeadLettered) {
            tracing::error!(task_id = %task.id, error = %err, "task state corrupted");
        }
        let dead_letter = DeadLetter::new(task, failure.kind.clone(), failure.message.clone());
        tracing::warn!(
            dead_letter_id = %dead_letter.id,
            retry_count = dead_letter.task.retry_count,
            error = %failure,
            "task dead-lettered"
        );
        if let Err(err) = self.dead_letters.upsert(dead_letter).await {
            tracing::error!(error = %err, "failed to persist dead letter");
        }
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(metrics::TASKS_DEAD_LETTERED);
        self.settle();
    }

    /// Re-queue from a detached task so a worker never waits on its own queue.
    fn schedule_retry(self: &Arc<Self>, task: EventTask, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task.id;
            let requeued = tokio::select! {
                _ = inner.shutdown.cancelled() => false,
                sent = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    inner.sender.send(task).await.is_ok()
                } => sent,
            };
            if requeued {
                inner.metrics.gauge(metrics::QUEUE_DEPTH, inner.queue_depth() as f64);
            } else {
                tracing::warn!(%task_id, "retry abandoned, pipeline shutting down");
                inner.settle();
            }
        });
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<PipelineInner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<EventTask>>>,
) {
    tracing::debug!(worker, "event worker started");
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = async { receiver.lock().await.recv().await } => next,
        };
        let Some(task) = next else {
            break;
        };
        inner.metrics.gauge(metrics::QUEUE_DEPTH, inner.queue_depth() as f64);

        let snapshot = task.clone();
        let attempt = tokio::spawn(deliver(Arc::clone(&inner), task));
        if let Err(err) = attempt.await {
            tracing::error!(worker, task_id = %snapshot.id, error = %err, "event task panicked");
            let mut task = snapshot;
            if task.state == TaskState::Pending {
                let _ = task.advance(TaskState::Processing);
            }
            inner
                .failed(task, DeliveryFailure::new("panic", err.to_string(), true))
                .await;
        }
    }
    tracing::debug!(worker, "event worker stopped");
}

async fn deliver(inner: Arc<PipelineInner>, mut task: EventTask) {
    if let Err(err) = task.advance(TaskState::Processing) {
        tracing::error!(task_id = %task.id, error = %err, "task dequeued in unexpected state");
        inner.settle();
        return;
    }

    let subscription = &task.subscription;
    let outcome = match inner
        .scripts
        .get(&subscription.tenant_id, &subscription.script_id)
        .await
    {
        Ok(Some(script)) => inner.handler.handle(&task, script).await,
        Ok(None) => Err(DeliveryFailure::new(
            "missing_script",
            format!("script '{}' not found", subscription.script_id),
            false,
        )),
        Err(err) => Err(DeliveryFailure::new("store", err.to_string(), true)),
    };

    match outcome {
        Ok(()) => inner.succeeded(task).await,
        Err(failure) => inner.failed(task, failure).await,
    }
}
