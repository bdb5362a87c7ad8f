use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::PipelineError;
use super::{DeadLetter, DomainEvent, Subscription};

/// Lifecycle of an [`EventTask`].
///
/// ```text
/// Pending -> Processing -> Delivered
///                       -> Retried -> Pending
///                       -> DeadLettered
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Delivered,
    Retried,
    DeadLettered,
}

impl TaskState {
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Delivered)
                | (Processing, Retried)
                | (Processing, DeadLettered)
                | (Retried, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Delivered | TaskState::DeadLettered)
    }
}

/// One delivery of one event to one subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventTask {
    pub id: Uuid,
    pub subscription: Subscription,
    pub event: DomainEvent,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub state: TaskState,
    /// Dead letter this task was replayed from.
    pub replay_of: Option<Uuid>,
}

impl EventTask {
    pub fn new(subscription: Subscription, event: DomainEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription,
            event,
            enqueued_at: Utc::now(),
            retry_count: 0,
            state: TaskState::Pending,
            replay_of: None,
        }
    }

    /// A fresh attempt at a dead-lettered delivery.
    pub fn replay(dead_letter: &DeadLetter, subscription: Subscription) -> Self {
        Self {
            replay_of: Some(dead_letter.id),
            ..Self::new(subscription, dead_letter.task.event.clone())
        }
    }

    pub fn advance(&mut self, next: TaskState) -> Result<(), PipelineError> {
        if !self.state.can_advance_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.subscription.max_retries
    }

    /// Move a `Retried` task back to `Pending` with the retry count bumped.
    pub fn requeue(&mut self) -> Result<(), PipelineError> {
        self.advance(TaskState::Pending)?;
        self.retry_count += 1;
        self.enqueued_at = Utc::now();
        Ok(())
    }

    /// Key of the dead letter this delivery maps to; replays share the original's key.
    pub fn origin_id(&self) -> Uuid {
        self.replay_of.unwrap_or(self.id)
    }
}
