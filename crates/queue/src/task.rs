//! Task definitions.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Task identifier returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an existing ID string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work bound to one queue.
#[derive(Debug, Clone)]
pub struct Task {
    /// Task ID.
    pub id: TaskId,
    /// Queue the task belongs to.
    pub queue: String,
    /// Opaque payload handed to the handler.
    pub payload: Bytes,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Handler invocations so far, including cancelled and rejected ones.
    pub executions: u32,
    /// Wall-clock submission time.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be dispatched.
    pub next_eligible: Instant,
}

impl Task {
    /// Create a task eligible at `next_eligible`.
    pub fn new(id: TaskId, queue: impl Into<String>, payload: Bytes, next_eligible: Instant) -> Self {
        Self {
            id,
            queue: queue.into(),
            payload,
            attempts: 0,
            executions: 0,
            enqueued_at: Utc::now(),
            next_eligible,
        }
    }

    /// Whether the task may be dispatched at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible <= now
    }
}

/// Live state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its eligibility time, a rate token or a permit.
    Pending,
    /// A handler invocation is in flight.
    Dispatching,
}

/// Point-in-time view of a live task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub queue: String,
    pub state: TaskState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Milliseconds until the task becomes eligible; zero if it already is.
    pub eligible_in_ms: u64,
}

impl TaskSnapshot {
    pub(crate) fn of(task: &Task, state: TaskState, now: Instant) -> Self {
        Self {
            id: task.id.clone(),
            queue: task.queue.clone(),
            state,
            attempts: task.attempts,
            enqueued_at: task.enqueued_at,
            eligible_in_ms: task.next_eligible.saturating_duration_since(now).as_millis() as u64,
        }
    }
}
