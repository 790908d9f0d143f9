//! Dead letter handling for terminally failed tasks.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::task::{Task, TaskId};

/// Why a task ended in the dead letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Retry limit surpassed.
    Exhausted,
    /// The handler refused the task outright.
    Rejected,
}

/// Dead letter entry for a failed task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Task ID.
    pub task_id: TaskId,
    /// Queue the task belonged to.
    pub queue: String,
    /// The failed payload.
    #[serde(skip)]
    pub payload: Bytes,
    /// Number of failed attempts.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Why the task was given up on.
    pub reason: FailureReason,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Create a new dead letter entry.
    #[must_use]
    pub fn new(task: &Task, reason: FailureReason, error: String) -> Self {
        Self {
            task_id: task.id.clone(),
            queue: task.queue.clone(),
            payload: task.payload.clone(),
            attempts: task.attempts,
            last_error: error,
            reason,
            failed_at: Utc::now(),
        }
    }
}

/// Receives every terminally failed task.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Record one failure.
    async fn record(&self, entry: DeadLetterEntry);
}

/// Bounded in-memory dead letter queue; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct MemoryDeadLetterQueue {
    capacity: usize,
    entries: RwLock<VecDeque<DeadLetterEntry>>,
}

impl MemoryDeadLetterQueue {
    /// Create a queue that keeps at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Entries, oldest first.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Number of entries held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no entries are held.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterQueue {
    async fn record(&self, entry: DeadLetterEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}
