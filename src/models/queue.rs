//! Admission queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pending admission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueuedAgent {
    /// Generated queue entry identifier.
    pub id: String,
    /// Task the entry will spawn.
    pub task_id: String,
    /// Project the task belongs to.
    pub project_id: String,
    /// Higher runs first.
    pub priority: i32,
    /// Enqueue timestamp; FIFO tie-break within a priority.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedAgent {
    /// Construct an entry stamped with the current time.
    #[must_use]
    pub fn new(task_id: String, project_id: String, priority: i32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            project_id,
            priority,
            enqueued_at: Utc::now(),
        }
    }
}

/// Snapshot of the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueStatus {
    /// Waiting entries in dequeue order.
    pub pending: Vec<QueuedAgent>,
    /// Task ids currently running.
    pub running: Vec<String>,
    /// Concurrency bound.
    pub max_concurrent: usize,
}

/// Notification published after every queue mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueChanged {
    /// Number of waiting entries.
    pub pending: usize,
    /// Number of running tasks.
    pub running: usize,
    /// Concurrency bound.
    pub max_concurrent: usize,
}
