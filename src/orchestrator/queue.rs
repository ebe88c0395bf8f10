//! Priority admission queue gating concurrent sessions.
//!
//! Pending entries are ordered by priority (highest first), then by
//! enqueue time, then by insertion order. Every mutation publishes a
//! [`QueueChanged`] summary after the internal lock is released.

use std::cmp::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::events::{EventBus, SubscriptionId};
use crate::models::queue::{QueueChanged, QueueStatus, QueuedAgent};
use crate::Result;

#[derive(Debug)]
struct Pending {
    seq: u64,
    agent: QueuedAgent,
}

#[derive(Debug)]
struct QueueState {
    pending: Vec<Pending>,
    running: Vec<String>,
    max_concurrent: usize,
    next_seq: u64,
}

impl QueueState {
    fn changed(&self) -> QueueChanged {
        QueueChanged {
            pending: self.pending.len(),
            running: self.running.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    fn push(&mut self, agent: QueuedAgent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending { seq, agent });
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.running.iter().any(|t| t == task_id)
    }

    fn has_room(&self) -> bool {
        self.running.len() < self.max_concurrent
    }
}

/// Outcome of [`AdmissionQueue::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the task is now in the running set.
    Started,
    /// No slot was free; the task waits under this id.
    Queued(String),
    /// The task is already running or waiting.
    Duplicate,
}

/// Dequeue order: priority desc, enqueue time asc, insertion asc.
fn rank(a: &Pending, b: &Pending) -> Ordering {
    b.agent
        .priority
        .cmp(&a.agent.priority)
        .then(a.agent.enqueued_at.cmp(&b.agent.enqueued_at))
        .then(a.seq.cmp(&b.seq))
}

/// Waiting list plus the set of running task ids.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    changes: EventBus<QueueChanged>,
}

impl AdmissionQueue {
    /// Empty queue admitting up to `max_concurrent` sessions (at least 1).
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                running: Vec::new(),
                max_concurrent: max_concurrent.max(1),
                next_seq: 0,
            }),
            changes: EventBus::new("queue"),
        }
    }

    /// Add a pending entry and return its generated id.
    pub fn enqueue(&self, task_id: &str, project_id: &str, priority: i32) -> String {
        let agent = QueuedAgent::new(task_id.to_owned(), project_id.to_owned(), priority);
        let id = agent.id.clone();
        let changed = {
            let mut state = self.lock();
            state.push(agent);
            state.changed()
        };
        info!(queued_id = %id, task_id, priority, pending = changed.pending, "task enqueued");
        self.changes.publish(&changed);
        id
    }

    /// Start `task_id` if a slot is free, otherwise enqueue it, in one step.
    ///
    /// A task id that is already running or waiting is refused, so every
    /// running task holds exactly one slot.
    pub fn admit(&self, task_id: &str, project_id: &str, priority: i32) -> Admission {
        let (admission, changed) = {
            let mut state = self.lock();
            let waiting = state.pending.iter().any(|p| p.agent.task_id == task_id);
            if waiting || state.is_running(task_id) {
                return Admission::Duplicate;
            }
            let admission = if state.has_room() {
                state.running.push(task_id.to_owned());
                Admission::Started
            } else {
                let agent =
                    QueuedAgent::new(task_id.to_owned(), project_id.to_owned(), priority);
                let id = agent.id.clone();
                state.push(agent);
                Admission::Queued(id)
            };
            (admission, state.changed())
        };
        info!(task_id, priority, admission = ?admission, pending = changed.pending, "task admitted");
        self.changes.publish(&changed);
        admission
    }

    /// Remove and return the highest-ranked pending entry.
    pub fn dequeue(&self) -> Option<QueuedAgent> {
        let (agent, changed) = {
            let mut state = self.lock();
            let index = state
                .pending
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| rank(a, b))
                .map(|(index, _)| index)?;
            let agent = state.pending.remove(index).agent;
            (agent, state.changed())
        };
        debug!(queued_id = %agent.id, task_id = %agent.task_id, "task dequeued");
        self.changes.publish(&changed);
        Some(agent)
    }

    /// Drop a pending entry by id. Returns `false` if it was not queued.
    pub fn remove(&self, id: &str) -> bool {
        let changed = {
            let mut state = self.lock();
            let before = state.pending.len();
            state.pending.retain(|p| p.agent.id != id);
            if state.pending.len() == before {
                return false;
            }
            state.changed()
        };
        self.changes.publish(&changed);
        true
    }

    /// Whether another session may start right now.
    #[must_use]
    pub fn can_start_immediately(&self) -> bool {
        self.lock().has_room()
    }

    /// Mark a task as running.
    pub fn add_running(&self, task_id: &str) {
        let changed = {
            let mut state = self.lock();
            if !state.is_running(task_id) {
                state.running.push(task_id.to_owned());
            }
            state.changed()
        };
        self.changes.publish(&changed);
    }

    /// Mark `task_id` running if there is capacity and it is not running
    /// already, atomically.
    pub fn try_start(&self, task_id: &str) -> bool {
        let changed = {
            let mut state = self.lock();
            if !state.has_room() || state.is_running(task_id) {
                return false;
            }
            state.running.push(task_id.to_owned());
            state.changed()
        };
        self.changes.publish(&changed);
        true
    }

    /// Unmark a running task. Returns `false` if it was not running.
    pub fn remove_running(&self, task_id: &str) -> bool {
        let changed = {
            let mut state = self.lock();
            let before = state.running.len();
            state.running.retain(|t| t != task_id);
            if state.running.len() == before {
                return false;
            }
            state.changed()
        };
        self.changes.publish(&changed);
        true
    }

    /// Whether `task_id` is in the running set.
    #[must_use]
    pub fn is_running(&self, task_id: &str) -> bool {
        self.lock().is_running(task_id)
    }

    /// Change the concurrency budget; values below 1 are clamped to 1.
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let changed = {
            let mut state = self.lock();
            state.max_concurrent = max_concurrent.max(1);
            state.changed()
        };
        info!(max_concurrent = changed.max_concurrent, "concurrency budget updated");
        self.changes.publish(&changed);
    }

    /// Snapshot of pending entries (in dequeue order) and running tasks.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        let mut pending: Vec<&Pending> = state.pending.iter().collect();
        pending.sort_by(|a, b| rank(a, b));
        QueueStatus {
            pending: pending.into_iter().map(|p| p.agent.clone()).collect(),
            running: state.running.clone(),
            max_concurrent: state.max_concurrent,
        }
    }

    /// Register a listener for queue changes.
    pub fn on_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&QueueChanged) -> Result<()> + Send + Sync + 'static,
    {
        self.changes.subscribe(listener)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
