//! Glue between the admission queue, the orchestrator and progress events.
//!
//! Submissions start immediately while the queue has capacity and wait
//! otherwise. Whenever a running task reaches a terminal state its slot is
//! freed and the queue is drained into new spawns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use super::{Admission, AdmissionQueue, Orchestrator, SessionEvent, SpawnOptions};
use crate::events::SubscriptionId;
use crate::models::session::{Phase, Session};
use crate::progress::ProgressWatcher;
use crate::{security, AppError, Result};

/// Outcome of [`Supervisor::submit`].
#[derive(Debug, Clone)]
pub enum Submission {
    /// Capacity was available and the worker was spawned.
    Spawned(Session),
    /// The task waits in the queue under this id.
    Queued(String),
}

struct Inner {
    orchestrator: Orchestrator,
    queue: Arc<AdmissionQueue>,
    waiting: Mutex<HashMap<String, SpawnOptions>>,
    draining: tokio::sync::Mutex<()>,
}

/// Spawn-or-enqueue front end with automatic queue draining.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Wire `orchestrator` and `queue` together.
    #[must_use]
    pub fn new(orchestrator: Orchestrator, queue: Arc<AdmissionQueue>) -> Self {
        let inner = Arc::new(Inner {
            orchestrator,
            queue,
            waiting: Mutex::new(HashMap::new()),
            draining: tokio::sync::Mutex::new(()),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.orchestrator.on_session_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                Supervisor { inner }.on_session_event(event);
            }
            Ok(())
        });

        Self { inner }
    }

    /// The admission queue being drained.
    #[must_use]
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.inner.queue
    }

    /// Start `options` now if there is capacity, otherwise queue it.
    ///
    /// # Errors
    ///
    /// - The validation error from [`Orchestrator::spawn`]; invalid task ids
    ///   are rejected before anything is queued.
    /// - `AppError::TaskBusy` if the task is already running or waiting.
    pub async fn submit(&self, options: SpawnOptions, priority: i32) -> Result<Submission> {
        security::validate_task_id(&options.task_id)?;
        let task_id = options.task_id.clone();
        let project_id = options.project_path.to_string_lossy().into_owned();

        {
            // Held across `admit` so a drain never dequeues an entry whose
            // options are not stored yet.
            let mut waiting = self.waiting();
            match self.inner.queue.admit(&task_id, &project_id, priority) {
                Admission::Started => {}
                Admission::Queued(id) => {
                    waiting.insert(id.clone(), options);
                    return Ok(Submission::Queued(id));
                }
                Admission::Duplicate => {
                    return Err(AppError::TaskBusy(format!(
                        "task {task_id} is already running or queued"
                    )));
                }
            }
        }

        match self.inner.orchestrator.spawn(options).await {
            Ok(session) => Ok(Submission::Spawned(session)),
            Err(err) => {
                self.inner.queue.remove_running(&task_id);
                Err(err)
            }
        }
    }

    /// Withdraw a queued submission. Returns `false` if it is not waiting.
    pub fn withdraw(&self, queued_id: &str) -> bool {
        self.waiting().remove(queued_id);
        self.inner.queue.remove(queued_id)
    }

    /// Spawn queued submissions while capacity remains. Returns how many
    /// were started.
    pub async fn drain(&self) -> usize {
        let _draining = self.inner.draining.lock().await;
        let mut started = 0;
        while self.inner.queue.can_start_immediately() {
            let Some(agent) = self.inner.queue.dequeue() else {
                break;
            };
            let Some(options) = self.waiting().remove(&agent.id) else {
                warn!(queued_id = %agent.id, "queued entry has no submission, skipping");
                continue;
            };
            if !self.inner.queue.try_start(&agent.task_id) {
                // Lost the slot to a concurrent submit; put it back.
                let id = self
                    .inner
                    .queue
                    .enqueue(&agent.task_id, &agent.project_id, agent.priority);
                self.waiting().insert(id, options);
                break;
            }

            info!(task_id = %agent.task_id, "starting queued task");
            match self.inner.orchestrator.spawn(options).await {
                Ok(_) => started += 1,
                Err(err) => {
                    warn!(task_id = %agent.task_id, %err, "queued task rejected");
                    self.inner.queue.remove_running(&agent.task_id);
                }
            }
        }
        started
    }

    /// Turn every delivered progress batch into a heartbeat on the matching
    /// session, updating its phase when the batch reports a phase change.
    pub fn attach_progress(&self, watcher: &ProgressWatcher) -> SubscriptionId {
        let orchestrator = self.inner.orchestrator.clone();
        watcher.on_batch(move |batch| {
            let phase = batch.latest_phase().and_then(|p| p.parse::<Phase>().ok());
            if orchestrator
                .record_heartbeat(&batch.task_id, phase)
                .is_none()
            {
                debug!(task_id = %batch.task_id, "progress for unknown task");
            }
            Ok(())
        })
    }

    fn on_session_event(&self, event: &SessionEvent) {
        if !event.is_terminal() {
            return;
        }
        let task_id = &event.session().task_id;
        if !self.inner.queue.remove_running(task_id) {
            return;
        }
        info!(task_id, status = event.name(), "slot freed");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(task_id, "no runtime available to drain the queue");
            return;
        };
        let this = self.clone();
        handle.spawn(async move {
            this.drain().await;
        });
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<String, SpawnOptions>> {
        self.inner
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
