//! Session lifecycle management: spawn, kill, heartbeat, dispose.
//!
//! [`Orchestrator`] owns the session registry and the event bus. All
//! registry mutations go through its methods, and the registry lock is
//! never held across an `.await` or while events are being published.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};

use super::hooks;
use super::registry::{Registry, SessionEntry};
use super::spawner::{self, ExitOutcome, WorkerLaunch, KILL_GRACE};
use super::watchdog::SessionSource;
use super::SessionEvent;
use crate::config::GlobalConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::models::session::{Phase, Session, SessionStatus};
use crate::security::{self, env as env_policy, EnvPolicy, SecuritySettings};
use crate::{AppError, Result};

/// Environment variable carrying the session id.
pub const SESSION_ID_VAR: &str = "SHEPHERD_SESSION_ID";
/// Environment variable carrying the task id.
pub const TASK_ID_VAR: &str = "SHEPHERD_TASK_ID";
/// Environment variable carrying the phase tag.
pub const PHASE_VAR: &str = "SHEPHERD_PHASE";
/// Environment variable naming the file the emitter appends to.
pub const PROGRESS_FILE_VAR: &str = "SHEPHERD_PROGRESS_FILE";

/// Input to [`Orchestrator::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Task identifier; `[A-Za-z0-9_.-]+`.
    pub task_id: String,
    /// Existing project directory.
    pub project_path: PathBuf,
    /// Optional relative directory inside the project.
    pub sub_project_path: Option<PathBuf>,
    /// Prompt passed verbatim to the worker.
    pub prompt: String,
    /// Phase tag.
    pub phase: Phase,
    /// Extra environment entries, applied last.
    pub env: BTreeMap<String, String>,
    /// Overrides the configured security settings.
    pub security: Option<SecuritySettings>,
}

impl SpawnOptions {
    /// Options with the required fields set and everything else defaulted.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            project_path: project_path.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

struct Inner {
    config: GlobalConfig,
    home: Option<PathBuf>,
    kill_grace: Duration,
    registry: Mutex<Registry>,
    events: EventBus<SessionEvent>,
}

/// Spawns, tracks and terminates worker processes.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator confined to `dirs::home_dir()`.
    #[must_use]
    pub fn new(config: GlobalConfig) -> Self {
        Self::with_home(config, dirs::home_dir())
    }

    /// Create an orchestrator with an explicit confinement home directory.
    #[must_use]
    pub fn with_home(config: GlobalConfig, home: Option<PathBuf>) -> Self {
        Self::with_kill_grace(config, home, KILL_GRACE)
    }

    /// Like [`with_home`](Self::with_home), waiting `kill_grace` between
    /// SIGTERM and SIGKILL instead of the default 5 seconds.
    #[must_use]
    pub fn with_kill_grace(
        config: GlobalConfig,
        home: Option<PathBuf>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                home,
                kill_grace,
                registry: Mutex::new(Registry::default()),
                events: EventBus::new("session"),
            }),
        }
    }

    /// Configuration this orchestrator was built with.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.inner.config
    }

    /// Spawn a worker process for `options.task_id`.
    ///
    /// Validation happens before any side effect. Once validation passes the
    /// call always resolves with a session: an OS-level spawn failure is
    /// reported through an [`SessionEvent::Error`] event and the returned
    /// session is in `Error` state.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidTaskId` if the task id is malformed.
    /// - `AppError::PathViolation` if the working directory is invalid or
    ///   outside the allowed roots.
    /// - `AppError::TaskBusy` if a session for the task is still registered,
    ///   including a terminated one whose files are not cleaned up yet.
    /// - `AppError::Config` if the security settings contain a bad pattern.
    pub async fn spawn(&self, options: SpawnOptions) -> Result<Session> {
        let span = info_span!("spawn", task_id = %options.task_id);
        self.spawn_inner(options).instrument(span).await
    }

    async fn spawn_inner(&self, options: SpawnOptions) -> Result<Session> {
        security::validate_task_id(&options.task_id)?;
        let settings = options
            .security
            .clone()
            .unwrap_or_else(|| self.inner.config.security.clone());
        let policy = EnvPolicy::compile(&settings)?;
        let workdir = security::resolve_workdir(
            &options.project_path,
            options.sub_project_path.as_deref(),
            settings.workdir_restricted,
            self.inner.home.as_deref(),
        )?;
        let project_path = options
            .project_path
            .canonicalize()
            .unwrap_or_else(|_| options.project_path.clone());

        let progress_dir = self.inner.config.progress_dir.clone();
        let progress_path = progress_dir.join(format!("{}.jsonl", options.task_id));
        let log_path = progress_dir.join(format!("{}.log", options.task_id));
        let hooks_path = self.inner.config.hooks_path();

        let session = Session::new(
            options.task_id.clone(),
            options.phase,
            progress_path,
            log_path,
            hooks_path,
            workdir,
            project_path,
            options.prompt.clone(),
        );
        let session_id = session.id.clone();
        {
            let mut registry = self.lock();
            if registry.has_task(&options.task_id) {
                return Err(AppError::TaskBusy(format!(
                    "task {} already has a session",
                    options.task_id
                )));
            }
            registry.insert(SessionEntry::new(session));
        }
        info!(session_id, "session registered");

        match self.launch(&session_id, &policy, &options).await {
            Ok(child) => Ok(self.activate(&session_id, child)),
            Err(err) => Ok(self.fail_spawn(&session_id, &err.to_string())),
        }
    }

    async fn launch(
        &self,
        session_id: &str,
        policy: &EnvPolicy,
        options: &SpawnOptions,
    ) -> Result<tokio::process::Child> {
        let session = self.snapshot(session_id).ok_or_else(|| {
            AppError::NotFound(format!("session {session_id} vanished during spawn"))
        })?;

        let prepare = {
            let inner = Arc::clone(&self.inner);
            let session_id = session_id.to_owned();
            let session = session.clone();
            tokio::task::spawn_blocking(move || inner.prepare_files(&session_id, &session))
        };
        prepare
            .await
            .map_err(|err| AppError::Spawn(format!("file preparation task failed: {err}")))??;

        let injected = BTreeMap::from([
            (SESSION_ID_VAR.to_owned(), session.id.clone()),
            (TASK_ID_VAR.to_owned(), session.task_id.clone()),
            (PHASE_VAR.to_owned(), session.phase.as_str().to_owned()),
            (
                PROGRESS_FILE_VAR.to_owned(),
                session.progress_path.to_string_lossy().into_owned(),
            ),
        ]);
        let inherited = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        let env = env_policy::compose(policy, inherited, &injected, &options.env);

        spawner::spawn_worker(&WorkerLaunch {
            worker: &self.inner.config.worker,
            hooks_path: &session.hooks_path,
            prompt: &session.prompt,
            workdir: &session.workdir,
            env: &env,
            log_path: &session.log_path,
        })
    }

    /// Mark the session active, publish `Spawned`/`Active`, then hand the
    /// child to its exit monitor.
    fn activate(&self, session_id: &str, child: tokio::process::Child) -> Session {
        let pid = child.id().unwrap_or(0);
        let (snapshot, kill, activated, kill_pending) = {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(session_id) else {
                // Disposed mid-spawn; `child` is dropped and killed.
                return self.orphan_snapshot(session_id);
            };
            entry.session.pid = pid;
            let activated = entry.session.transition(SessionStatus::Active);
            let kill_pending = std::mem::take(&mut entry.kill_pending);
            (
                entry.session.clone(),
                entry.kill.clone(),
                activated,
                kill_pending,
            )
        };

        info!(session_id, pid, task_id = %snapshot.task_id, "worker spawned");
        let now = Utc::now();
        self.inner.events.publish(&SessionEvent::Spawned {
            session: snapshot.clone(),
            timestamp: now,
        });
        if activated {
            self.inner.events.publish(&SessionEvent::Active {
                session: snapshot.clone(),
                timestamp: now,
            });
        } else if kill_pending {
            // The kill token is already cancelled, so the monitor terminates
            // the process as soon as it starts.
            info!(session_id, task_id = %snapshot.task_id, "session killed");
            self.inner.events.publish(&SessionEvent::Killed {
                session: snapshot.clone(),
                timestamp: now,
            });
        }

        let this = self.clone();
        let id = session_id.to_owned();
        let monitor = spawner::monitor_exit(
            session_id.to_owned(),
            child,
            kill,
            self.inner.kill_grace,
            move |outcome| this.handle_exit(&id, &outcome),
        );
        match self.lock().get_mut(session_id) {
            Some(entry) => entry.monitor = Some(monitor),
            None => drop(monitor),
        }

        snapshot
    }

    fn fail_spawn(&self, session_id: &str, reason: &str) -> Session {
        error!(session_id, reason, "worker spawn failed");
        let (transitioned, kill_pending, session) = {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(session_id) else {
                return self.orphan_snapshot(session_id);
            };
            let transitioned = entry.session.transition(SessionStatus::Error);
            let kill_pending = std::mem::take(&mut entry.kill_pending);
            (transitioned, kill_pending, entry.session.clone())
        };

        if transitioned {
            self.inner.events.publish(&SessionEvent::Error {
                session: session.clone(),
                timestamp: Utc::now(),
                exit_code: None,
                error: Some(reason.to_owned()),
            });
        } else if kill_pending {
            self.inner.events.publish(&SessionEvent::Killed {
                session: session.clone(),
                timestamp: Utc::now(),
            });
        }
        self.cleanup(session_id);
        session
    }

    fn handle_exit(&self, session_id: &str, outcome: &ExitOutcome) {
        let event = {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(session_id) else {
                return;
            };
            entry.session.exit_code = outcome.exit_code;
            let next = if outcome.exit_code == Some(0) {
                SessionStatus::Completed
            } else {
                SessionStatus::Error
            };
            if entry.session.transition(next) {
                let session = entry.session.clone();
                let timestamp = Utc::now();
                Some(match next {
                    SessionStatus::Completed => SessionEvent::Completed {
                        session,
                        timestamp,
                        exit_code: 0,
                    },
                    _ => SessionEvent::Error {
                        session,
                        timestamp,
                        exit_code: outcome.exit_code,
                        error: Some(outcome.reason.clone()),
                    },
                })
            } else {
                None
            }
        };

        // Listeners may still read the progress and log files here.
        if let Some(event) = event {
            self.inner.events.publish(&event);
        }
        self.cleanup(session_id);
    }

    /// Delete the session's files, release its hooks share and drop the row.
    fn cleanup(&self, session_id: &str) {
        let Some(entry) = self.lock().get(session_id).map(|e| e.session.clone()) else {
            return;
        };
        remove_if_present(&entry.progress_path);
        remove_if_present(&entry.log_path);

        let restore = {
            let mut registry = self.lock();
            match registry.remove(session_id) {
                Some(removed) if removed.holds_hooks => registry
                    .hooks
                    .release(&removed.session.hooks_path)
                    .map(|prior| (removed.session.hooks_path, prior)),
                _ => None,
            }
        };
        if let Some((path, prior)) = restore {
            if let Err(err) = hooks::restore(&path, &prior) {
                warn!(session_id, %err, "failed to restore hooks file");
            } else {
                info!(session_id, path = %path.display(), "hooks file restored");
            }
        }
    }

    /// Request termination of a session.
    ///
    /// Marks the session `Killed`, publishes [`SessionEvent::Killed`]
    /// immediately, and lets the exit monitor send SIGTERM followed by
    /// SIGKILL after the grace period (5 seconds by default). A session
    /// that is still spawning publishes `Killed` right after `Spawned`
    /// instead. Returns `false` without doing anything for unknown or
    /// already-terminal sessions.
    pub fn kill(&self, session_id: &str) -> bool {
        let snapshot = {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(session_id) else {
                return false;
            };
            let spawning = entry.session.status == SessionStatus::Spawning;
            if !entry.session.transition(SessionStatus::Killed) {
                return false;
            }
            entry.kill.cancel();
            if spawning {
                entry.kill_pending = true;
                None
            } else {
                Some(entry.session.clone())
            }
        };
        let Some(snapshot) = snapshot else {
            info!(session_id, "session killed while spawning");
            return true;
        };

        info!(session_id, task_id = %snapshot.task_id, "session killed");
        self.inner.events.publish(&SessionEvent::Killed {
            session: snapshot,
            timestamp: Utc::now(),
        });
        true
    }

    /// Record progress for the active session running `task_id`.
    ///
    /// Updates the heartbeat timestamp (and the phase, when given) and
    /// publishes [`SessionEvent::Heartbeat`]. Returns `None` when no active
    /// session runs the task.
    pub fn record_heartbeat(&self, task_id: &str, phase: Option<Phase>) -> Option<Session> {
        let snapshot = {
            let mut registry = self.lock();
            let entry = registry.active_by_task_mut(task_id)?;
            entry.session.last_heartbeat = Utc::now();
            if let Some(phase) = phase {
                entry.session.phase = phase;
            }
            entry.session.clone()
        };
        self.inner.events.publish(&SessionEvent::Heartbeat {
            timestamp: snapshot.last_heartbeat,
            session: snapshot.clone(),
        });
        Some(snapshot)
    }

    /// Session by id, while it is registered.
    #[must_use]
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.snapshot(session_id)
    }

    /// Active (non-terminal) session running `task_id`.
    #[must_use]
    pub fn get_session_by_task_id(&self, task_id: &str) -> Option<Session> {
        self.lock()
            .active_by_task_mut(task_id)
            .map(|e| e.session.clone())
    }

    /// Every non-terminal session, oldest first.
    #[must_use]
    pub fn list_active_sessions(&self) -> Vec<Session> {
        self.lock().active()
    }

    /// Register a lifecycle listener.
    pub fn on_session_event<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Remove a lifecycle listener.
    pub fn off_session_event(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Kill every session, wait for the processes to go, then clear all state.
    ///
    /// Monitors still running after the grace period are aborted (which
    /// kills their process through `kill_on_drop`), and every hooks file is
    /// restored.
    pub async fn dispose(&self) {
        self.dispose_inner().instrument(info_span!("dispose")).await;
    }

    async fn dispose_inner(&self) {
        let ids: Vec<String> = self
            .list_active_sessions()
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.kill(id);
        }

        let monitors: Vec<_> = {
            let mut registry = self.lock();
            ids.iter()
                .filter_map(|id| registry.get_mut(id).and_then(|e| e.monitor.take()))
                .collect()
        };
        let deadline = self.inner.kill_grace + Duration::from_secs(1);
        for monitor in monitors {
            let abort = monitor.abort_handle();
            if tokio::time::timeout(deadline, monitor).await.is_err() {
                abort.abort();
            }
        }

        let (leftovers, shares) = {
            let mut registry = self.lock();
            (registry.drain(), registry.hooks.drain())
        };
        for entry in leftovers {
            if let Some(monitor) = entry.monitor {
                monitor.abort();
            }
            remove_if_present(&entry.session.progress_path);
            remove_if_present(&entry.session.log_path);
        }
        for (path, prior) in shares {
            if let Err(err) = hooks::restore(&path, &prior) {
                warn!(path = %path.display(), %err, "failed to restore hooks file on dispose");
            }
        }
        self.inner.events.clear();
        info!(sessions = ids.len(), "orchestrator disposed");
    }

    fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).map(|e| e.session.clone())
    }

    fn orphan_snapshot(&self, session_id: &str) -> Session {
        warn!(session_id, "session disappeared from registry during spawn");
        let mut session = Session::new(
            String::new(),
            Phase::default(),
            PathBuf::new(),
            PathBuf::new(),
            PathBuf::new(),
            PathBuf::new(),
            PathBuf::new(),
            String::new(),
        );
        session.id = session_id.to_owned();
        session.status = SessionStatus::Killed;
        session
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the progress directory, drop a stale progress file and take a
    /// share of the hooks file. Blocking; runs on the blocking pool.
    fn prepare_files(&self, session_id: &str, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.config.progress_dir)?;
        remove_if_present(&session.progress_path);

        let hooks_text = hooks::render_text(&self.config.worker.emitter)?;
        let mut registry = self.lock();
        if registry.get(session_id).is_none() {
            return Err(AppError::NotFound(format!(
                "session {session_id} vanished during spawn"
            )));
        }
        let prior = registry.hooks.acquire(&session.hooks_path, &hooks_text)?;
        if let Some(entry) = registry.get_mut(session_id) {
            entry.session.hooks_prior = prior;
            entry.holds_hooks = true;
        }
        Ok(())
    }
}

impl SessionSource for Orchestrator {
    fn active_sessions(&self) -> Vec<Session> {
        self.list_active_sessions()
    }

    fn is_alive(&self, pid: u32) -> bool {
        spawner::is_alive(pid)
    }
}

/// Remove a file, treating "already gone" as success.
fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove session file"),
    }
}
