//! Session health watchdog.
//!
//! Polls active sessions on an interval and classifies each one:
//!
//! 1. process gone → `dead`
//! 2. heartbeat older than the stale threshold → `stale`
//! 3. heartbeat older than the warning threshold → `warning`
//! 4. otherwise healthy, and any earlier alerts for the session are cleared
//!
//! Each (session, kind) pair alerts at most once until it is cleared.
//! Lifecycle events add two more alerts: authentication failures spotted
//! in the log of a failed session, and context overflow (exit code 2).

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Orchestrator, SessionEvent};
use crate::config::WatchdogConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::models::alert::{AlertKind, SuggestedAction, WatchdogAlert};
use crate::models::session::Session;
use crate::notifier::AlertNotifier;
use crate::Result;

/// Exit code a worker uses when its context window overflowed.
pub const CONTEXT_OVERFLOW_EXIT_CODE: i32 = 2;

/// Lower-case log fragments that indicate the worker could not authenticate.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "authentication_error",
    "invalid api key",
    "invalid x-api-key",
    "oauth token has expired",
    "please run /login",
    "401 unauthorized",
];

/// Read-only view of the sessions the watchdog supervises.
pub trait SessionSource: Send + Sync {
    /// Every non-terminal session.
    fn active_sessions(&self) -> Vec<Session>;

    /// Whether the process `pid` still exists.
    fn is_alive(&self, pid: u32) -> bool;
}

struct Inner {
    source: Arc<dyn SessionSource>,
    config: WatchdogConfig,
    notifier: Option<Arc<dyn AlertNotifier>>,
    alerted: Mutex<HashSet<(String, AlertKind)>>,
    alerts: EventBus<WatchdogAlert>,
}

/// Heartbeat and liveness monitor with de-duplicated alerts.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl Watchdog {
    /// Create a watchdog over `source`. Escalated alerts (`dead`, `stale`)
    /// are also handed to `notifier` when one is given.
    #[must_use]
    pub fn new(
        source: Arc<dyn SessionSource>,
        config: WatchdogConfig,
        notifier: Option<Arc<dyn AlertNotifier>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                notifier,
                alerted: Mutex::new(HashSet::new()),
                alerts: EventBus::new("watchdog"),
            }),
        }
    }

    /// Register an alert listener.
    pub fn on_alert<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&WatchdogAlert) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.alerts.subscribe(listener)
    }

    /// Run one classification pass at `now` and return the alerts raised.
    pub fn poll_at(&self, now: DateTime<Utc>) -> Vec<WatchdogAlert> {
        let sessions = self.inner.source.active_sessions();
        let mut raised = Vec::new();
        {
            let mut alerted = self.lock();
            alerted.retain(|(id, _)| sessions.iter().any(|s| &s.id == id));

            for session in &sessions {
                // Still spawning; there is no process to probe yet.
                if session.pid == 0 {
                    continue;
                }
                let age = session.heartbeat_age(now);
                let age_secs = age.as_secs();

                let candidate = if !self.inner.source.is_alive(session.pid) {
                    Some((
                        AlertKind::Dead,
                        SuggestedAction::RestartCheckpoint,
                        format!(
                            "worker process {} for task {} is no longer running",
                            session.pid, session.task_id
                        ),
                    ))
                } else if age > self.inner.config.stale_after() {
                    Some((
                        AlertKind::Stale,
                        SuggestedAction::RestartCheckpoint,
                        format!(
                            "no progress from task {} for {age_secs}s",
                            session.task_id
                        ),
                    ))
                } else if age > self.inner.config.warn_after() {
                    Some((
                        AlertKind::Warning,
                        SuggestedAction::MarkError,
                        format!(
                            "task {} has been quiet for {age_secs}s",
                            session.task_id
                        ),
                    ))
                } else {
                    None
                };

                match candidate {
                    Some((kind, action, message)) => {
                        if alerted.insert((session.id.clone(), kind)) {
                            raised.push(WatchdogAlert::new(
                                kind,
                                session.id.clone(),
                                session.task_id.clone(),
                                message,
                                action,
                                now,
                            ));
                        }
                    }
                    None => alerted.retain(|(id, _)| id != &session.id),
                }
            }
        }

        for alert in &raised {
            self.dispatch(alert);
        }
        debug!(sessions = sessions.len(), raised = raised.len(), "watchdog poll complete");
        raised
    }

    /// Subscribe to `orchestrator` lifecycle events.
    ///
    /// Terminal events clear the session's alert state. An `error` event
    /// additionally raises `auth_failed` when the session log shows an
    /// authentication failure, and a context overflow alert when the exit
    /// code is 2 and `auto_restart_on_overflow` is set.
    pub fn attach(&self, orchestrator: &Orchestrator) -> SubscriptionId {
        let this = self.clone();
        orchestrator.on_session_event(move |event| {
            this.handle_session_event(event);
            Ok(())
        })
    }

    /// Handle one lifecycle event. Exposed for callers wiring their own bus.
    pub fn handle_session_event(&self, event: &SessionEvent) {
        if !event.is_terminal() {
            return;
        }
        let session = event.session();
        self.clear(&session.id);

        let SessionEvent::Error { exit_code, .. } = event else {
            return;
        };
        let now = Utc::now();
        if log_shows_auth_failure(&session.log_path) {
            self.raise(WatchdogAlert::new(
                AlertKind::AuthFailed,
                session.id.clone(),
                session.task_id.clone(),
                format!("task {} failed to authenticate", session.task_id),
                SuggestedAction::Reauthenticate,
                now,
            ));
        }
        if *exit_code == Some(CONTEXT_OVERFLOW_EXIT_CODE) && self.inner.config.auto_restart_on_overflow
        {
            self.raise(WatchdogAlert::new(
                AlertKind::Dead,
                session.id.clone(),
                session.task_id.clone(),
                format!(
                    "task {} exited on context overflow; restart from checkpoint",
                    session.task_id
                ),
                SuggestedAction::RestartCheckpoint,
                now,
            ));
        }
    }

    /// Forget alert state for a session.
    pub fn clear(&self, session_id: &str) {
        self.lock().retain(|(id, _)| id != session_id);
    }

    /// Poll every `poll_interval` until `cancel` fires.
    #[must_use]
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let interval = self.inner.config.poll_interval();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "watchdog started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("watchdog shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
                this.poll_at(Utc::now());
            }
        })
    }

    fn raise(&self, alert: WatchdogAlert) {
        if self.lock().insert((alert.session_id.clone(), alert.kind)) {
            self.dispatch(&alert);
        }
    }

    fn dispatch(&self, alert: &WatchdogAlert) {
        warn!(
            kind = %alert.kind,
            session_id = %alert.session_id,
            task_id = %alert.task_id,
            message = %alert.message,
            "watchdog alert"
        );
        self.inner.alerts.publish(alert);
        if !alert.kind.is_escalated() {
            return;
        }
        if let Some(notifier) = &self.inner.notifier {
            if let Err(err) = notifier.notify(alert) {
                warn!(%err, session_id = %alert.session_id, "failed to forward alert");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(String, AlertKind)>> {
        self.inner
            .alerted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scan a session log for authentication failure markers.
fn log_shows_auth_failure(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).to_lowercase();
            AUTH_FAILURE_MARKERS.iter().any(|m| text.contains(m))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read session log");
            false
        }
    }
}
