//! Authoritative in-memory table of sessions.
//!
//! Owned exclusively by the [`Orchestrator`](super::Orchestrator); callers
//! never receive references into it, only cloned [`Session`] snapshots.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::hooks::HookLedger;
use crate::models::session::Session;

/// Registry row for one session.
#[derive(Debug)]
pub struct SessionEntry {
    /// Current session record.
    pub session: Session,
    /// Cancelled to ask the exit monitor to terminate the process.
    pub kill: CancellationToken,
    /// Exit monitor task, once started.
    pub monitor: Option<JoinHandle<()>>,
    /// Whether this session holds a share of its hooks file.
    pub holds_hooks: bool,
    /// Killed while still spawning; `Killed` is published once `Spawned` is.
    pub kill_pending: bool,
}

impl SessionEntry {
    /// Row for a freshly registered session.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            kill: CancellationToken::new(),
            monitor: None,
            holds_hooks: false,
            kill_pending: false,
        }
    }
}

/// Sessions keyed by id plus the hooks share ledger.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<String, SessionEntry>,
    /// Share counts for hooks files used by registered sessions.
    pub hooks: HookLedger,
}

impl Registry {
    /// Add a row.
    pub fn insert(&mut self, entry: SessionEntry) {
        self.sessions.insert(entry.session.id.clone(), entry);
    }

    /// Row by session id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    /// Mutable row by session id.
    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    /// Whether any row, terminal ones awaiting cleanup included, runs
    /// `task_id`. Such a row still owns the task's progress and log files.
    #[must_use]
    pub fn has_task(&self, task_id: &str) -> bool {
        self.sessions.values().any(|e| e.session.task_id == task_id)
    }

    /// Non-terminal row running `task_id`.
    pub fn active_by_task_mut(&mut self, task_id: &str) -> Option<&mut SessionEntry> {
        self.sessions
            .values_mut()
            .find(|e| e.session.task_id == task_id && !e.session.status.is_terminal())
    }

    /// Snapshots of every non-terminal session, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .values()
            .filter(|e| !e.session.status.is_terminal())
            .map(|e| e.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.spawned_at);
        sessions
    }

    /// Remove and return a row.
    pub fn remove(&mut self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.remove(session_id)
    }

    /// Remove every row.
    pub fn drain(&mut self) -> Vec<SessionEntry> {
        self.sessions.drain().map(|(_, entry)| entry).collect()
    }
}
