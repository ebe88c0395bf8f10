//! Worker orchestration modules.
//!
//! Covers process spawning and termination, the session registry and its
//! shared hooks files, admission control, health monitoring, and the
//! supervisor that wires them together.

pub mod hooks;
pub mod queue;
pub mod registry;
pub mod session_manager;
pub mod spawner;
pub mod supervisor;
pub mod watchdog;

use chrono::{DateTime, Utc};

use crate::models::session::Session;

pub use queue::{Admission, AdmissionQueue};
pub use session_manager::{Orchestrator, SpawnOptions};
pub use supervisor::Supervisor;
pub use watchdog::{SessionSource, Watchdog};

/// Lifecycle events published by the [`Orchestrator`].
///
/// For a single session `Spawned` is always published before any terminal
/// event, and terminal events are published before the session's progress
/// and log files are deleted.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The worker process was created.
    Spawned {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// The session is registered as running.
    Active {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// The worker exited with code 0.
    Completed {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Always 0.
        exit_code: i32,
    },
    /// The worker failed to start or exited unsuccessfully.
    Error {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
        /// Exit code, absent for spawn failures and signal deaths.
        exit_code: Option<i32>,
        /// Failure description.
        error: Option<String>,
    },
    /// Termination was requested; published before the process is gone.
    Killed {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
    /// The worker reported progress.
    Heartbeat {
        /// Session snapshot.
        session: Session,
        /// Event time.
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Session snapshot carried by the event.
    #[must_use]
    pub fn session(&self) -> &Session {
        match self {
            Self::Spawned { session, .. }
            | Self::Active { session, .. }
            | Self::Completed { session, .. }
            | Self::Error { session, .. }
            | Self::Killed { session, .. }
            | Self::Heartbeat { session, .. } => session,
        }
    }

    /// Event time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Spawned { timestamp, .. }
            | Self::Active { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Killed { timestamp, .. }
            | Self::Heartbeat { timestamp, .. } => *timestamp,
        }
    }

    /// Exit code, when the event carries one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code, .. } => Some(*exit_code),
            Self::Error { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Spawned { .. } => "spawned",
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Killed { .. } => "killed",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Whether the event ends the session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Error { .. } | Self::Killed { .. }
        )
    }
}
