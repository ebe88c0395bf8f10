//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Lifecycle status for a worker session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered; the OS process does not exist yet.
    Spawning,
    /// Process running.
    Active,
    /// Process exited with code 0.
    Completed,
    /// Process failed to start or exited non-zero.
    Error,
    /// Termination requested by the operator.
    Killed,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Killed)
    }
}

/// Execution phase tag. Opaque to the orchestrator; forwarded to the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Producing a plan.
    Planning,
    /// Carrying out the plan.
    #[default]
    Executing,
    /// Verifying the result.
    Qa,
}

impl Phase {
    /// Wire name of the phase.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Qa => "qa",
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "qa" => Ok(Self::Qa),
            other => Err(AppError::Parse(format!("unknown phase: {other}"))),
        }
    }
}

/// Content of the hooks file before the orchestrator overwrote it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "state", content = "content")]
pub enum PriorConfig {
    /// The file did not exist; restoring means deleting it.
    #[default]
    Missing,
    /// The file existed with this content.
    Present(String),
}

/// One tracked attempt to run a worker process for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Logical task identifier.
    pub task_id: String,
    /// OS process id; 0 until the process exists.
    pub pid: u32,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Execution phase tag.
    pub phase: Phase,
    /// When the session was registered.
    pub spawned_at: DateTime<Utc>,
    /// Most recent sign of progress.
    pub last_heartbeat: DateTime<Utc>,
    /// `<progress_dir>/<task>.jsonl`.
    pub progress_path: PathBuf,
    /// `<progress_dir>/<task>.log`.
    pub log_path: PathBuf,
    /// Shared hooks file handed to the worker.
    pub hooks_path: PathBuf,
    /// Hooks file content to restore once no session needs it.
    pub hooks_prior: PriorConfig,
    /// Process exit code once known.
    pub exit_code: Option<i32>,
    /// Directory the worker runs in.
    pub workdir: PathBuf,
    /// Project root the working directory was derived from.
    pub project_path: PathBuf,
    /// Prompt passed verbatim to the worker.
    pub prompt: String,
}

impl Session {
    /// Construct a new session in `Spawning` state with a generated identifier.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Mirrors the record layout one-to-one.
    pub fn new(
        task_id: String,
        phase: Phase,
        progress_path: PathBuf,
        log_path: PathBuf,
        hooks_path: PathBuf,
        workdir: PathBuf,
        project_path: PathBuf,
        prompt: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            pid: 0,
            status: SessionStatus::Spawning,
            phase,
            spawned_at: now,
            last_heartbeat: now,
            progress_path,
            log_path,
            hooks_path,
            hooks_prior: PriorConfig::Missing,
            exit_code: None,
            workdir,
            project_path,
            prompt,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (
                SessionStatus::Spawning,
                SessionStatus::Active | SessionStatus::Error | SessionStatus::Killed
            ) | (
                SessionStatus::Active,
                SessionStatus::Completed | SessionStatus::Error | SessionStatus::Killed
            )
        )
    }

    /// Apply `next` if the transition is permitted; returns whether it was.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Time since the last heartbeat, saturating at zero for clock skew.
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }
}
