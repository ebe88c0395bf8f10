//! Watchdog alert model.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification carried by an alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Heartbeat older than the warning threshold.
    Warning,
    /// Heartbeat older than the staleness threshold.
    Stale,
    /// Process no longer exists.
    Dead,
    /// Worker exited because its credentials were rejected.
    AuthFailed,
}

impl AlertKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Stale => "stale",
            Self::Dead => "dead",
            Self::AuthFailed => "auth_failed",
        }
    }

    /// Whether alerts of this kind go to the external notifier.
    #[must_use]
    pub fn is_escalated(self) -> bool {
        matches!(self, Self::Dead | Self::Stale)
    }
}

impl Display for AlertKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery step suggested to whoever handles the alert.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Restart the task from its last checkpoint.
    RestartCheckpoint,
    /// Mark the task as errored for manual follow-up.
    MarkError,
    /// Refresh the worker's credentials.
    Reauthenticate,
}

/// A health alert for one session. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogAlert {
    /// Classification.
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Session the alert concerns.
    pub session_id: String,
    /// Task the session runs.
    pub task_id: String,
    /// Human-readable description.
    pub message: String,
    /// Suggested remedy.
    pub suggested_action: SuggestedAction,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl WatchdogAlert {
    /// Construct an alert stamped with `timestamp`.
    #[must_use]
    pub fn new(
        kind: AlertKind,
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        message: impl Into<String>,
        suggested_action: SuggestedAction,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            task_id: task_id.into(),
            message: message.into(),
            suggested_action,
            timestamp,
        }
    }
}
