//! Progress records written by workers, one JSON object per line.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One parsed unit of worker output.
///
/// Encoded as an internally tagged JSON object, e.g.
/// `{"type":"tool_use","timestamp":"2024-05-01T10:00:00Z","tool":"Edit"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressRecord {
    /// The worker invoked a tool.
    ToolUse {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
        /// Tool name.
        tool: String,
        /// Short description of the call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// The worker moved to another phase.
    PhaseChange {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
        /// Previous phase, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// New phase.
        to: String,
    },
    /// A plan file is ready for review.
    PlanReady {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
        /// Location of the plan, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_path: Option<String>,
    },
    /// The worker (or one of its sub-agents) stopped.
    AgentStopped {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
        /// Stop reason, if reported.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The worker reported an error.
    Error {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
        /// Error text.
        message: String,
    },
    /// Liveness signal without other content.
    Heartbeat {
        /// Record timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl ProgressRecord {
    /// Timestamp carried by every variant.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ToolUse { timestamp, .. }
            | Self::PhaseChange { timestamp, .. }
            | Self::PlanReady { timestamp, .. }
            | Self::AgentStopped { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Heartbeat { timestamp } => *timestamp,
        }
    }

    /// Wire tag of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolUse { .. } => "tool_use",
            Self::PhaseChange { .. } => "phase_change",
            Self::PlanReady { .. } => "plan_ready",
            Self::AgentStopped { .. } => "agent_stopped",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Records parsed from one read of a progress file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressBatch {
    /// Task id derived from the file name.
    pub task_id: String,
    /// File the records came from.
    pub path: PathBuf,
    /// Records in file order.
    pub records: Vec<ProgressRecord>,
}

impl ProgressBatch {
    /// Most recent phase announced in this batch.
    #[must_use]
    pub fn latest_phase(&self) -> Option<&str> {
        self.records.iter().rev().find_map(|record| match record {
            ProgressRecord::PhaseChange { to, .. } => Some(to.as_str()),
            _ => None,
        })
    }
}
