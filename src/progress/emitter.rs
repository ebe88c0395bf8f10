//! Worker-side progress writer used by the `emit` subcommand.
//!
//! Each hook invocation appends exactly one line so the watcher never sees
//! a record split across two writes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use crate::models::progress::ProgressRecord;
use crate::{AppError, Result};

/// Append `record` as one JSON line to `path`, creating the file if needed.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be opened or written.
pub fn append_record(path: &Path, record: &ProgressRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)
        .map_err(|err| AppError::Io(format!("failed to serialize progress record: {err}")))?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;
    file.write_all(&line)?;
    Ok(())
}

/// Build a record of `kind` from a hook's JSON payload.
///
/// Recognised payload fields are `tool_name`, `tool_input`, `reason`,
/// `message`, `plan_path` and `phase`; anything else is ignored. Unknown
/// kinds and an empty or non-JSON payload still produce a record.
///
/// # Errors
///
/// Returns `AppError::Parse` for a kind that is not a progress record type.
pub fn record_from_hook(kind: &str, payload: &str) -> Result<ProgressRecord> {
    let payload: Value = serde_json::from_str(payload.trim()).unwrap_or(Value::Null);
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
    };
    let timestamp = Utc::now();

    let record = match kind {
        "tool_use" => ProgressRecord::ToolUse {
            timestamp,
            tool: field("tool_name").unwrap_or_else(|| "unknown".to_owned()),
            detail: tool_detail(&payload),
        },
        "phase_change" => ProgressRecord::PhaseChange {
            timestamp,
            from: field("from"),
            to: field("phase")
                .or_else(|| field("to"))
                .ok_or_else(|| AppError::Parse("phase_change needs a phase".into()))?,
        },
        "plan_ready" => ProgressRecord::PlanReady {
            timestamp,
            plan_path: field("plan_path"),
        },
        "agent_stopped" => ProgressRecord::AgentStopped {
            timestamp,
            reason: field("reason").or_else(|| field("stop_reason")),
        },
        "error" => ProgressRecord::Error {
            timestamp,
            message: field("message").unwrap_or_else(|| "unspecified error".to_owned()),
        },
        "heartbeat" => ProgressRecord::Heartbeat { timestamp },
        other => return Err(AppError::Parse(format!("unknown progress kind: {other}"))),
    };
    Ok(record)
}

/// Short description of a tool call: the file or command it touched.
fn tool_detail(payload: &Value) -> Option<String> {
    let input = payload.get("tool_input")?;
    ["file_path", "command", "pattern", "path", "url"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map(|s| s.chars().take(200).collect())
}
