//! Worker hooks file generation and share-counted restore.
//!
//! The hooks file tells the worker to invoke the progress emitter after
//! tool calls and when it stops, so every worker writes progress records
//! without knowing anything about the orchestrator. Several sessions may
//! use the same hooks file at once; [`HookLedger`] captures the content
//! that existed before the first session overwrote it and hands it back
//! only when the last session releases the file.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::models::session::PriorConfig;
use crate::{AppError, Result};

/// Render the hooks document for an emitter binary.
#[must_use]
pub fn render(emitter: &str) -> Value {
    let command = |kind: &str| {
        json!([{
            "matcher": "*",
            "hooks": [{
                "type": "command",
                "command": format!("{} emit --kind {kind}", shell_quote(emitter)),
            }],
        }])
    };

    json!({
        "hooks": {
            "PostToolUse": command("tool_use"),
            "Notification": command("heartbeat"),
            "SubagentStop": command("agent_stopped"),
            "Stop": command("agent_stopped"),
        }
    })
}

/// Render the hooks document as pretty-printed JSON text.
///
/// # Errors
///
/// Returns `AppError::Io` if serialization fails.
pub fn render_text(emitter: &str) -> Result<String> {
    serde_json::to_string_pretty(&render(emitter))
        .map_err(|err| AppError::Io(format!("failed to render hooks file: {err}")))
}

fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'));
    if safe {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[derive(Debug)]
struct HookShare {
    holders: usize,
    prior: PriorConfig,
}

/// Share counts for hooks files, keyed by absolute path.
#[derive(Debug, Default)]
pub struct HookLedger {
    shares: HashMap<PathBuf, HookShare>,
}

impl HookLedger {
    /// Write `content` to `path` and register one more holder.
    ///
    /// The first holder captures what was on disk beforehand; later holders
    /// receive the same captured value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the existing file cannot be read or the new
    /// content cannot be written. No holder is registered on failure.
    pub fn acquire(&mut self, path: &Path, content: &str) -> Result<PriorConfig> {
        if let Some(share) = self.shares.get_mut(path) {
            write_atomic(path, content)?;
            share.holders += 1;
            debug!(path = %path.display(), holders = share.holders, "hooks file shared");
            return Ok(share.prior.clone());
        }

        let prior = read_prior(path)?;
        write_atomic(path, content)?;
        self.shares.insert(
            path.to_owned(),
            HookShare {
                holders: 1,
                prior: prior.clone(),
            },
        );
        info!(path = %path.display(), existed = matches!(prior, PriorConfig::Present(_)), "hooks file installed");
        Ok(prior)
    }

    /// Drop one holder. Returns the captured prior content when it was the last.
    pub fn release(&mut self, path: &Path) -> Option<PriorConfig> {
        let share = self.shares.get_mut(path)?;
        share.holders = share.holders.saturating_sub(1);
        if share.holders > 0 {
            return None;
        }
        self.shares.remove(path).map(|share| share.prior)
    }

    /// Number of sessions currently holding `path`.
    #[must_use]
    pub fn holders(&self, path: &Path) -> usize {
        self.shares.get(path).map_or(0, |share| share.holders)
    }

    /// Forget every share, returning what each path should be restored to.
    pub fn drain(&mut self) -> Vec<(PathBuf, PriorConfig)> {
        self.shares
            .drain()
            .map(|(path, share)| (path, share.prior))
            .collect()
    }
}

/// Put `path` back the way it was before the first holder wrote it.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be rewritten or removed. A
/// file that is already gone is not an error.
pub fn restore(path: &Path, prior: &PriorConfig) -> Result<()> {
    match prior {
        PriorConfig::Missing => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "failed to remove hooks file {}: {err}",
                path.display()
            ))),
        },
        PriorConfig::Present(content) => write_atomic(path, content),
    }
}

fn read_prior(path: &Path) -> Result<PriorConfig> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(PriorConfig::Present(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(PriorConfig::Missing),
        Err(err) => Err(AppError::Io(format!(
            "failed to read hooks file {}: {err}",
            path.display()
        ))),
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("hooks path {} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|err| {
        AppError::Io(format!(
            "failed to write hooks file {}: {}",
            path.display(),
            err.error
        ))
    })?;
    Ok(())
}
