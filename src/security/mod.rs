//! Pre-spawn security policy.
//!
//! Everything a worker process inherits from the host is decided here:
//! which environment variables survive ([`env`]), which directory it may
//! run in ([`workdir`]), and whether a task id is safe to embed in file
//! names and command lines ([`validate_task_id`]).

pub mod env;
pub mod workdir;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

pub use env::{EnvPattern, EnvPolicy, POLICY_ENV_VAR};
pub use workdir::resolve_workdir;

/// How the inherited environment is handled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    /// Filter the inherited environment through allow/block patterns.
    #[default]
    Sandboxed,
    /// Pass the inherited environment through untouched.
    Unrestricted,
}

impl EnvMode {
    /// Wire name of the mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sandboxed => "sandboxed",
            Self::Unrestricted => "unrestricted",
        }
    }
}

/// Per-spawn security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SecuritySettings {
    /// Environment handling mode.
    #[serde(default)]
    pub env_mode: EnvMode,
    /// Patterns always kept in sandboxed mode, even when also blocked.
    #[serde(default = "default_always_pass")]
    pub env_always_pass: Vec<String>,
    /// Patterns dropped in sandboxed mode.
    #[serde(default = "default_blocklist")]
    pub env_blocklist: Vec<String>,
    /// Require the working directory to lie under `$HOME` or the project.
    #[serde(default = "default_true")]
    pub workdir_restricted: bool,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            env_mode: EnvMode::Sandboxed,
            env_always_pass: default_always_pass(),
            env_blocklist: default_blocklist(),
            workdir_restricted: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_always_pass() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "USER",
        "LOGNAME",
        "SHELL",
        "LANG",
        "LC_*",
        "TERM",
        "TMPDIR",
        "RUST_LOG",
        "ANTHROPIC_API_KEY",
        "CLAUDE_*",
        // Windows-specific variables.
        "USERPROFILE",
        "SYSTEMROOT",
        "TEMP",
        "TMP",
        "USERNAME",
        "APPDATA",
        "LOCALAPPDATA",
        "COMSPEC",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_blocklist() -> Vec<String> {
    [
        "*_TOKEN",
        "*_SECRET",
        "*_SECRET_KEY",
        "*_PASSWORD",
        "*_API_KEY",
        "*_CREDENTIALS",
        "AWS_*",
        "GITHUB_*",
        "GH_*",
        "SLACK_*",
        "DATABASE_URL",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

#[allow(clippy::expect_used)]
static TASK_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("task id pattern is valid"));

/// Validate that a task id only uses `[A-Za-z0-9_.-]`.
///
/// Task ids become file names and process arguments, so anything that a
/// shell could interpret is rejected before any side effect happens.
///
/// # Errors
///
/// Returns `AppError::InvalidTaskId` for empty ids or ids containing any
/// other character.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    if TASK_ID_PATTERN.is_match(task_id) {
        Ok(())
    } else {
        Err(AppError::InvalidTaskId(format!(
            "{task_id:?} must match {}",
            TASK_ID_PATTERN.as_str()
        )))
    }
}
