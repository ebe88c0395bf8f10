//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::security::SecuritySettings;
use crate::{AppError, Result};

/// Worker executable and the way it is told about the hooks file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Worker binary (e.g., `claude`).
    #[serde(default = "default_worker_command")]
    pub command: String,
    /// Arguments passed before the hooks flag and the prompt.
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    /// Flag that introduces the hooks file path; `None` omits it.
    #[serde(default = "default_settings_flag")]
    pub settings_flag: Option<String>,
    /// Hooks file name, relative to the progress directory.
    #[serde(default = "default_hooks_file")]
    pub hooks_file: String,
    /// Binary the generated hooks invoke to append progress records.
    #[serde(default = "default_emitter")]
    pub emitter: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            settings_flag: default_settings_flag(),
            hooks_file: default_hooks_file(),
            emitter: default_emitter(),
        }
    }
}

fn default_worker_command() -> String {
    "claude".into()
}

fn default_worker_args() -> Vec<String> {
    vec!["-p".into()]
}

#[allow(clippy::unnecessary_wraps)] // serde default must match the field type.
fn default_settings_flag() -> Option<String> {
    Some("--settings".into())
}

fn default_hooks_file() -> String {
    "hooks.json".into()
}

fn default_emitter() -> String {
    "agent-shepherd".into()
}

/// Watchdog polling and threshold configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchdogConfig {
    /// Seconds between health polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Heartbeat age that raises a `warning` alert.
    #[serde(default = "default_warn_after")]
    pub warn_after_seconds: u64,
    /// Heartbeat age that raises a `stale` alert.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
    /// Raise a restart alert when a worker exits with the context-overflow code.
    #[serde(default)]
    pub auto_restart_on_overflow: bool,
    /// Webhook receiving `dead` and `stale` alerts.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            warn_after_seconds: default_warn_after(),
            stale_after_seconds: default_stale_after(),
            auto_restart_on_overflow: false,
            webhook_url: None,
        }
    }
}

impl WatchdogConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Warning threshold as a [`Duration`].
    #[must_use]
    pub fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_seconds)
    }

    /// Staleness threshold as a [`Duration`].
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_warn_after() -> u64 {
    300
}

fn default_stale_after() -> u64 {
    900
}

/// Progress watcher tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressConfig {
    /// Per-file debounce window in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl ProgressConfig {
    /// Debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_concurrent() -> u32 {
    3
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding per-task log, progress and hooks files.
    pub progress_dir: PathBuf,
    /// Maximum number of worker processes running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Worker executable settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Default security settings for spawns that do not supply their own.
    #[serde(default)]
    pub security: SecuritySettings,
    /// Health polling thresholds.
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Progress watcher tuning.
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `progress_dir` with every other value defaulted.
    #[must_use]
    pub fn with_progress_dir(progress_dir: PathBuf) -> Self {
        Self {
            progress_dir,
            max_concurrent: default_max_concurrent(),
            worker: WorkerConfig::default(),
            security: SecuritySettings::default(),
            watchdog: WatchdogConfig::default(),
            progress: ProgressConfig::default(),
        }
    }

    /// Absolute path of the shared hooks file.
    #[must_use]
    pub fn hooks_path(&self) -> PathBuf {
        self.progress_dir.join(&self.worker.hooks_file)
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(AppError::Config(
                "max_concurrent must be greater than zero".into(),
            ));
        }

        if self.worker.command.trim().is_empty() {
            return Err(AppError::Config("worker.command must not be empty".into()));
        }

        if self.worker.hooks_file.trim().is_empty()
            || Path::new(&self.worker.hooks_file).is_absolute()
        {
            return Err(AppError::Config(
                "worker.hooks_file must be a relative file name".into(),
            ));
        }

        if self.watchdog.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "watchdog.poll_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.watchdog.stale_after_seconds <= self.watchdog.warn_after_seconds {
            return Err(AppError::Config(
                "watchdog.stale_after_seconds must exceed warn_after_seconds".into(),
            ));
        }

        if self.progress_dir.is_relative() {
            let cwd = env::current_dir()
                .map_err(|err| AppError::Config(format!("cannot resolve progress_dir: {err}")))?;
            self.progress_dir = cwd.join(&self.progress_dir);
        }

        Ok(())
    }
}
