//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Task identifier contains characters outside `[A-Za-z0-9_.-]`.
    InvalidTaskId(String),
    /// Working directory is missing, not a directory, or outside the allowed roots.
    PathViolation(String),
    /// Task already has a registered session or a queued submission.
    TaskBusy(String),
    /// Worker process could not be created or signalled.
    Spawn(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// File watcher could not be created or attached.
    Watch(String),
    /// Alert delivery to an external notifier failed.
    Notify(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Progress record could not be decoded.
    Parse(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidTaskId(msg) => write!(f, "invalid task id: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::TaskBusy(msg) => write!(f, "task busy: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Watch(msg) => write!(f, "watch: {msg}"),
            Self::Notify(msg) => write!(f, "notify: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Parse(msg) => write!(f, "parse: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<notify::Error> for AppError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl AppError {
    /// Whether the error was raised by input validation before any side effect.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTaskId(_) | Self::PathViolation(_) | Self::TaskBusy(_)
        )
    }
}
