//! Worker process spawner and exit monitor.
//!
//! Spawns the worker binary with:
//! - `env_clear()` followed by the composed environment, so nothing the
//!   security policy dropped can leak into the child.
//! - stdout and stderr redirected into the session's log file.
//! - its own process group on unix, so termination signals reach any
//!   helpers the worker starts.
//! - `kill_on_drop(true)` as a backstop if the monitor task is aborted.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::{AppError, Result};

/// Delay between the graceful and the forced termination signal.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Everything needed to start one worker process.
#[derive(Debug)]
pub struct WorkerLaunch<'a> {
    /// Worker executable settings.
    pub worker: &'a WorkerConfig,
    /// Hooks file handed to the worker via `settings_flag`.
    pub hooks_path: &'a Path,
    /// Prompt, passed as the last argument.
    pub prompt: &'a str,
    /// Directory the worker runs in.
    pub workdir: &'a Path,
    /// Complete environment; the inherited one is cleared first.
    pub env: &'a BTreeMap<String, String>,
    /// Receives stdout and stderr.
    pub log_path: &'a Path,
}

/// Spawn the worker process described by `launch`.
///
/// # Errors
///
/// - `AppError::Io` if the log file cannot be created.
/// - `AppError::Spawn` if the OS refuses to create the process.
pub fn spawn_worker(launch: &WorkerLaunch<'_>) -> Result<Child> {
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(launch.log_path)
        .map_err(|err| {
            AppError::Io(format!(
                "failed to open log {}: {err}",
                launch.log_path.display()
            ))
        })?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(&launch.worker.command);
    cmd.args(&launch.worker.args);
    if let Some(flag) = &launch.worker.settings_flag {
        cmd.arg(flag).arg(launch.hooks_path);
    }
    cmd.arg(launch.prompt);

    cmd.env_clear();
    cmd.envs(launch.env);

    cmd.current_dir(launch.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn {}: {err}",
            launch.worker.command
        ))
    })
}

/// How a monitored process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; `None` when killed by a signal or the wait failed.
    pub exit_code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

impl ExitOutcome {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => {
                let exit_code = status.code();
                let reason = exit_code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                Self { exit_code, reason }
            }
            Err(err) => Self {
                exit_code: None,
                reason: format!("wait error: {err}"),
            },
        }
    }
}

/// Spawn a task that owns `child`, waits for it to exit and then calls
/// `on_exit` exactly once.
///
/// Cancelling `kill` makes the task send a graceful termination signal,
/// wait up to `grace`, then force-kill the process.
#[must_use]
pub fn monitor_exit<F>(
    session_id: String,
    mut child: Child,
    kill: CancellationToken,
    grace: Duration,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(ExitOutcome) + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = tokio::select! {
            result = child.wait() => ExitOutcome::from_wait(result),
            () = kill.cancelled() => terminate(&session_id, &mut child, grace).await,
        };
        info!(session_id, exit_code = ?outcome.exit_code, reason = %outcome.reason, "worker process exited");
        on_exit(outcome);
    })
}

/// Two-phase termination: graceful signal, then a forced kill after `grace`.
async fn terminate(session_id: &str, child: &mut Child, grace: Duration) -> ExitOutcome {
    info!(session_id, grace_secs = grace.as_secs(), "terminating worker process");
    if let Err(err) = signal_graceful(child) {
        warn!(session_id, %err, "graceful termination signal failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(result) => ExitOutcome::from_wait(result),
        Err(_) => {
            warn!(
                session_id,
                "worker did not exit within grace period, forcing kill"
            );
            signal_forced(child);
            ExitOutcome::from_wait(child.wait().await)
        }
    }
}

#[cfg(unix)]
fn signal_graceful(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return Ok(());
    };
    killpg(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|err| AppError::Spawn(format!("SIGTERM to process group {pid} failed: {err}")))
}

#[cfg(not(unix))]
fn signal_graceful(child: &mut Child) -> Result<()> {
    child
        .start_kill()
        .map_err(|err| AppError::Spawn(format!("failed to terminate worker: {err}")))
}

fn signal_forced(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, %err, "SIGKILL to process group failed");
            }
        }
    }
    if let Err(err) = child.start_kill() {
        warn!(%err, "failed to force-kill worker process");
    }
}

/// Zero-cost liveness probe: a null signal to `pid`.
///
/// `EPERM` still proves the process exists. A pid of 0 is never alive.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
    #[cfg(not(unix))]
    {
        true
    }
}
