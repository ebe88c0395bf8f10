#![forbid(unsafe_code)]

//! `agent-shepherd`: runs coding-agent workers under supervision.
//!
//! `run` submits tasks through the admission queue, tails their progress,
//! watches their health, and exits once every task has finished. `emit`
//! is the worker-side hook command that appends one progress record.

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_shepherd::config::GlobalConfig;
use agent_shepherd::models::session::Phase;
use agent_shepherd::notifier::{AlertNotifier, WebhookNotifier};
use agent_shepherd::orchestrator::session_manager::PROGRESS_FILE_VAR;
use agent_shepherd::orchestrator::supervisor::Submission;
use agent_shepherd::orchestrator::{
    AdmissionQueue, Orchestrator, SessionEvent, SpawnOptions, Supervisor, Watchdog,
};
use agent_shepherd::progress::{emitter, ProgressWatcher};
use agent_shepherd::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-shepherd", about = "Supervise headless coding-agent workers", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run tasks to completion.
    Run(RunArgs),
    /// Append a progress record built from a hook payload on stdin.
    Emit {
        /// Record type, e.g. `tool_use` or `agent_stopped`.
        #[arg(long)]
        kind: String,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Project directory the workers operate on.
    #[arg(long)]
    project: PathBuf,

    /// Directory inside the project to run in.
    #[arg(long)]
    sub_path: Option<PathBuf>,

    /// Prompt handed to every worker.
    #[arg(long)]
    prompt: String,

    /// Phase tag forwarded to the workers.
    #[arg(long, default_value = "executing")]
    phase: Phase,

    /// Task to run, as `id` or `id:priority`. Repeatable.
    #[arg(long = "task", value_parser = parse_task, required = true)]
    tasks: Vec<(String, i32)>,
}

fn parse_task(raw: &str) -> std::result::Result<(String, i32), String> {
    match raw.rsplit_once(':') {
        Some((id, priority)) => priority
            .parse()
            .map(|p| (id.to_owned(), p))
            .map_err(|err| format!("invalid priority in {raw:?}: {err}")),
        None => Ok((raw.to_owned(), 0)),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    match args.command {
        Command::Emit { kind } => emit(&kind),
        Command::Run(run_args) => {
            let config_path = args
                .config
                .ok_or_else(|| AppError::Config("--config is required for run".into()))?;
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
                .block_on(run(config_path, run_args))
        }
    }
}

fn emit(kind: &str) -> Result<()> {
    let path = std::env::var_os(PROGRESS_FILE_VAR)
        .map(PathBuf::from)
        .ok_or_else(|| AppError::Config(format!("{PROGRESS_FILE_VAR} is not set")))?;

    let mut payload = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut payload) {
        warn!(%err, "failed to read hook payload");
    }
    let record = emitter::record_from_hook(kind, &payload)?;
    emitter::append_record(&path, &record)
}

async fn run(config_path: PathBuf, args: RunArgs) -> Result<()> {
    let mut seen = HashSet::new();
    if let Some((task_id, _)) = args.tasks.iter().find(|(id, _)| !seen.insert(id.as_str())) {
        return Err(AppError::Config(format!("task {task_id} is listed more than once")));
    }

    let config = GlobalConfig::load_from_path(&config_path)?;
    info!(progress_dir = %config.progress_dir.display(), max_concurrent = config.max_concurrent, "configuration loaded");

    let orchestrator = Orchestrator::new(config.clone());
    let max_concurrent = usize::try_from(config.max_concurrent).unwrap_or(usize::MAX);
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(max_concurrent)));
    let ct = CancellationToken::new();

    // ── Progress ────────────────────────────────────────
    let watcher = ProgressWatcher::start(&config.progress_dir, config.progress.debounce())?;
    supervisor.attach_progress(&watcher);

    // ── Health ──────────────────────────────────────────
    let notifier: Option<Arc<dyn AlertNotifier>> = match &config.watchdog.webhook_url {
        Some(url) => {
            let (webhook, _worker) = WebhookNotifier::start(url)?;
            Some(Arc::new(webhook))
        }
        None => None,
    };
    let watchdog = Watchdog::new(
        Arc::new(orchestrator.clone()),
        config.watchdog.clone(),
        notifier,
    );
    watchdog.attach(&orchestrator);
    watchdog.on_alert(|alert| {
        info!(kind = %alert.kind, task_id = %alert.task_id, action = ?alert.suggested_action, "alert raised");
        Ok(())
    });
    let watchdog_handle = watchdog.spawn(ct.clone());

    // ── Completion tracking ─────────────────────────────
    let remaining: Arc<Mutex<HashSet<String>>> =
        Arc::new(Mutex::new(args.tasks.iter().map(|(id, _)| id.clone()).collect()));
    let done = Arc::new(Notify::new());
    let failures = Arc::new(Mutex::new(Vec::<String>::new()));
    {
        let remaining = Arc::clone(&remaining);
        let done = Arc::clone(&done);
        let failures = Arc::clone(&failures);
        orchestrator.on_session_event(move |event| {
            let session = event.session();
            info!(
                event = event.name(),
                task_id = %session.task_id,
                session_id = %session.id,
                exit_code = ?event.exit_code(),
                "session event"
            );
            if !event.is_terminal() {
                return Ok(());
            }
            if matches!(event, SessionEvent::Error { .. }) {
                failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(session.task_id.clone());
            }
            finish(&remaining, &done, &session.task_id);
            Ok(())
        });
    }

    // ── Submit ──────────────────────────────────────────
    for (task_id, priority) in &args.tasks {
        let mut options = SpawnOptions::new(task_id.clone(), args.project.clone(), args.prompt.clone());
        options.sub_project_path.clone_from(&args.sub_path);
        options.phase = args.phase;
        match supervisor.submit(options, *priority).await {
            Ok(Submission::Spawned(session)) => {
                info!(task_id, session_id = %session.id, pid = session.pid, "task started");
            }
            Ok(Submission::Queued(id)) => info!(task_id, queued_id = %id, "task queued"),
            Err(err) => {
                error!(task_id, %err, "task rejected");
                failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(task_id.clone());
                finish(&remaining, &done, task_id);
            }
        }
    }

    // ── Wait ────────────────────────────────────────────
    tokio::select! {
        () = done.notified() => info!("all tasks finished"),
        () = shutdown_signal() => info!("shutdown signal received"),
    }

    ct.cancel();
    watcher.stop();
    orchestrator.dispose().await;
    if let Err(err) = watchdog_handle.await {
        warn!(%err, "watchdog task ended abnormally");
    }

    let failed = failures.lock().unwrap_or_else(PoisonError::into_inner).clone();
    if failed.is_empty() {
        info!("shutdown complete");
        Ok(())
    } else {
        Err(AppError::Spawn(format!("tasks failed: {}", failed.join(", "))))
    }
}

fn finish(remaining: &Mutex<HashSet<String>>, done: &Notify, task_id: &str) {
    let mut remaining = remaining.lock().unwrap_or_else(PoisonError::into_inner);
    if remaining.remove(task_id) && remaining.is_empty() {
        done.notify_one();
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
