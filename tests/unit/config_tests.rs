use std::path::PathBuf;
use std::time::Duration;

use agent_shepherd::config::GlobalConfig;
use agent_shepherd::security::EnvMode;
use agent_shepherd::AppError;

fn sample_toml(progress_dir: &str) -> String {
    format!(
        r#"
progress_dir = '{progress_dir}'
max_concurrent = 2

[worker]
command = "sh"
args = ["-c", "exit 0"]
hooks_file = "agent-hooks.json"
emitter = "/usr/local/bin/agent-shepherd"

[security]
env_mode = "unrestricted"
env_always_pass = ["PATH"]
env_blocklist = ["*_TOKEN"]
workdir_restricted = false

[watchdog]
poll_interval_seconds = 5
warn_after_seconds = 60
stale_after_seconds = 120
auto_restart_on_overflow = true
webhook_url = "https://hooks.example.com/alerts"

[progress]
debounce_ms = 25
"#
    )
}

#[test]
fn parses_valid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"));

    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    assert_eq!(config.progress_dir, temp.path());
    assert_eq!(config.max_concurrent, 2);
    assert_eq!(config.worker.command, "sh");
    assert_eq!(config.worker.args, vec!["-c", "exit 0"]);
    assert_eq!(config.worker.settings_flag.as_deref(), Some("--settings"));
    assert_eq!(config.hooks_path(), temp.path().join("agent-hooks.json"));
    assert_eq!(config.security.env_mode, EnvMode::Unrestricted);
    assert!(!config.security.workdir_restricted);
    assert_eq!(config.watchdog.poll_interval(), Duration::from_secs(5));
    assert!(config.watchdog.auto_restart_on_overflow);
    assert_eq!(
        config.watchdog.webhook_url.as_deref(),
        Some("https://hooks.example.com/alerts")
    );
    assert_eq!(config.progress.debounce(), Duration::from_millis(25));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("progress_dir = '/var/tmp/shepherd'\n")
        .expect("config parses");

    assert_eq!(config.max_concurrent, 3);
    assert_eq!(config.worker.command, "claude");
    assert_eq!(config.worker.args, vec!["-p"]);
    assert_eq!(config.worker.hooks_file, "hooks.json");
    assert_eq!(config.security.env_mode, EnvMode::Sandboxed);
    assert!(config.security.workdir_restricted);
    assert!(config
        .security
        .env_blocklist
        .iter()
        .any(|p| p == "*_TOKEN"));
    assert_eq!(config.watchdog.warn_after(), Duration::from_secs(300));
    assert_eq!(config.watchdog.stale_after(), Duration::from_secs(900));
    assert_eq!(config.progress.debounce(), Duration::from_millis(100));
}

#[test]
fn relative_progress_dir_is_made_absolute() {
    let config = GlobalConfig::from_toml_str("progress_dir = 'runs/progress'\n").expect("parses");
    assert!(config.progress_dir.is_absolute());
    assert!(config.progress_dir.ends_with(PathBuf::from("runs/progress")));
}

#[test]
fn zero_max_concurrent_is_rejected() {
    let result = GlobalConfig::from_toml_str("progress_dir = '/tmp/p'\nmax_concurrent = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn stale_threshold_must_exceed_warning() {
    let raw = "progress_dir = '/tmp/p'\n[watchdog]\nwarn_after_seconds = 600\nstale_after_seconds = 600\n";
    let err = GlobalConfig::from_toml_str(raw).expect_err("must fail");
    assert!(err.to_string().contains("stale_after_seconds"));
}

#[test]
fn empty_worker_command_is_rejected() {
    let raw = "progress_dir = '/tmp/p'\n[worker]\ncommand = '  '\n";
    assert!(matches!(
        GlobalConfig::from_toml_str(raw),
        Err(AppError::Config(_))
    ));
}

#[test]
fn absolute_hooks_file_is_rejected() {
    let raw = "progress_dir = '/tmp/p'\n[worker]\nhooks_file = '/etc/hooks.json'\n";
    assert!(GlobalConfig::from_toml_str(raw).is_err());
}

#[test]
fn missing_progress_dir_is_a_config_error() {
    assert!(matches!(
        GlobalConfig::from_toml_str("max_concurrent = 1\n"),
        Err(AppError::Config(_))
    ));
}

#[test]
fn load_from_missing_file_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = GlobalConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}
