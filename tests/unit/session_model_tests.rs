//! Session lifecycle rules and phase parsing.

use std::path::PathBuf;

use agent_shepherd::models::session::{Phase, PriorConfig, Session, SessionStatus};

fn session() -> Session {
    Session::new(
        "task-1".into(),
        Phase::Planning,
        PathBuf::from("/p/task-1.jsonl"),
        PathBuf::from("/p/task-1.log"),
        PathBuf::from("/p/hooks.json"),
        PathBuf::from("/work"),
        PathBuf::from("/work"),
        "do it".into(),
    )
}

#[test]
fn new_session_is_spawning_without_pid() {
    let s = session();
    assert_eq!(s.status, SessionStatus::Spawning);
    assert_eq!(s.pid, 0);
    assert_eq!(s.hooks_prior, PriorConfig::Missing);
    assert!(s.exit_code.is_none());
    assert_eq!(s.spawned_at, s.last_heartbeat);
}

#[test]
fn ids_are_unique() {
    assert_ne!(session().id, session().id);
}

#[test]
fn transitions_are_monotonic() {
    let mut s = session();
    assert!(s.transition(SessionStatus::Active));
    assert!(!s.transition(SessionStatus::Spawning));
    assert!(s.transition(SessionStatus::Completed));
    for next in [
        SessionStatus::Active,
        SessionStatus::Error,
        SessionStatus::Killed,
        SessionStatus::Completed,
    ] {
        assert!(!s.transition(next), "terminal session moved to {next:?}");
    }
}

#[test]
fn spawning_can_fail_or_be_killed_directly() {
    let mut failed = session();
    assert!(failed.transition(SessionStatus::Error));

    let mut killed = session();
    assert!(killed.transition(SessionStatus::Killed));
    assert!(!killed.transition(SessionStatus::Error));
}

#[test]
fn spawning_cannot_complete() {
    let s = session();
    assert!(!s.can_transition_to(SessionStatus::Completed));
}

#[test]
fn terminal_statuses() {
    assert!(!SessionStatus::Spawning.is_terminal());
    assert!(!SessionStatus::Active.is_terminal());
    assert!(SessionStatus::Completed.is_terminal());
    assert!(SessionStatus::Error.is_terminal());
    assert!(SessionStatus::Killed.is_terminal());
}

#[test]
fn heartbeat_age_saturates_on_clock_skew() {
    let s = session();
    let earlier = s.last_heartbeat - chrono::Duration::seconds(10);
    assert_eq!(s.heartbeat_age(earlier), std::time::Duration::ZERO);
    let later = s.last_heartbeat + chrono::Duration::seconds(42);
    assert_eq!(s.heartbeat_age(later).as_secs(), 42);
}

#[test]
fn phase_parses_case_insensitively() {
    assert_eq!("QA".parse::<Phase>().unwrap(), Phase::Qa);
    assert_eq!(" planning ".parse::<Phase>().unwrap(), Phase::Planning);
    assert!("review".parse::<Phase>().is_err());
    assert_eq!(Phase::default().to_string(), "executing");
}

#[test]
fn prior_config_serializes_tagged() {
    let json = serde_json::to_value(PriorConfig::Present("{}".into())).unwrap();
    assert_eq!(json["state"], "present");
    assert_eq!(json["content"], "{}");
    let missing = serde_json::to_value(PriorConfig::Missing).unwrap();
    assert_eq!(missing["state"], "missing");
}
