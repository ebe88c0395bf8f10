//! Spawn-or-enqueue, automatic draining and progress feedback.

use std::sync::Arc;
use std::time::Duration;

use agent_shepherd::models::session::Phase;
use agent_shepherd::orchestrator::supervisor::Submission;
use agent_shepherd::orchestrator::{AdmissionQueue, SessionEvent, Supervisor};
use agent_shepherd::progress::ProgressWatcher;
use agent_shepherd::AppError;

use super::test_helpers::{next_matching, record_events, wait_until, Sandbox};

/// Worker that blocks until `$PWD/go-<prompt>` exists.
const GATED: &str = "while [ ! -f \"$PWD/go-$1\" ]; do sleep 0.05; done";

#[tokio::test]
async fn queued_task_starts_when_first_completes() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(sandbox.config(GATED));
    let mut events = record_events(&orchestrator);
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(1)));

    let mut first = sandbox.options("first");
    first.prompt = "first".into();
    let mut second = sandbox.options("second");
    second.prompt = "second".into();

    let a = supervisor.submit(first, 0).await.unwrap();
    let b = supervisor.submit(second, 0).await.unwrap();
    assert!(matches!(a, Submission::Spawned(_)));
    assert!(matches!(b, Submission::Queued(_)));
    assert_eq!(supervisor.queue().status().pending.len(), 1);
    assert!(orchestrator.get_session_by_task_id("second").is_none());

    std::fs::write(sandbox.project.join("go-first"), "").unwrap();
    let done = next_matching(&mut events, SessionEvent::is_terminal).await;
    assert_eq!(done.session().task_id, "first");

    let spawned = next_matching(&mut events, |e| matches!(e, SessionEvent::Spawned { .. })).await;
    assert_eq!(spawned.session().task_id, "second");
    assert!(supervisor.queue().status().pending.is_empty());
    assert_eq!(supervisor.queue().status().running, vec!["second".to_owned()]);

    std::fs::write(sandbox.project.join("go-second"), "").unwrap();
    next_matching(&mut events, SessionEvent::is_terminal).await;
    wait_until(|| supervisor.queue().status().running.is_empty()).await;
    orchestrator.dispose().await;
}

#[tokio::test]
async fn higher_priority_waits_less() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(sandbox.config(GATED));
    let mut events = record_events(&orchestrator);
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(1)));

    for (task, priority) in [("blocker", 0), ("low", 1), ("high", 5)] {
        let mut options = sandbox.options(task);
        options.prompt = task.into();
        supervisor.submit(options, priority).await.unwrap();
    }

    std::fs::write(sandbox.project.join("go-blocker"), "").unwrap();
    let next = next_matching(&mut events, |e| {
        matches!(e, SessionEvent::Spawned { session, .. } if session.task_id != "blocker")
    })
    .await;
    assert_eq!(next.session().task_id, "high");
    orchestrator.dispose().await;
}

#[tokio::test]
async fn invalid_submission_is_rejected_without_queueing() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(sandbox.config("exit 0"));
    let supervisor = Supervisor::new(orchestrator, Arc::new(AdmissionQueue::new(1)));

    let result = supervisor.submit(sandbox.options("bad id"), 0).await;
    assert!(matches!(result, Err(AppError::InvalidTaskId(_))));
    let status = supervisor.queue().status();
    assert!(status.pending.is_empty());
    assert!(status.running.is_empty());
}

#[tokio::test]
async fn repeated_task_id_is_refused_and_budget_holds() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(sandbox.config(GATED));
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(2)));

    let first = supervisor.submit(sandbox.options("dup"), 0).await.unwrap();
    assert!(matches!(first, Submission::Spawned(_)));
    let again = supervisor.submit(sandbox.options("dup"), 0).await;
    assert!(matches!(again, Err(AppError::TaskBusy(_))));
    let other = supervisor.submit(sandbox.options("other"), 0).await.unwrap();
    assert!(matches!(other, Submission::Spawned(_)));

    let third = supervisor.submit(sandbox.options("third"), 0).await.unwrap();
    assert!(matches!(third, Submission::Queued(_)));
    let third_again = supervisor.submit(sandbox.options("third"), 9).await;
    assert!(matches!(third_again, Err(AppError::TaskBusy(_))));

    let status = supervisor.queue().status();
    assert_eq!(status.running, vec!["dup".to_owned(), "other".to_owned()]);
    assert_eq!(status.pending.len(), 1);
    assert_eq!(orchestrator.list_active_sessions().len(), 2);
    orchestrator.dispose().await;
}

#[tokio::test]
async fn withdrawn_task_never_starts() {
    let sandbox = Sandbox::new();
    let orchestrator = sandbox.orchestrator(sandbox.config(GATED));
    let mut events = record_events(&orchestrator);
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(1)));

    let mut first = sandbox.options("first");
    first.prompt = "first".into();
    supervisor.submit(first, 0).await.unwrap();
    let Submission::Queued(id) = supervisor.submit(sandbox.options("second"), 0).await.unwrap() else {
        panic!("expected queued");
    };
    assert!(supervisor.withdraw(&id));

    std::fs::write(sandbox.project.join("go-first"), "").unwrap();
    next_matching(&mut events, SessionEvent::is_terminal).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.get_session_by_task_id("second").is_none());
    orchestrator.dispose().await;
}

#[tokio::test]
async fn progress_records_become_heartbeats() {
    let sandbox = Sandbox::new();
    let script = concat!(
        "printf '%s\\n' '{\"type\":\"phase_change\",\"timestamp\":\"2026-01-01T00:00:00Z\",\"to\":\"qa\"}' ",
        ">> \"$SHEPHERD_PROGRESS_FILE\"; sleep 30"
    );
    let orchestrator = sandbox.orchestrator(sandbox.config(script));
    let mut events = record_events(&orchestrator);
    let supervisor = Supervisor::new(orchestrator.clone(), Arc::new(AdmissionQueue::new(2)));
    std::fs::create_dir_all(&sandbox.progress).unwrap();
    let watcher = ProgressWatcher::start(&sandbox.progress, Duration::from_millis(20)).unwrap();
    supervisor.attach_progress(&watcher);

    supervisor.submit(sandbox.options("task-1"), 0).await.unwrap();

    let beat = next_matching(&mut events, |e| matches!(e, SessionEvent::Heartbeat { .. })).await;
    assert_eq!(beat.session().task_id, "task-1");
    assert_eq!(beat.session().phase, Phase::Qa);

    watcher.stop();
    orchestrator.dispose().await;
}
