//! Admission queue ordering, capacity and change notifications.

use std::sync::{Arc, Mutex};

use agent_shepherd::models::queue::QueueChanged;
use agent_shepherd::orchestrator::{Admission, AdmissionQueue};

// ── Ordering ─────────────────────────────────────────────────

#[test]
fn dequeue_prefers_higher_priority() {
    let queue = AdmissionQueue::new(1);
    queue.enqueue("low", "proj", 0);
    queue.enqueue("high", "proj", 10);
    queue.enqueue("mid", "proj", 5);

    let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
        .map(|a| a.task_id)
        .collect();
    assert_eq!(order, vec!["high", "mid", "low"]);
}

#[test]
fn equal_priority_is_first_in_first_out() {
    let queue = AdmissionQueue::new(1);
    for task in ["a", "b", "c", "d"] {
        queue.enqueue(task, "proj", 1);
    }
    queue.enqueue("urgent", "proj", 2);

    let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
        .map(|a| a.task_id)
        .collect();
    assert_eq!(order, vec!["urgent", "a", "b", "c", "d"]);
}

#[test]
fn negative_priorities_sort_last() {
    let queue = AdmissionQueue::new(1);
    queue.enqueue("later", "proj", -5);
    queue.enqueue("normal", "proj", 0);

    assert_eq!(queue.dequeue().unwrap().task_id, "normal");
    assert_eq!(queue.dequeue().unwrap().task_id, "later");
    assert!(queue.dequeue().is_none());
}

#[test]
fn status_lists_pending_in_dequeue_order() {
    let queue = AdmissionQueue::new(2);
    queue.enqueue("b", "proj", 0);
    queue.enqueue("a", "proj", 3);
    queue.add_running("r1");

    let status = queue.status();
    let pending: Vec<&str> = status.pending.iter().map(|a| a.task_id.as_str()).collect();
    assert_eq!(pending, vec!["a", "b"]);
    assert_eq!(status.running, vec!["r1".to_owned()]);
    assert_eq!(status.max_concurrent, 2);
}

#[test]
fn remove_drops_entry_by_id() {
    let queue = AdmissionQueue::new(1);
    let id = queue.enqueue("gone", "proj", 9);
    queue.enqueue("stays", "proj", 0);

    assert!(queue.remove(&id));
    assert!(!queue.remove(&id));
    assert_eq!(queue.dequeue().unwrap().task_id, "stays");
}

// ── Capacity ─────────────────────────────────────────────────

#[test]
fn can_start_tracks_running_count() {
    let queue = AdmissionQueue::new(2);
    assert!(queue.can_start_immediately());
    queue.add_running("t1");
    assert!(queue.can_start_immediately());
    queue.add_running("t2");
    assert!(!queue.can_start_immediately());

    assert!(queue.remove_running("t1"));
    assert!(queue.can_start_immediately());
    assert!(!queue.remove_running("t1"));
}

#[test]
fn add_running_is_idempotent_per_task() {
    let queue = AdmissionQueue::new(2);
    queue.add_running("t1");
    queue.add_running("t1");
    assert_eq!(queue.status().running.len(), 1);
}

#[test]
fn try_start_respects_budget() {
    let queue = AdmissionQueue::new(1);
    assert!(queue.try_start("t1"));
    assert!(!queue.try_start("t2"));
    assert!(queue.is_running("t1"));
    assert!(!queue.is_running("t2"));
}

#[test]
fn try_start_never_counts_a_task_twice() {
    let queue = AdmissionQueue::new(2);
    assert!(queue.try_start("t1"));
    assert!(!queue.try_start("t1"));
    assert_eq!(queue.status().running, vec!["t1".to_owned()]);
    assert!(queue.can_start_immediately());
}

#[test]
fn admit_starts_then_queues_and_refuses_repeats() {
    let queue = AdmissionQueue::new(1);
    assert_eq!(queue.admit("a", "proj", 0), Admission::Started);
    assert_eq!(queue.admit("a", "proj", 0), Admission::Duplicate);

    let Admission::Queued(id) = queue.admit("b", "proj", 0) else {
        panic!("expected b to wait");
    };
    assert_eq!(queue.admit("b", "proj", 5), Admission::Duplicate);

    let status = queue.status();
    assert_eq!(status.running, vec!["a".to_owned()]);
    assert_eq!(status.pending.len(), 1);
    assert_eq!(status.pending[0].id, id);
}

#[test]
fn max_concurrent_is_clamped_to_one() {
    let queue = AdmissionQueue::new(0);
    assert_eq!(queue.status().max_concurrent, 1);

    queue.set_max_concurrent(0);
    assert_eq!(queue.status().max_concurrent, 1);

    queue.set_max_concurrent(4);
    assert_eq!(queue.status().max_concurrent, 4);
}

#[test]
fn shrinking_budget_blocks_new_starts() {
    let queue = AdmissionQueue::new(3);
    queue.add_running("t1");
    queue.add_running("t2");
    queue.set_max_concurrent(2);
    assert!(!queue.can_start_immediately());
}

// ── Notifications ────────────────────────────────────────────

#[test]
fn every_mutation_publishes_change() {
    let queue = AdmissionQueue::new(1);
    let seen: Arc<Mutex<Vec<QueueChanged>>> = Arc::default();
    let sink = Arc::clone(&seen);
    queue.on_change(move |change| {
        sink.lock().unwrap().push(*change);
        Ok(())
    });

    let id = queue.enqueue("t1", "proj", 0);
    queue.add_running("t0");
    queue.set_max_concurrent(2);
    queue.remove(&id);
    queue.remove_running("t0");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(
        seen[0],
        QueueChanged {
            pending: 1,
            running: 0,
            max_concurrent: 1
        }
    );
    assert_eq!(seen[2].max_concurrent, 2);
    assert_eq!(
        seen[4],
        QueueChanged {
            pending: 0,
            running: 0,
            max_concurrent: 2
        }
    );
}

#[test]
fn no_op_mutations_do_not_publish() {
    let queue = AdmissionQueue::new(1);
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    queue.on_change(move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    assert!(queue.dequeue().is_none());
    assert!(!queue.remove("missing"));
    assert!(!queue.remove_running("missing"));
    assert_eq!(*count.lock().unwrap(), 0);
}

#[test]
fn failing_listener_does_not_block_others() {
    let queue = AdmissionQueue::new(1);
    queue.on_change(|_| Err(agent_shepherd::AppError::Notify("boom".into())));
    let hits = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&hits);
    queue.on_change(move |_| {
        *sink.lock().unwrap() += 1;
        Ok(())
    });

    queue.enqueue("t", "proj", 0);
    assert_eq!(*hits.lock().unwrap(), 1);
}
