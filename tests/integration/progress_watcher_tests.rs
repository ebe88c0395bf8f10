//! Directory watching with debounced, incremental delivery.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use agent_shepherd::models::progress::ProgressBatch;
use agent_shepherd::progress::ProgressWatcher;

fn line(tool: &str) -> String {
    format!(r#"{{"type":"tool_use","timestamp":"2026-03-01T10:00:00Z","tool":"{tool}"}}"#) + "\n"
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn collect(watcher: &ProgressWatcher) -> mpsc::UnboundedReceiver<ProgressBatch> {
    let (tx, rx) = mpsc::unbounded_channel();
    watcher.on_batch(move |batch| {
        let _ = tx.send(batch.clone());
        Ok(())
    });
    rx
}

/// Receive batches until `want` records have arrived.
async fn records(rx: &mut mpsc::UnboundedReceiver<ProgressBatch>, want: usize) -> Vec<ProgressBatch> {
    let mut batches = Vec::new();
    let mut total = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while total < want {
            let batch = rx.recv().await.expect("channel open");
            total += batch.records.len();
            batches.push(batch);
        }
    })
    .await
    .expect("timed out waiting for progress");
    batches
}

#[tokio::test]
async fn appended_lines_are_delivered_once() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = ProgressWatcher::start(dir.path(), Duration::from_millis(30)).unwrap();
    let mut rx = collect(&watcher);
    let path = dir.path().join("task-7.jsonl");

    append(&path, &line("Read"));
    let first = records(&mut rx, 1).await;
    assert_eq!(first[0].task_id, "task-7");
    assert_eq!(first[0].path, path);

    append(&path, &format!("{}not json\n{}", line("Edit"), line("Bash")));
    let second = records(&mut rx, 2).await;
    let tools: Vec<String> = second
        .iter()
        .flat_map(|b| b.records.iter())
        .map(|r| match r {
            agent_shepherd::models::progress::ProgressRecord::ToolUse { tool, .. } => tool.clone(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(tools, vec!["Edit", "Bash"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "no duplicate delivery");
    watcher.stop();
}

#[tokio::test]
async fn burst_of_writes_is_coalesced() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = ProgressWatcher::start(dir.path(), Duration::from_millis(300)).unwrap();
    let mut rx = collect(&watcher);
    let path = dir.path().join("burst.jsonl");

    for i in 0..5 {
        append(&path, &line(&format!("tool-{i}")));
    }
    let batches = records(&mut rx, 5).await;
    assert_eq!(batches.len(), 1, "debounce merges the burst");
    watcher.stop();
}

#[tokio::test]
async fn non_progress_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = ProgressWatcher::start(dir.path(), Duration::from_millis(20)).unwrap();
    let mut rx = collect(&watcher);

    append(&dir.path().join("task.log"), &line("Read"));
    append(&dir.path().join("hooks.json"), "{}");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    watcher.stop();
}

#[tokio::test]
async fn recreated_file_is_read_from_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = ProgressWatcher::start(dir.path(), Duration::from_millis(20)).unwrap();
    let mut rx = collect(&watcher);
    let path = dir.path().join("again.jsonl");

    append(&path, &format!("{}{}", line("A"), line("B")));
    records(&mut rx, 2).await;

    std::fs::remove_file(&path).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    append(&path, &line("C"));
    let batches = records(&mut rx, 1).await;
    assert_eq!(batches[0].records.len(), 1);
}

#[tokio::test]
async fn stop_halts_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let watcher = ProgressWatcher::start(dir.path(), Duration::from_millis(20)).unwrap();
    let mut rx = collect(&watcher);
    watcher.stop();
    watcher.stop();

    append(&dir.path().join("late.jsonl"), &line("Read"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}
