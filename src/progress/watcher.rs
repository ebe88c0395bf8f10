//! Debounced tailing of progress files.
//!
//! A `notify` watcher on the progress directory forwards file events into
//! a tokio task. The task keeps one debounce timer per file (a new event
//! replaces the pending timer) and one read offset per file, and publishes
//! a [`ProgressBatch`] whenever a timer fires and new complete records are
//! found past the offset.

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use super::parser::{parse_chunk, task_id_from_path};
use crate::events::{EventBus, SubscriptionId};
use crate::models::progress::ProgressBatch;
use crate::{AppError, Result};

/// Per-file read offsets.
///
/// Offsets only move forward. A file that did not grow past its offset
/// yields nothing, so duplicate change notifications are harmless.
#[derive(Debug, Default)]
pub struct ProgressTail {
    offsets: HashMap<PathBuf, u64>,
}

impl ProgressTail {
    /// Empty cursor table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse whatever `path` gained since the last poll.
    ///
    /// Returns `Ok(None)` when `path` is not a progress file, did not grow,
    /// no longer exists, or the new bytes held no valid record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be read.
    pub fn poll_file(&mut self, path: &Path) -> Result<Option<ProgressBatch>> {
        let Some(task_id) = task_id_from_path(path) else {
            return Ok(None);
        };

        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget(path);
                return Ok(None);
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to stat {}: {err}",
                    path.display()
                )))
            }
        };
        let offset = self.offset(path);
        if size <= offset {
            return Ok(None);
        }

        let mut bytes = Vec::new();
        let read = File::open(path).and_then(|mut file| {
            file.seek(SeekFrom::Start(offset))?;
            file.take(size - offset).read_to_end(&mut bytes)
        });
        match read {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget(path);
                return Ok(None);
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        }
        self.offsets.insert(path.to_owned(), size);

        let parsed = parse_chunk(&bytes);
        debug!(
            task_id,
            bytes = bytes.len(),
            records = parsed.records.len(),
            malformed = parsed.malformed,
            "progress chunk parsed"
        );
        if parsed.records.is_empty() {
            return Ok(None);
        }
        Ok(Some(ProgressBatch {
            task_id,
            path: path.to_owned(),
            records: parsed.records,
        }))
    }

    /// Current offset for `path` (0 if never read).
    #[must_use]
    pub fn offset(&self, path: &Path) -> u64 {
        self.offsets.get(path).copied().unwrap_or(0)
    }

    /// Drop the offset for `path`.
    pub fn forget(&mut self, path: &Path) {
        self.offsets.remove(path);
    }

    /// Drop every offset.
    pub fn clear(&mut self) {
        self.offsets.clear();
    }
}

#[derive(Debug)]
enum Signal {
    Changed(PathBuf),
    Removed(PathBuf),
    Fire(PathBuf, u64),
}

/// Directory watcher publishing [`ProgressBatch`]es.
pub struct ProgressWatcher {
    dir: PathBuf,
    batches: Arc<EventBus<ProgressBatch>>,
    cancel: CancellationToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressWatcher {
    /// Start watching `dir` (created if absent), debouncing each file by
    /// `debounce`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `AppError::Io` if the directory cannot be created.
    /// - `AppError::Watch` if the OS watcher cannot be installed.
    pub fn start(dir: &Path, debounce: Duration) -> Result<Self> {
        let _span = info_span!("progress_watcher_start", dir = %dir.display()).entered();
        std::fs::create_dir_all(dir)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let events_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => forward(&events_tx, event),
                Err(err) => warn!(%err, "progress watcher error"),
            },
        )
        .map_err(|err| AppError::Watch(format!("failed to create watcher: {err}")))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Watch(format!("failed to watch {}: {err}", dir.display()))
            })?;

        let batches = Arc::new(EventBus::new("progress"));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            rx,
            tx,
            Arc::clone(&batches),
            debounce,
            cancel.clone(),
        ));
        info!(debounce_ms = debounce.as_millis(), "progress watcher started");

        Ok(Self {
            dir: dir.to_owned(),
            batches,
            cancel,
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
        })
    }

    /// Register a batch listener.
    pub fn on_batch<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProgressBatch) -> Result<()> + Send + Sync + 'static,
    {
        self.batches.subscribe(listener)
    }

    /// Stop watching: cancels pending timers and drops all offsets.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!(dir = %self.dir.display(), "progress watcher stopped");
        }
        // The task exits on its own once it sees the cancellation.
        drop(self.task.lock().unwrap_or_else(PoisonError::into_inner).take());
    }
}

impl Drop for ProgressWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn forward(tx: &mpsc::UnboundedSender<Signal>, event: Event) {
    let removed = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => return,
    };
    for path in event.paths {
        if task_id_from_path(&path).is_none() {
            continue;
        }
        let signal = if removed {
            Signal::Removed(path)
        } else {
            Signal::Changed(path)
        };
        // The receiver is gone only after stop(); late events are dropped.
        let _ = tx.send(signal);
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Signal>,
    tx: mpsc::UnboundedSender<Signal>,
    batches: Arc<EventBus<ProgressBatch>>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut tail = ProgressTail::new();
    let mut timers: HashMap<PathBuf, (u64, JoinHandle<()>)> = HashMap::new();
    let mut generation: u64 = 0;

    loop {
        let signal = tokio::select! {
            () = cancel.cancelled() => break,
            signal = rx.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };

        match signal {
            Signal::Changed(path) => {
                generation += 1;
                let fire_tx = tx.clone();
                let fire_path = path.clone();
                let this_generation = generation;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(debounce).await;
                    let _ = fire_tx.send(Signal::Fire(fire_path, this_generation));
                });
                if let Some((_, previous)) = timers.insert(path, (generation, timer)) {
                    previous.abort();
                }
            }
            Signal::Removed(path) => {
                if let Some((_, timer)) = timers.remove(&path) {
                    timer.abort();
                }
                tail.forget(&path);
                debug!(path = %path.display(), "progress file removed");
            }
            Signal::Fire(path, fired) => {
                // A newer event rescheduled this file; its own timer will fire.
                if timers.get(&path).map(|(current, _)| *current) != Some(fired) {
                    continue;
                }
                timers.remove(&path);
                match tail.poll_file(&path) {
                    Ok(Some(batch)) => {
                        batches.publish(&batch);
                    }
                    Ok(None) => {}
                    Err(err) => warn!(path = %path.display(), %err, "failed to tail progress file"),
                }
            }
        }
    }

    for (_, (_, timer)) in timers.drain() {
        timer.abort();
    }
    tail.clear();
    debug!("progress watcher task exited");
}
