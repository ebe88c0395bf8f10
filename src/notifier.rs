//! Delivery of escalated watchdog alerts to an external endpoint.
//!
//! The watchdog hands alerts to an [`AlertNotifier`] without waiting for
//! delivery. [`WebhookNotifier`] queues them and posts each one as JSON
//! from a background task, retrying failed posts with exponential backoff.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::models::alert::WatchdogAlert;
use crate::{AppError, Result};

const QUEUE_CAPACITY: usize = 64;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

/// Receiver of escalated alerts.
pub trait AlertNotifier: Send + Sync {
    /// Accept `alert` for delivery. Must not block.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Notify` if the alert cannot be accepted.
    fn notify(&self, alert: &WatchdogAlert) -> Result<()>;
}

/// Posts alerts to a webhook URL through a bounded queue.
#[derive(Clone)]
pub struct WebhookNotifier {
    queue_tx: mpsc::Sender<WatchdogAlert>,
}

impl WebhookNotifier {
    /// Start the delivery task. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Notify` if the URL is not http(s) or the HTTP
    /// client cannot be built.
    pub fn start(url: &str) -> Result<(Self, JoinHandle<()>)> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(AppError::Notify(format!("unsupported webhook url: {url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AppError::Notify(format!("failed to build http client: {err}")))?;

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = Self::spawn_worker(client, url.to_owned(), queue_rx);
        info!(url, "webhook notifier started");
        Ok((Self { queue_tx }, worker))
    }

    fn spawn_worker(
        client: reqwest::Client,
        url: String,
        mut queue_rx: mpsc::Receiver<WatchdogAlert>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(alert) = queue_rx.recv().await {
                let mut backoff = INITIAL_RETRY_DELAY;
                for attempt in 1..=MAX_ATTEMPTS {
                    let result = client
                        .post(&url)
                        .json(&alert)
                        .send()
                        .await
                        .and_then(reqwest::Response::error_for_status);
                    match result {
                        Ok(_) => {
                            info!(kind = %alert.kind, session_id = %alert.session_id, "alert delivered");
                            break;
                        }
                        Err(err) if attempt == MAX_ATTEMPTS => {
                            warn!(%err, attempts = attempt, session_id = %alert.session_id, "giving up on alert delivery");
                        }
                        Err(err) => {
                            warn!(%err, attempt, delay = ?backoff, "alert delivery failed; retrying");
                            sleep(backoff).await;
                            backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                        }
                    }
                }
            }
            info!("webhook notifier task exiting");
        })
    }
}

impl AlertNotifier for WebhookNotifier {
    fn notify(&self, alert: &WatchdogAlert) -> Result<()> {
        self.queue_tx
            .try_send(alert.clone())
            .map_err(|err| AppError::Notify(format!("failed to enqueue alert: {err}")))
    }
}
