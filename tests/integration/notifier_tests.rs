//! Webhook delivery against a local HTTP stub.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use agent_shepherd::models::alert::{AlertKind, SuggestedAction, WatchdogAlert};
use agent_shepherd::notifier::{AlertNotifier, WebhookNotifier};
use agent_shepherd::AppError;

fn stale_alert() -> WatchdogAlert {
    WatchdogAlert::new(
        AlertKind::Stale,
        "s1",
        "task-1",
        "no heartbeat for 16 minutes",
        SuggestedAction::RestartCheckpoint,
        Utc::now(),
    )
}

/// Read one request, headers plus `content-length` bytes of body.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Answer one request per entry of `statuses`, forwarding each request.
async fn serve(
    listener: TcpListener,
    statuses: Vec<&'static str>,
    seen: mpsc::UnboundedSender<String>,
) {
    for status in statuses {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        let _ = seen.send(request);
        let response =
            format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
    }
}

#[tokio::test]
async fn failed_delivery_is_retried_until_accepted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    tokio::spawn(serve(listener, vec!["500 Internal Server Error", "200 OK"], seen_tx));

    let (notifier, worker) = WebhookNotifier::start(&url).unwrap();
    notifier.notify(&stale_alert()).unwrap();

    let first = timeout(Duration::from_secs(10), seen.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(10), seen.recv()).await.unwrap().unwrap();
    assert!(first.starts_with("POST /hook"), "got {first:?}");
    assert!(second.starts_with("POST /hook"), "got {second:?}");
    assert!(second.contains(r#""type":"stale""#));
    assert!(second.contains(r#""taskId":"task-1""#));

    // The worker drains its queue and exits once every sender is gone.
    drop(notifier);
    timeout(Duration::from_secs(10), worker).await.unwrap().unwrap();
    assert!(seen.try_recv().is_err(), "accepted alert is not re-sent");
}

#[tokio::test]
async fn full_queue_is_reported_without_blocking() {
    // Bound but never accepted: the first post hangs, nothing drains.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (notifier, _worker) = WebhookNotifier::start(&url).unwrap();

    // No await between sends, so the worker never gets to run.
    let results: Vec<_> = (0..65).map(|_| notifier.notify(&stale_alert())).collect();

    assert!(results[..64].iter().all(Result::is_ok));
    assert!(matches!(results[64], Err(AppError::Notify(_))));
    drop(listener);
}

#[tokio::test]
async fn non_http_url_is_rejected() {
    let result = WebhookNotifier::start("ftp://example.invalid/hook");
    assert!(matches!(result, Err(AppError::Notify(_))));
}
