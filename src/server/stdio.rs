//! stdio transport
//!
//! Newline-delimited UTF-8 JSON, one object per line. Responses and
//! notifications share the output stream through a single writer task.
//! Whenever a request names a `session_id`, the connection lazily opens a
//! bus subscription for that session and forwards its notifications.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use rexd_core::events::SubscriptionGuard;
use rexd_core::protocol::Request;

use crate::server::Service;

/// Run the NDJSON loop until the input stream ends.
pub async fn run<R, W>(service: Arc<Service>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if output.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });

    let mut lines = BufReader::new(input).lines();
    let mut subscriptions: HashMap<String, SubscriptionGuard> = HashMap::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = serde_json::from_str(&line)?;
        let wants_response = req.id.is_some();
        let session_hint = req
            .params
            .get("session_id")
            .and_then(|value| value.as_str())
            .map(ToString::to_string);

        let resp = service.handle(req).await;
        if wants_response {
            if tx.send(serde_json::to_string(&resp)?).await.is_err() {
                break;
            }
        }

        if let Some(session_id) = session_hint {
            if !subscriptions.contains_key(&session_id) {
                let (mut notifications, guard) = service.bus().subscribe(&session_id);
                subscriptions.insert(session_id.clone(), guard);
                debug!(session_id, "stdio connection subscribed");
                let forward = tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = notifications.recv().await {
                        let Ok(raw) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if forward.send(raw).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    }

    // Closing the subscriptions ends the forwarders, which releases the
    // last writer handles and lets the writer task drain and stop.
    drop(subscriptions);
    drop(tx);
    let _ = writer.await;
    Ok(())
}
