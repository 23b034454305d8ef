//! WebSocket transport
//!
//! One JSON object per message, bidirectional. Requests are handled
//! sequentially; notifications for any session named in a request are
//! forwarded on the same socket. Teardown drops the subscriptions but does
//! not touch running processes or PTYs.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use rexd_core::events::SubscriptionGuard;
use rexd_core::protocol::Request;

use crate::server::Service;

/// Upgrade handler registered on the configured WS path.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<Arc<Service>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: Arc<Service>) {
    info!("websocket connection established");
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let mut subscriptions: HashMap<String, SubscriptionGuard> = HashMap::new();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(raw) = outbound else { break };
                if sender.send(Message::Text(raw)).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(req) = serde_json::from_str::<Request>(&text) else {
                            debug!("malformed websocket request, closing");
                            break;
                        };
                        let wants_response = req.id.is_some();
                        let session_hint = req
                            .params
                            .get("session_id")
                            .and_then(|value| value.as_str())
                            .map(ToString::to_string);

                        let resp = service.handle(req).await;
                        if wants_response {
                            let Ok(raw) = serde_json::to_string(&resp) else { break };
                            if sender.send(Message::Text(raw)).await.is_err() {
                                break;
                            }
                        }

                        if let Some(session_id) = session_hint {
                            if !subscriptions.contains_key(&session_id) {
                                let (mut notifications, guard) =
                                    service.bus().subscribe(&session_id);
                                subscriptions.insert(session_id.clone(), guard);
                                debug!(session_id, "websocket subscribed");
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
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(%err, "websocket receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("websocket connection ended");
}
