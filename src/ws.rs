//! The `/ws/chat` endpoint. The first frame on a new connection decides its
//! role: `agent_auth` or `user_join`; anything else closes the socket. Each
//! connection gets a writer task draining its outbound queue so registry
//! operations never touch the socket directly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AppState, JoinPayload, Outbound};
use crate::{auth, registry};

/// Per-frame write deadline. A peer that stops reading only stalls its own
/// writer task, and gets cut off here.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_UNSUPPORTED: u16 = 1003;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn_id = registry::register_connection(&state, tx).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(payload) => {
                    let send = ws_sender.send(Message::Text(payload.into()));
                    match tokio::time::timeout(SEND_TIMEOUT, send).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                Outbound::Close { code, reason } => {
                    let close = ws_sender.send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })));
                    let _ = tokio::time::timeout(SEND_TIMEOUT, close).await;
                    break;
                }
            }
        }
    });

    if let Some(initial) = next_text(&mut ws_receiver).await {
        let envelope: Value = serde_json::from_str(&initial).unwrap_or(Value::Null);
        match envelope.get("type").and_then(Value::as_str) {
            Some("agent_auth") => {
                let token = envelope.get("token").and_then(Value::as_str).unwrap_or("");
                match auth::verify_agent_token(&state, token).await {
                    Some(identity) => {
                        registry::connect_agent(&state, conn_id, identity).await;
                        agent_loop(&state, conn_id, &mut ws_receiver).await;
                    }
                    None => {
                        warn!(conn_id, "agent auth failed, closing connection");
                        request_close(&state, conn_id, CLOSE_POLICY_VIOLATION, "invalid token")
                            .await;
                    }
                }
            }
            Some("user_join") => {
                let join: JoinPayload = serde_json::from_value(envelope).unwrap_or_default();
                registry::connect_guest(&state, conn_id, join).await;
                guest_loop(&state, conn_id, &mut ws_receiver).await;
            }
            other => {
                debug!(conn_id, message_type = ?other, "rejecting connection");
                request_close(
                    &state,
                    conn_id,
                    CLOSE_UNSUPPORTED,
                    "invalid initial message type",
                )
                .await;
            }
        }
    }

    registry::disconnect(&state, conn_id).await;
    let _ = send_task.await;
}

/// Next text frame, or `None` once the peer closed or the read failed.
async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => return Some(text.to_string()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn agent_loop(state: &Arc<AppState>, conn_id: usize, receiver: &mut SplitStream<WebSocket>) {
    while let Some(text) = next_text(receiver).await {
        let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match envelope.get("type").and_then(Value::as_str) {
            Some("agent_message") => {
                if let Some(message) = envelope.get("message").and_then(Value::as_str) {
                    registry::route_agent_message(state, conn_id, message).await;
                }
            }
            Some("agent_typing") => {
                let typing = envelope
                    .get("typing")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                registry::route_typing(state, conn_id, typing).await;
            }
            other => {
                debug!(conn_id, message_type = ?other, "ignoring unknown agent frame");
            }
        }
    }
}

async fn guest_loop(state: &Arc<AppState>, conn_id: usize, receiver: &mut SplitStream<WebSocket>) {
    while let Some(text) = next_text(receiver).await {
        let Ok(envelope) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        match envelope.get("type").and_then(Value::as_str) {
            Some("user_message") => {
                if let Some(message) = envelope.get("message").and_then(Value::as_str) {
                    let timestamp = envelope
                        .get("timestamp")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    registry::route_guest_message(state, conn_id, message, timestamp).await;
                }
            }
            other => {
                debug!(conn_id, message_type = ?other, "ignoring unknown guest frame");
            }
        }
    }
}

/// Hand the connection's writer a close frame; actual registry teardown runs
/// when the socket winds down.
async fn request_close(state: &Arc<AppState>, conn_id: usize, code: u16, reason: &str) {
    let sender = {
        let reg = state.registry.lock().await;
        reg.clients.get(&conn_id).cloned()
    };
    if let Some(sender) = sender {
        let _ = sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}
