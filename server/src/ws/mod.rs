//! WebSocket gateway (C8).
//!
//! `GET /ws?session={id}` upgrades to a per-session attachment. Any number
//! of attachments can exist concurrently: output is broadcast to all of
//! them, and each attachment's input is serialized into the session's
//! single stdin writer by server-side arrival order (§4.8).
//!
//! Wire format: JSON-over-text for control messages, binary frames for raw
//! PTY output.
//!
//! - Client → server: `{type: "input", data}`, `{type: "resize", cols, rows}`, `{type: "ping"}`.
//! - Server → client: binary output frames; `{type: "exit", code}`; `{type: "resize", cols, rows}`; `{type: "pong"}`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::sessions::session::{ResizeSource, SessionHandle};
use crate::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    pub session: String,
}

/// `GET /ws?session={id}` — WebSocket upgrade handler. Rejects connections
/// whose `Origin` header is outside the configured allow-list (§4.8).
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state.config.cors.allowed_origins.is_empty()
            && !state.config.cors.allowed_origins.iter().any(|o| o == origin)
        {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let Some(session) = state.sessions.get(&query.session).await else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    ws.on_upgrade(move |socket| handle_ws(socket, session))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
}

async fn handle_ws(socket: WebSocket, session: Arc<SessionHandle>) {
    let (mut sink, mut stream) = socket.split();

    let buffer = Arc::clone(&session.buffer);
    let notify = buffer.lock().await.notifier();
    let mut since = buffer.lock().await.next_seq().saturating_sub(1);

    let output_session = Arc::clone(&session);
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<Message>(256);
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let feeder_tx = out_tx.clone();
    let feeder_session = Arc::clone(&output_session);
    let feeder_task = tokio::spawn(async move {
        loop {
            let (entries, _dropped) = buffer.lock().await.read_since(since);
            for entry in entries {
                since = entry.seq;
                if feeder_tx.send(Message::Binary(entry.data.into())).await.is_err() {
                    return;
                }
            }
            if !feeder_session.is_running().await {
                let record = feeder_session.snapshot().await;
                let code = record.exit_code.unwrap_or(-1);
                let _ = feeder_tx
                    .send(Message::Text(json!({"type": "exit", "code": code}).to_string().into()))
                    .await;
                let _ = feeder_tx.send(Message::Close(None)).await;
                return;
            }
            notify.notified().await;
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_client_text(&session, &text, &out_tx).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    feeder_task.abort();
    forward_task.abort();
    info!(session_id = %session.id, "WebSocket attachment detached");
}

async fn handle_client_text(session: &Arc<SessionHandle>, text: &str, out_tx: &tokio::sync::mpsc::Sender<Message>) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(ClientMessage::Input { data }) => {
            if let Err(e) = session.write_stdin(data.as_bytes()).await {
                warn!(session_id = %session.id, error = %e, "WS input rejected");
            }
        }
        Ok(ClientMessage::Resize { cols, rows }) => {
            match session.resize(cols, rows, ResizeSource::Browser).await {
                Ok(true) => {
                    let _ = out_tx
                        .send(Message::Text(json!({"type": "resize", "cols": cols, "rows": rows}).to_string().into()))
                        .await;
                }
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "WS resize failed"),
            }
        }
        Ok(ClientMessage::Ping) => {
            let _ = out_tx.send(Message::Text(json!({"type": "pong"}).to_string().into())).await;
        }
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "malformed WS control message");
        }
    }
}

/// Render a raw JSON value as a text frame — used by tests and by callers
/// that already hold a constructed message.
#[cfg(test)]
fn render(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_input_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Input { data } if data == "ls\n"));
    }

    #[test]
    fn client_message_resize_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Resize { cols: 80, rows: 24 }));
    }

    #[test]
    fn exit_frame_shape() {
        let frame = json!({"type": "exit", "code": 0});
        assert_eq!(render(&frame), r#"{"code":0,"type":"exit"}"#);
    }
}
