//! REST endpoints for session management (C10).
//!
//! - `POST   /sessions`              — create a session
//! - `GET    /sessions`              — list sessions
//! - `GET    /sessions/{id}`         — get one session
//! - `DELETE /sessions/{id}`         — delete (idempotent)
//! - `POST   /sessions/{id}/resize`  — resize the PTY
//! - `POST   /sessions/{id}/reset-size` — reset to the default terminal size
//! - `POST   /sessions/{id}/input`   — send text or a named key
//! - `POST   /cleanup-exited`        — remove exited sessions past their grace period
//! - `POST   /sessions/bulk`         — create many sessions
//! - `POST   /bulk/delete`           — delete many sessions
//! - `POST   /bulk/resize`           — resize many sessions

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::pty::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::sessions::session::ResizeSource;
use crate::sessions::{BulkOutcome, CreateError, CreateOptions};
use crate::title::TitleMode;
use crate::AppState;

fn not_found(id: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": format!("session {id} not found")})))
}

fn not_running(id: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::CONFLICT, Json(json!({"error": format!("session {id} is not running")})))
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRequest {
    pub command: Option<Vec<String>>,
    #[serde(rename = "workingDir")]
    pub working_dir: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub name: Option<String>,
    #[serde(rename = "titleMode")]
    pub title_mode: Option<TitleMode>,
}

impl CreateRequest {
    fn into_options(self, default_shell: &str) -> CreateOptions {
        CreateOptions {
            command: self.command.unwrap_or_else(|| vec![default_shell.to_string()]),
            working_dir: self.working_dir,
            cols: self.cols,
            rows: self.rows,
            name: self.name,
            title_mode: self.title_mode,
        }
    }
}

fn create_error_status(err: &CreateError) -> StatusCode {
    match err {
        CreateError::LimitReached(_) | CreateError::SocketPathTooLong(_) | CreateError::InvalidSize { .. } => {
            StatusCode::BAD_REQUEST
        }
        CreateError::Session(_) | CreateError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `POST /sessions` — create a session.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let opts = req.into_options(&state.config.shell.default_shell);

    let handle = state.sessions.create(opts).await.map_err(|e| {
        let status = create_error_status(&e);
        (status, Json(json!({"error": e.to_string()})))
    })?;

    let record = handle.snapshot().await;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(record).unwrap_or_default())))
}

/// `GET /sessions` — list all sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let items = state.sessions.list().await;
    Json(json!({ "sessions": items }))
}

/// `GET /sessions/{id}` — fetch one session.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = state.sessions.get(&id).await.ok_or_else(|| not_found(&id))?;
    let record = session.snapshot().await;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

/// `DELETE /sessions/{id}` — delete a session. Idempotent: deleting an
/// already-absent session still returns 200.
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    state.sessions.delete(&id).await;
    Json(json!({ "ok": true, "id": id }))
}

// ─── Resize ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /sessions/{id}/resize` — resize the PTY. `api` resizes always win
/// the resize-source arbitration (§4.5).
pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = state.sessions.get(&id).await.ok_or_else(|| not_found(&id))?;
    if !session.is_running().await {
        return Err(not_running(&id));
    }
    let applied = state
        .sessions
        .resize(&id, req.cols, req.rows, ResizeSource::Api)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))))?;
    Ok(Json(json!({ "ok": true, "applied": applied, "cols": req.cols, "rows": req.rows })))
}

/// `POST /sessions/{id}/reset-size` — reset to the default terminal size.
pub async fn reset_size(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let session = state.sessions.get(&id).await.ok_or_else(|| not_found(&id))?;
    if !session.is_running().await {
        return Err(not_running(&id));
    }
    state
        .sessions
        .resize(&id, DEFAULT_COLS, DEFAULT_ROWS, ResizeSource::Api)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e}))))?;
    Ok(Json(json!({ "ok": true, "cols": DEFAULT_COLS, "rows": DEFAULT_ROWS })))
}

// ─── Input ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InputRequest {
    pub text: Option<String>,
    pub key: Option<String>,
}

/// Map a symbolic key name to its terminal escape sequence. Returns `None`
/// for any name outside the closed enumeration (§4.10) — the caller reports
/// this as `400 Bad Request`.
fn key_to_bytes(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "enter" => b"\r",
        "escape" => b"\x1b",
        "tab" => b"\t",
        "backspace" => b"\x7f",
        "delete" => b"\x1b[3~",
        "home" => b"\x1b[H",
        "end" => b"\x1b[F",
        "page_up" => b"\x1b[5~",
        "page_down" => b"\x1b[6~",
        "f1" => b"\x1bOP",
        "f2" => b"\x1bOQ",
        "f3" => b"\x1bOR",
        "f4" => b"\x1bOS",
        "f5" => b"\x1b[15~",
        "f6" => b"\x1b[17~",
        "f7" => b"\x1b[18~",
        "f8" => b"\x1b[19~",
        "f9" => b"\x1b[20~",
        "f10" => b"\x1b[21~",
        "f11" => b"\x1b[23~",
        "f12" => b"\x1b[24~",
        "ctrl_enter" => b"\n",
        "shift_enter" => b"\x1b[13;2u",
        "shift_tab" => b"\x1b[Z",
        _ => return None,
    })
}

/// `POST /sessions/{id}/input` — send raw text or a named key.
pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let bytes: Vec<u8> = match (req.text, req.key) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(key)) => key_to_bytes(&key)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, Json(json!({"error": format!("unknown key {key:?}")}))))?,
        (Some(_), Some(_)) => {
            return Err((StatusCode::BAD_REQUEST, Json(json!({"error": "specify either text or key, not both"}))));
        }
        (None, None) => {
            return Err((StatusCode::BAD_REQUEST, Json(json!({"error": "text or key is required"}))));
        }
    };

    state.sessions.write_stdin(&id, &bytes).await.map_err(|e| {
        if e.contains("not found") {
            not_found(&id)
        } else {
            not_running(&id)
        }
    })?;

    Ok(Json(json!({ "ok": true })))
}

// ─── Cleanup ─────────────────────────────────────────────────────────────────

/// `POST /cleanup-exited` — remove exited sessions past their grace period.
pub async fn cleanup_exited(State(state): State<AppState>) -> Json<Value> {
    let removed = state.sessions.cleanup_exited().await;
    Json(json!({ "count": removed.len(), "ids": removed }))
}

// ─── Bulk ────────────────────────────────────────────────────────────────────

fn outcome_json<T: Serialize>(outcome: &BulkOutcome<T>) -> Value {
    match &outcome.result {
        Ok(v) => json!({ "id": outcome.id, "ok": true, "result": v }),
        Err(e) => json!({ "id": outcome.id, "ok": false, "error": e }),
    }
}

/// `POST /sessions/bulk` — create many sessions; never aborts mid-batch.
pub async fn bulk_create(State(state): State<AppState>, Json(requests): Json<Vec<CreateRequest>>) -> Json<Value> {
    let opts = requests
        .into_iter()
        .map(|req| req.into_options(&state.config.shell.default_shell))
        .collect();
    let outcomes = state.sessions.bulk_create(opts).await;
    Json(json!({ "results": outcomes.iter().map(outcome_json).collect::<Vec<_>>() }))
}

#[derive(Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

/// `POST /bulk/delete` — delete many sessions.
pub async fn bulk_delete(State(state): State<AppState>, Json(req): Json<BulkDeleteRequest>) -> Json<Value> {
    let outcomes = state.sessions.bulk_delete(req.ids).await;
    Json(json!({ "results": outcomes.iter().map(outcome_json).collect::<Vec<_>>() }))
}

#[derive(Deserialize)]
pub struct BulkResizeEntry {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Deserialize)]
pub struct BulkResizeRequest {
    pub requests: Vec<BulkResizeEntry>,
}

/// `POST /bulk/resize` — resize many sessions.
pub async fn bulk_resize(State(state): State<AppState>, Json(req): Json<BulkResizeRequest>) -> Json<Value> {
    let requests = req.requests.into_iter().map(|e| (e.id, e.cols, e.rows)).collect();
    let outcomes = state.sessions.bulk_resize(requests).await;
    Json(json!({ "results": outcomes.iter().map(outcome_json).collect::<Vec<_>>() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_map_to_sequences() {
        assert_eq!(key_to_bytes("enter"), Some(&b"\r"[..]));
        assert_eq!(key_to_bytes("arrow_up"), Some(&b"\x1b[A"[..]));
        assert_eq!(key_to_bytes("f12"), Some(&b"\x1b[24~"[..]));
        assert_eq!(key_to_bytes("shift_tab"), Some(&b"\x1b[Z"[..]));
    }

    #[test]
    fn unknown_key_rejected() {
        assert_eq!(key_to_bytes("super_delete"), None);
    }
}
