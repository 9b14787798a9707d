//! Server-Sent Events endpoints (C9).
//!
//! - `GET /events` — the server-wide lifecycle event stream (session starts,
//!   exits, renames, activity transitions, bells). No replay: a subscriber
//!   only observes events published after it attaches (§4.9).
//! - `GET /sessions/{id}/stream` — a per-session raw-output stream for
//!   read-only consumers that want `text/event-stream` instead of the
//!   WebSocket/IPC binary paths.

use std::convert::Infallible;
use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use serde_json::{json, Value};

use crate::AppState;

/// Maximum concurrent SSE connections before rejecting with 429.
const MAX_SSE_CONNECTIONS: u32 = 64;

/// Server-wide keep-alive interval (§4.9).
const KEEP_ALIVE_SECS: u64 = 30;

/// `GET /events` — server-wide lifecycle event stream.
pub async fn event_stream(State(state): State<AppState>) -> impl IntoResponse {
    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return Err((StatusCode::TOO_MANY_REQUESTS, "too many SSE connections"));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);

    let subscription = state.events.subscribe().await;
    let counter = state.sse_connections.clone();

    let stream = futures::stream::unfold(subscription, |subscription| async move {
        let event = subscription.recv().await;
        let wire = event.to_json();
        let event_type = wire["type"].as_str().unwrap_or("message").to_string();
        let data = serde_json::to_string(&wire).unwrap_or_default();
        let sse_event = Event::default().event(event_type).data(data);
        Some((Ok(sse_event), subscription))
    });

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter,
        decremented: false,
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS))))
}

/// `GET /sessions/{id}/stream` — per-session raw-output SSE stream.
///
/// Delivers every output chunk the session produces, from the moment of
/// attachment onward, as `data:` lines. No replay of output predating the
/// attachment beyond what the session's in-memory buffer still retains.
pub async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let session = state.sessions.get(&id).await.ok_or_else(|| {
        (StatusCode::NOT_FOUND, Json(json!({"error": "unknown session"})))
    })?;

    let current = state.sse_connections.load(Ordering::Relaxed);
    if current >= MAX_SSE_CONNECTIONS {
        return Err((StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "too many SSE connections"}))));
    }
    state.sse_connections.fetch_add(1, Ordering::Relaxed);
    let counter = state.sse_connections.clone();

    let buffer = std::sync::Arc::clone(&session.buffer);
    let notify = buffer.lock().await.notifier();
    let since = buffer.lock().await.next_seq().saturating_sub(1);

    let stream = futures::stream::unfold((buffer, notify, since, session), |(buffer, notify, mut since, session)| async move {
        loop {
            let (entries, _dropped) = buffer.lock().await.read_since(since);
            if let Some(entry) = entries.into_iter().next() {
                since = entry.seq;
                let data = String::from_utf8_lossy(&entry.data).into_owned();
                return Some((Ok(Event::default().data(data)), (buffer, notify, since, session)));
            }
            if !session.is_running().await {
                return None;
            }
            notify.notified().await;
        }
    });

    let stream = DropCounterStream {
        inner: Box::pin(stream),
        counter,
        decremented: false,
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(std::time::Duration::from_secs(KEEP_ALIVE_SECS))))
}

/// Wrapper that decrements the SSE connection counter when the stream ends
/// or is dropped, whichever happens first.
struct DropCounterStream<S> {
    inner: std::pin::Pin<Box<S>>,
    counter: std::sync::Arc<std::sync::atomic::AtomicU32>,
    decremented: bool,
}

impl<S: Stream<Item = Result<Event, Infallible>>> Stream for DropCounterStream<S> {
    type Item = Result<Event, Infallible>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let result = self.inner.as_mut().poll_next(cx);
        if let std::task::Poll::Ready(None) = &result {
            if !self.decremented {
                self.counter.fetch_sub(1, Ordering::Relaxed);
                self.decremented = true;
            }
        }
        result
    }
}

impl<S> Drop for DropCounterStream<S> {
    fn drop(&mut self) {
        if !self.decremented {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}
