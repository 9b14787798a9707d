//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::events::EventBus;
use crate::sessions::SessionManager;

/// Shared application state for the tunnelforge server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Manages the pool of PTY-backed sessions.
    pub sessions: SessionManager,
    /// Server-wide lifecycle event bus, fed by the session manager and
    /// drained by every `/events` SSE subscriber.
    pub events: EventBus,
    /// Current number of SSE connections, for connection limiting.
    pub sse_connections: Arc<AtomicU32>,
}
