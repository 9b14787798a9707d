#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunnelforge library — a PTY-backed terminal session runtime.
//!
//! This library exposes the building blocks the binary wires together:
//! - `pty` — process spawning and PTY allocation/resize/signal delivery
//! - `recording` — the per-session append-only log, manifest, and activity snapshot
//! - `activity` — output-based active/idle classification
//! - `title` — terminal title injection and cwd tracking
//! - `events` — the in-process typed event bus
//! - `sessions` — the session state machine and manager
//! - `ipc` — the per-session local Unix-domain socket server
//! - `ws` — the WebSocket attachment gateway
//! - `routes` — the HTTP/SSE control surface
//! - `config` — configuration loading
//! - `auth` — bearer-token authentication middleware
//! - `state` — shared `axum` application state

pub mod activity;
pub mod auth;
pub mod config;
pub mod events;
pub mod ipc;
pub mod pty;
pub mod recording;
pub mod router;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod title;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use events::EventBus;
pub use router::build_router;
pub use sessions::SessionManager;
pub use state::AppState;
