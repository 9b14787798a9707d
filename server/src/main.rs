#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunnelforge
//!
//! A PTY-backed terminal session runtime. Exposes HTTP, WebSocket, SSE, and
//! local Unix-domain IPC transports for creating, attaching to, and
//! controlling interactive shell sessions, all protected by a pre-shared
//! API key (except `/health`).

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tunnelforge::{
    build_router,
    config::Config,
    events::{EventBus, EventKind},
    sessions::{self, SessionManager},
    state::AppState,
};

/// A PTY-backed terminal session runtime.
#[derive(Parser)]
#[command(name = "tunnelforge", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    run_server(cli.config.as_deref()).await;
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunnelforge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set TUNNELFORGE_API_KEY or update config");
    }

    let control_root = std::path::PathBuf::from(&config.server.control_root);
    if let Err(e) = sessions::ensure_control_root(&control_root).await {
        tracing::error!("Failed to create control root {}: {e}", control_root.display());
        std::process::exit(1);
    }

    let events = EventBus::new();
    let session_manager = SessionManager::new(
        control_root,
        events.clone(),
        config.server.max_sessions,
        config.server.session_buffer_size,
        config.ipc.socket_mode,
    );
    session_manager.restore_on_startup().await;

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        sessions: session_manager,
        events,
        sse_connections: Arc::new(AtomicU32::new(0)),
    };

    let app = build_router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    state.events.publish(EventKind::ServerUp, None, json!({})).await;
    info!("Server ready");

    let sweep_mgr = state.sessions.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_mgr.cleanup_exited().await;
            sweep_mgr.sweep_activity().await;
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    state.events.publish(EventKind::ServerDown, None, json!({})).await;
    sweep_task.abort();
    state.sessions.kill_all().await;
    info!("Goodbye");
}
