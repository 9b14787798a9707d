//! `vt` — local terminal forwarder for tunnelforge.
//!
//! Creates a new session (or attaches to an existing one) over HTTP, then
//! connects to its Unix-domain IPC socket and pumps stdio through it:
//! keystrokes go out as `STDIN_DATA` frames, PTY output comes back as
//! `OUTPUT_DATA` frames, and local window resizes are forwarded as
//! `CONTROL_CMD` frames. Exits with the remote command's exit code.

mod client;
mod config;
mod ipc;
mod terminal;

use std::path::PathBuf;

use clap::Parser;

use client::TunnelforgeClient;

/// Terminal size used when the local terminal's size can't be determined.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Create or attach to a tunnelforge session and forward this terminal to it.
#[derive(Parser)]
#[command(name = "vt", version)]
struct Cli {
    /// Attach to an existing session instead of creating a new one.
    #[arg(long)]
    session: Option<String>,

    /// Spawn the server's default shell instead of a specific command.
    #[arg(long)]
    shell: bool,

    /// Override the server URL (defaults to TUNNELFORGE_URL or localhost).
    #[arg(long)]
    url: Option<String>,

    /// Override the session control-root directory used to locate IPC sockets.
    #[arg(long)]
    control_root: Option<String>,

    /// Command and arguments to run in the new session.
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("vt: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32, String> {
    let cfg = config::load_config(cli.url, cli.control_root)?;
    let http = TunnelforgeClient::new(cfg.base_url, cfg.api_key);

    let (cols, rows) = terminal::current_size();

    let session = if let Some(id) = &cli.session {
        http.get_session(id).await.map_err(|e| e.to_string())?
    } else {
        let command = if cli.shell || cli.command.is_empty() {
            None
        } else {
            Some(cli.command.as_slice())
        };
        http.create_session(command, None, cols, rows)
            .await
            .map_err(|e| e.to_string())?
    };

    let socket_path = ipc_socket_path(&cfg.control_root, &session.id);
    let (mut read_half, mut write_half) = ipc::connect(&socket_path)
        .await
        .map_err(|e| format!("failed to connect to session IPC socket: {e}"))?;

    let _raw_guard = terminal::RawModeGuard::enable().map_err(|e| format!("failed to set raw mode: {e}"))?;

    let mut resize_rx = terminal::spawn_resize_watcher();
    let mut signals = forward_signals();

    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            use tokio::io::AsyncReadExt;
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if ipc::write_frame(&mut write_half, ipc::TYPE_STDIN_DATA, &buf[..n])
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });

    let exit_code = loop {
        tokio::select! {
            frame = ipc::read_frame(&mut read_half) => {
                match frame {
                    Ok(Some((ipc::TYPE_OUTPUT_DATA, payload))) => {
                        use tokio::io::AsyncWriteExt;
                        let mut stdout = tokio::io::stdout();
                        if stdout.write_all(&payload).await.is_err() || stdout.flush().await.is_err() {
                            break fetch_exit_code(&http, &session.id).await;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break fetch_exit_code(&http, &session.id).await,
                }
            }
            Some((cols, rows)) = resize_rx.recv() => {
                let _ = ipc_resize(&socket_path, cols, rows).await;
            }
            Some(sig) = signals.recv() => {
                let _ = ipc_signal(&socket_path, sig).await;
            }
        }
    };

    stdin_task.abort();
    println!();
    Ok(exit_code)
}

fn ipc_socket_path(control_root: &std::path::Path, session_id: &str) -> PathBuf {
    control_root.join(session_id).join("ipc.sock")
}

async fn ipc_resize(socket_path: &std::path::Path, cols: u16, rows: u16) -> std::io::Result<()> {
    let (_r, mut w) = ipc::connect(socket_path).await?;
    ipc::write_frame(&mut w, ipc::TYPE_CONTROL_CMD, &ipc::resize_command(cols, rows)).await
}

async fn ipc_signal(socket_path: &std::path::Path, signal: i32) -> std::io::Result<()> {
    let (_r, mut w) = ipc::connect(socket_path).await?;
    ipc::write_frame(&mut w, ipc::TYPE_CONTROL_CMD, &ipc::kill_command(signal)).await
}

async fn fetch_exit_code(http: &TunnelforgeClient, id: &str) -> i32 {
    http.get_session(id)
        .await
        .ok()
        .and_then(|s| s.exit_code)
        .unwrap_or(-1)
}

/// Forward SIGINT/SIGTERM received by `vt` itself to the remote session.
fn forward_signals() -> tokio::sync::mpsc::Receiver<i32> {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            tokio::select! {
                _ = sigint.recv() => { if tx.send(libc::SIGINT).await.is_err() { return; } }
                _ = sigterm.recv() => { if tx.send(libc::SIGTERM).await.is_err() { return; } }
            }
        }
    });
    rx
}
