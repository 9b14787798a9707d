//! IPC socket server (C7).
//!
//! Binds a Unix-domain stream socket inside each session's directory
//! (`ipc.sock`, §6) so the local `vt` forwarder can attach without going
//! through HTTP. Every frame is `{u32 length BE, u8 type, payload[length]}`.
//!
//! Receive types: `STDIN_DATA` (0x01), `CONTROL_CMD` (0x02, a JSON object),
//! `HEARTBEAT` (0x03, empty). Unrecognized types are skipped by consuming
//! exactly `length` bytes, so new types can be introduced without breaking
//! old clients. Output flows back to the client as `OUTPUT_DATA` (0x04)
//! frames, run through the session's title manager first so `titleMode`
//! can inject or strip OSC-2 sequences for this terminal-attached consumer.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::sessions::session::{ResizeSource, SessionHandle};

const TYPE_STDIN_DATA: u8 = 0x01;
const TYPE_CONTROL_CMD: u8 = 0x02;
const TYPE_HEARTBEAT: u8 = 0x03;
const TYPE_OUTPUT_DATA: u8 = 0x04;

/// Backpressure bound on buffered-but-unflushed input (§4.7).
const MAX_PENDING_INPUT: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
enum ControlCmd {
    Resize { cols: u16, rows: u16 },
    Kill { signal: Option<i32> },
    ResetSize,
}

/// Bind the session's IPC socket and accept connections until the session
/// exits. Each connection is handled on its own task so a long-lived `vt`
/// attachment doesn't starve the short control connections `vt` opens for
/// every resize/signal.
pub async fn serve(session: Arc<SessionHandle>, socket_path: &Path, socket_mode: u32) -> std::io::Result<()> {
    if socket_path.exists() {
        let _ = tokio::fs::remove_file(socket_path).await;
    }
    let listener = UnixListener::bind(socket_path)?;
    tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(socket_mode)).await?;

    loop {
        if !session.is_running().await {
            break;
        }
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "IPC accept failed");
                continue;
            }
        };
        info!(session_id = %session.id, "IPC client attached");
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(session, stream).await {
                warn!(error = %e, "IPC connection ended with error");
            }
        });
    }
    let _ = tokio::fs::remove_file(socket_path).await;
    Ok(())
}

async fn handle_connection(session: Arc<SessionHandle>, stream: UnixStream) -> std::io::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let buffer = Arc::clone(&session.buffer);
    let notify = buffer.lock().await.notifier();

    let output_session = Arc::clone(&session);
    let output_task = tokio::spawn(async move {
        let mut since = buffer.lock().await.next_seq().saturating_sub(1);
        loop {
            let (entries, _dropped) = buffer.lock().await.read_since(since);
            for entry in entries {
                since = entry.seq;
                let transformed = output_session.render_for_terminal(&entry.data).await;
                if write_frame(&mut write_half, TYPE_OUTPUT_DATA, &transformed).await.is_err() {
                    return;
                }
            }
            if !output_session.is_running().await {
                return;
            }
            notify.notified().await;
        }
    });

    let mut pending_input = 0usize;
    loop {
        let Some((frame_type, payload)) = read_frame(&mut read_half).await? else {
            break;
        };
        match frame_type {
            TYPE_STDIN_DATA => {
                pending_input += payload.len();
                if pending_input > MAX_PENDING_INPUT {
                    warn!(session_id = %session.id, "IPC input backpressure exceeded, dropping frame");
                    continue;
                }
                if let Err(e) = session.write_stdin(&payload).await {
                    warn!(session_id = %session.id, error = %e, "failed to forward stdin");
                }
                pending_input = pending_input.saturating_sub(payload.len());
            }
            TYPE_CONTROL_CMD => handle_control_cmd(&session, &payload).await,
            TYPE_HEARTBEAT => {}
            other => {
                warn!(session_id = %session.id, frame_type = other, "skipping unknown IPC frame type");
            }
        }
    }

    output_task.abort();
    Ok(())
}

async fn handle_control_cmd(session: &Arc<SessionHandle>, payload: &[u8]) {
    let Ok(cmd) = serde_json::from_slice::<ControlCmd>(payload) else {
        warn!(session_id = %session.id, "malformed CONTROL_CMD frame");
        return;
    };
    match cmd {
        ControlCmd::Resize { cols, rows } => {
            if let Err(e) = session.resize(cols, rows, ResizeSource::Api).await {
                warn!(session_id = %session.id, error = %e, "resize via IPC failed");
            }
        }
        ControlCmd::Kill { signal } => {
            let sig = signal.unwrap_or(libc::SIGTERM);
            if let Err(e) = session.send_signal(sig) {
                warn!(session_id = %session.id, error = %e, "signal via IPC failed");
            }
        }
        ControlCmd::ResetSize => {
            if let Err(e) = session
                .resize(crate::pty::DEFAULT_COLS, crate::pty::DEFAULT_ROWS, ResizeSource::Api)
                .await
            {
                warn!(session_id = %session.id, error = %e, "reset-size via IPC failed");
            }
        }
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut type_buf = [0u8; 1];
    reader.read_exact(&mut type_buf).await?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((type_buf[0], payload)))
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame_type: u8, payload: &[u8]) -> std::io::Result<()> {
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[frame_type]).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_cmd_resize_parses() {
        let json = serde_json::json!({"cmd": "resize", "cols": 100, "rows": 40});
        let cmd: ControlCmd = serde_json::from_value(json).unwrap();
        assert!(matches!(cmd, ControlCmd::Resize { cols: 100, rows: 40 }));
    }

    #[test]
    fn control_cmd_kill_defaults_signal_absent() {
        let json = serde_json::json!({"cmd": "kill"});
        let cmd: ControlCmd = serde_json::from_value(json).unwrap();
        match cmd {
            ControlCmd::Kill { signal } => assert!(signal.is_none()),
            _ => panic!("expected Kill"),
        }
    }
}
