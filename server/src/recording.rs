//! Recording writer (C2).
//!
//! An append-only, totally-ordered log per session, plus the manifest and
//! activity-snapshot files that make up a session directory (§6):
//!
//! ```text
//! <controlRoot>/<shortId>/
//!   manifest.json     {id, command[], workingDir, name, status, cols, rows, pid?, createdAt, exitCode?}
//!   recording.log     append-only event log
//!   ipc.sock          Unix-domain stream socket (created separately by the IPC server, C7)
//!   activity.json     {isActive, specificStatus?, timestamp}  (rewritten on change only)
//! ```
//!
//! `recording.log` is human-diagnosable newline-delimited JSON: the first
//! line is a header object, each following line is a `[tSeconds, kind, data]`
//! array where `kind ∈ {"o","i","r","x"}`. Output/input bytes are base64
//! encoded so the log stays valid UTF-8 text regardless of what the child
//! writes to its terminal.

use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::error;

use crate::activity::SpecificStatus;

const BASE64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Header written as the first line of `recording.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub command: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "startedAt")]
    pub started_at: u64,
    /// A short excerpt of the child's environment, for diagnostics only.
    #[serde(default)]
    pub env_excerpt: Vec<String>,
}

/// One record kind, matching the wire `kind` tag exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Output,
    Input,
    Resize,
    Exit,
}

impl RecordKind {
    fn tag(self) -> &'static str {
        match self {
            RecordKind::Output => "o",
            RecordKind::Input => "i",
            RecordKind::Resize => "r",
            RecordKind::Exit => "x",
        }
    }
}

/// A pending record sent to the background writer task.
enum Record {
    Bytes(RecordKind, Vec<u8>),
    Resize { cols: u16, rows: u16 },
    Exit(i32),
}

/// Append-only recording writer for a single session. Writes are
/// single-producer (the session's own tasks); close is idempotent.
pub struct Recording {
    tx: mpsc::Sender<Record>,
}

impl Recording {
    /// Open (or create) the session directory and recording log, writing the
    /// header immediately.
    pub async fn open(
        dir: &Path,
        command: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir).await?;
        let path = recording_log_path(dir);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        #[allow(clippy::cast_possible_truncation)]
        let started_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let header = RecordingHeader {
            version: 1,
            command: command.to_vec(),
            cols,
            rows,
            started_at,
            env_excerpt: vec![format!("PATH={}", std::env::var("PATH").unwrap_or_default())],
        };
        let line = serde_json::to_string(&header).expect("serialize header");
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        let (tx, rx) = mpsc::channel(4096);
        let opened_at = Instant::now();
        tokio::spawn(writer_task(file, rx, opened_at));

        Ok(Recording { tx })
    }

    /// Append an `output` record. Never blocks the caller on disk I/O (the
    /// channel send only waits on backpressure from the writer task, which
    /// itself never blocks the PTY read-pump it's downstream of).
    pub async fn output(&self, data: &[u8]) {
        let _ = self.tx.send(Record::Bytes(RecordKind::Output, data.to_vec())).await;
    }

    /// Append an `input` record with bytes identical to what was accepted.
    pub async fn input(&self, data: &[u8]) {
        let _ = self.tx.send(Record::Bytes(RecordKind::Input, data.to_vec())).await;
    }

    /// Append a `resize` record. Must be written before any subsequent
    /// output record (§5 ordering guarantee 2) — callers serialize through
    /// the session's own mutex before calling this.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let _ = self.tx.send(Record::Resize { cols, rows }).await;
    }

    /// Append the terminal `exit` record. Idempotent from the caller's
    /// perspective: the session state machine calls this at most once.
    pub async fn exit(&self, code: i32) {
        let _ = self.tx.send(Record::Exit(code)).await;
    }

    /// A no-op recording for sessions recovered read-only from disk: the
    /// channel has no receiver, so sends are silently dropped.
    pub fn closed() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Recording { tx }
    }
}

async fn writer_task(mut file: fs::File, mut rx: mpsc::Receiver<Record>, opened_at: Instant) {
    while let Some(record) = rx.recv().await {
        let t = opened_at.elapsed().as_secs_f64();
        let line = match record {
            Record::Bytes(kind, data) => {
                json!([t, kind.tag(), BASE64.encode(&data)])
            }
            Record::Resize { cols, rows } => {
                json!([t, RecordKind::Resize.tag(), { "cols": cols, "rows": rows }])
            }
            Record::Exit(code) => {
                json!([t, RecordKind::Exit.tag(), code])
            }
        };
        let Ok(text) = serde_json::to_string(&line) else {
            continue;
        };
        if file.write_all(text.as_bytes()).await.is_err() || file.write_all(b"\n").await.is_err() {
            error!("recording log write failed, closing writer");
            return;
        }
        if file.flush().await.is_err() {
            error!("recording log flush failed, closing writer");
            return;
        }
    }
}

/// Session manifest: immutable fields plus the last-known mutable ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub command: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: String,
    pub name: Option<String>,
    pub status: String,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
}

/// Write (or overwrite) `manifest.json`. Called synchronously on every
/// mutation per §4.6.
pub async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), std::io::Error> {
    let path = manifest_path(dir);
    let body = serde_json::to_vec_pretty(manifest).expect("serialize manifest");
    fs::write(path, body).await
}

pub async fn read_manifest(dir: &Path) -> Result<Manifest, std::io::Error> {
    let body = fs::read(manifest_path(dir)).await?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Activity snapshot, rewritten only on change per §6.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActivitySnapshot {
    #[serde(rename = "isActive")]
    pub is_active: bool,
    #[serde(rename = "specificStatus", skip_serializing_if = "Option::is_none")]
    pub specific_status: Option<SpecificStatus>,
    pub timestamp: u64,
}

pub async fn write_activity_snapshot(dir: &Path, snapshot: &ActivitySnapshot) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(snapshot).expect("serialize activity snapshot");
    fs::write(activity_path(dir), body).await
}

pub fn manifest_path(dir: &Path) -> PathBuf {
    dir.join("manifest.json")
}

pub fn recording_log_path(dir: &Path) -> PathBuf {
    dir.join("recording.log")
}

pub fn activity_path(dir: &Path) -> PathBuf {
    dir.join("activity.json")
}

pub fn ipc_socket_path(dir: &Path) -> PathBuf {
    dir.join("ipc.sock")
}

/// Parsed record from a `recording.log`, for recovery and diagnostics.
pub struct ParsedRecord {
    pub t_seconds: f64,
    pub kind: char,
    pub value: Value,
}

/// Read and parse an existing `recording.log`: returns the header and every
/// subsequent record. Corrupt lines are skipped, matching the recovery
/// policy used for crash-recovered sessions.
pub async fn read_recording_log(
    dir: &Path,
) -> Result<(RecordingHeader, Vec<ParsedRecord>), std::io::Error> {
    let file = fs::File::open(recording_log_path(dir)).await?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header_line = lines
        .next_line()
        .await?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty recording log"))?;
    let header: RecordingHeader = serde_json::from_str(&header_line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut records = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        if arr.len() != 3 {
            continue;
        }
        let Some(t_seconds) = arr[0].as_f64() else { continue };
        let Some(kind) = arr[1].as_str().and_then(|s| s.chars().next()) else {
            continue;
        };
        records.push(ParsedRecord {
            t_seconds,
            kind,
            value: arr[2].clone(),
        });
    }

    Ok((header, records))
}

/// Decode a base64 `o`/`i` record payload back to raw bytes.
pub fn decode_payload(value: &Value) -> Option<Vec<u8>> {
    let s = value.as_str()?;
    BASE64.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_round_trips_header_and_records() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("abc123");
        let rec = Recording::open(&dir, &["/bin/sh".to_string()], 80, 24).await.unwrap();
        rec.output(b"hello\n").await;
        rec.resize(120, 40).await;
        rec.input(b"echo hi\n").await;
        rec.exit(0).await;
        // Give the writer task a beat to flush.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (header, records) = read_recording_log(&dir).await.unwrap();
        assert_eq!(header.command, vec!["/bin/sh".to_string()]);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].kind, 'o');
        assert_eq!(decode_payload(&records[0].value).unwrap(), b"hello\n");
        assert_eq!(records[1].kind, 'r');
        assert_eq!(records[2].kind, 'i');
        assert_eq!(decode_payload(&records[2].value).unwrap(), b"echo hi\n");
        assert_eq!(records[3].kind, 'x');
        assert_eq!(records[3].value, json!(0));
    }
}
