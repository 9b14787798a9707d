//! Session state machine (C5).
//!
//! A [`SessionHandle`] owns one PTY-backed child process plus the
//! per-session collaborators that sit on its output path: the activity
//! detector (C3), the title manager (C4), the recording writer (C2), the
//! in-memory replay buffer, and a handle to the event bus (C11) for
//! lifecycle notifications. States are `starting -> running -> exited`;
//! there is no resurrection.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::activity::{ActivityDetector, ActivityState, SpecificStatus};
use crate::events::{EventBus, EventKind};
use crate::pty::{self, PtyPair, SpawnError};
use crate::recording::{self, ActivitySnapshot, Manifest, Recording};
use crate::title::{TitleManager, TitleMode};

use super::buffer::OutputBuffer;

/// Source of a resize request, used for "last resize wins with grace"
/// arbitration (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeSource {
    Browser,
    Terminal,
    Api,
}

/// Grace window within which a lower-priority resize source is dropped if
/// it contradicts the most recent winning source.
const RESIZE_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Errors surfaced to the HTTP/IPC/WS layers from session operations.
#[derive(Debug)]
pub enum SessionError {
    NotRunning,
    Spawn(SpawnError),
    Io(std::io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotRunning => write!(f, "session is not running"),
            SessionError::Spawn(e) => write!(f, "{e}"),
            SessionError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

/// Snapshot of a session's public-facing record, as returned by the HTTP
/// control surface (§4.10) and written to `manifest.json` (§4.6).
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub command: Vec<String>,
    #[serde(rename = "workingDir")]
    pub working_dir: String,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    pub cwd: String,
    #[serde(rename = "titleMode")]
    pub title_mode: TitleMode,
    #[serde(rename = "activityState")]
    pub activity_state: ActivityState,
}

/// A live (or archived, read-only) session.
pub struct SessionHandle {
    pub id: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub created_at: u64,
    pub dir: PathBuf,

    name: Mutex<Option<String>>,
    status: Mutex<SessionStatus>,
    pid: AtomicU32,
    pgid: AtomicU32,
    cols: AtomicU32,
    rows: AtomicU32,
    exit_code: AtomicI32,
    has_exit_code: std::sync::atomic::AtomicBool,

    last_resize: Mutex<Option<(ResizeSource, Instant)>>,
    title: Mutex<TitleManager>,
    activity: Mutex<ActivityDetector>,
    /// `(isActive, specificStatus)` as of the last `activity.json` flush, so
    /// the sweep tick only rewrites the file on an actual change.
    last_snapshot: Mutex<Option<(bool, Option<SpecificStatus>)>>,
    recording: Recording,
    pub buffer: Arc<Mutex<OutputBuffer>>,
    events: EventBus,

    stdin_tx: mpsc::Sender<Vec<u8>>,
    pty_master: Option<OwnedFd>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SessionHandle {
    /// Spawn a new session: allocates a PTY, spawns the child, opens the
    /// recording log, and starts the read-pump that fans output out through
    /// activity detection, the replay buffer, and the recording writer.
    ///
    /// On any failure after the directory/manifest have been created, the
    /// caller is responsible for the transactional rollback (§4.6) — this
    /// function itself only creates the recording log and PTY.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn(
        id: String,
        command: Vec<String>,
        working_dir: String,
        cols: u16,
        rows: u16,
        name: Option<String>,
        title_mode: TitleMode,
        dir: PathBuf,
        events: EventBus,
        buffer_size: usize,
    ) -> Result<Arc<Self>, SessionError> {
        let pty_pair: PtyPair = pty::allocate_pty(cols, rows).map_err(SessionError::Spawn)?;
        let child = pty::spawn(&pty_pair, &command, &working_dir, None, &id).map_err(SessionError::Spawn)?;
        let pid = child.id().unwrap_or(0);

        let recording = Recording::open(&dir, &command, cols, rows).await?;

        let master_raw = pty_pair.master.as_raw_fd();
        let (write_half, read_half) = pty::split_master(master_raw)?;

        let created_at = now_epoch_secs();

        let label = command.first().cloned().unwrap_or_default();
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let session = Arc::new(SessionHandle {
            id: id.clone(),
            command: command.clone(),
            working_dir: working_dir.clone(),
            created_at,
            dir,
            name: Mutex::new(name),
            status: Mutex::new(SessionStatus::Starting),
            pid: AtomicU32::new(pid),
            pgid: AtomicU32::new(pid),
            cols: AtomicU32::new(u32::from(cols)),
            rows: AtomicU32::new(u32::from(rows)),
            exit_code: AtomicI32::new(0),
            has_exit_code: std::sync::atomic::AtomicBool::new(false),
            last_resize: Mutex::new(None),
            title: Mutex::new(TitleManager::new(title_mode, label, working_dir.clone())),
            activity: Mutex::new(ActivityDetector::new()),
            last_snapshot: Mutex::new(None),
            recording,
            buffer: Arc::new(Mutex::new(OutputBuffer::new(buffer_size))),
            events,
            stdin_tx,
            pty_master: Some(pty_pair.master),
            tasks: Mutex::new(Vec::new()),
        });

        let stdin_task = tokio::spawn(stdin_pump(write_half, stdin_rx));
        let output_task = tokio::spawn(output_pump(Arc::clone(&session), read_half));
        let exit_task = tokio::spawn(exit_watcher(Arc::clone(&session), child));
        *session.status.lock().await = SessionStatus::Running;
        session.events.publish(
            EventKind::SessionStart,
            Some(id.clone()),
            json!({"command": command, "pid": pid}),
        ).await;

        *session.tasks.lock().await = vec![stdin_task, output_task, exit_task];
        Ok(session)
    }

    /// Rebuild a read-only handle for a session recovered from disk at
    /// startup (§4.6 `RestoreOnStartup`). No PTY, no background tasks.
    pub fn from_manifest(manifest: &Manifest, dir: PathBuf, events: EventBus) -> Arc<Self> {
        // Every recovered session is promoted to `exited` — a `starting` or
        // `running` record found on disk cannot be resumed (§4.6).
        let status = SessionStatus::Exited;
        let label = manifest.command.first().cloned().unwrap_or_default();
        Arc::new(SessionHandle {
            id: manifest.id.clone(),
            command: manifest.command.clone(),
            working_dir: manifest.working_dir.clone(),
            created_at: manifest.created_at,
            dir,
            name: Mutex::new(manifest.name.clone()),
            status: Mutex::new(status),
            pid: AtomicU32::new(manifest.pid.unwrap_or(0)),
            pgid: AtomicU32::new(0),
            cols: AtomicU32::new(u32::from(manifest.cols)),
            rows: AtomicU32::new(u32::from(manifest.rows)),
            exit_code: AtomicI32::new(manifest.exit_code.unwrap_or(-1)),
            has_exit_code: std::sync::atomic::AtomicBool::new(true),
            last_resize: Mutex::new(None),
            title: Mutex::new(TitleManager::new(TitleMode::None, label, manifest.working_dir.clone())),
            activity: Mutex::new(ActivityDetector::new()),
            last_snapshot: Mutex::new(None),
            recording: Recording::closed(),
            buffer: Arc::new(Mutex::new(OutputBuffer::new(4096))),
            events,
            stdin_tx: mpsc::channel(1).0,
            pty_master: None,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.status.lock().await, SessionStatus::Running | SessionStatus::Starting)
    }

    pub async fn snapshot(&self) -> SessionRecord {
        let status = *self.status.lock().await;
        let name = self.name.lock().await.clone();
        let title_guard = self.title.lock().await;
        let cwd = title_guard.cwd().to_string();
        let title_mode = title_guard.mode();
        drop(title_guard);
        let exit_code = self
            .has_exit_code
            .load(Ordering::Relaxed)
            .then(|| self.exit_code.load(Ordering::Relaxed));
        let now = now_epoch_secs();
        let activity_state = self.activity.lock().await.current_state(now);
        SessionRecord {
            id: self.id.clone(),
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            name,
            status,
            cols: u16::try_from(self.cols.load(Ordering::Relaxed)).unwrap_or(0),
            rows: u16::try_from(self.rows.load(Ordering::Relaxed)).unwrap_or(0),
            pid: (self.pid.load(Ordering::Relaxed) != 0).then(|| self.pid.load(Ordering::Relaxed)),
            created_at: self.created_at,
            exit_code,
            cwd,
            title_mode,
            activity_state,
        }
    }

    pub async fn rename(&self, name: Option<String>) {
        *self.name.lock().await = name.clone();
        self.title.lock().await.set_session_name(name.clone());
        self.events
            .publish(EventKind::SessionRename, Some(self.id.clone()), json!({"name": name}))
            .await;
    }

    /// Render a chunk of buffered output for a terminal-attached consumer
    /// (the `vt`/IPC path): applies the session's `titleMode` OSC-2
    /// injection/stripping, which never touches the byte stream handed to
    /// browser consumers (WebSocket/SSE) off the same buffer.
    pub async fn render_for_terminal(&self, data: &[u8]) -> Vec<u8> {
        let now = now_epoch_secs();
        let activity_state = self.activity.lock().await.current_state(now);
        self.title.lock().await.transform_output(data, &activity_state)
    }

    /// Re-evaluate idle classification and flush `activity.json` if the
    /// (isActive, specificStatus) pair has changed since the last flush.
    /// Called from the manager's periodic sweep (§4.6) — bounded to the
    /// sweep's own tick rate rather than running on every output chunk.
    pub async fn sweep_activity(&self) {
        if !self.is_running().await {
            return;
        }
        let now = now_epoch_secs();
        let idle_transition = self.activity.lock().await.tick_idle();
        if idle_transition.is_some() {
            self.events
                .publish(EventKind::SessionActivity, Some(self.id.clone()), json!({"isActive": false}))
                .await;
        }

        let current = self.activity.lock().await.current_state(now);
        let key = (current.is_active, current.specific_status.clone());
        let mut last = self.last_snapshot.lock().await;
        if last.as_ref() == Some(&key) {
            return;
        }
        *last = Some(key);
        drop(last);

        let snapshot = ActivitySnapshot {
            is_active: current.is_active,
            specific_status: current.specific_status,
            timestamp: now,
        };
        if let Err(e) = recording::write_activity_snapshot(&self.dir, &snapshot).await {
            warn!(session_id = %self.id, error = %e, "failed to flush activity snapshot");
        }
    }

    pub async fn write_stdin(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running().await {
            return Err(SessionError::NotRunning);
        }
        self.title.lock().await.observe_input(data);
        self.recording.input(data).await;
        self.stdin_tx
            .send(data.to_vec())
            .await
            .map_err(|_| SessionError::NotRunning)
    }

    /// Apply a resize request, arbitrating against the last winning source
    /// per the grace-window rule (§4.5): within 1 s of a winning resize, a
    /// request from a *different* source loses, unless it is `api`, which
    /// always wins. Returns `true` if applied.
    pub async fn resize(&self, cols: u16, rows: u16, source: ResizeSource) -> Result<bool, SessionError> {
        let mut last = self.last_resize.lock().await;
        if let Some((last_source, at)) = *last {
            let contradicts = last_source != source && at.elapsed() < RESIZE_GRACE;
            if contradicts && source != ResizeSource::Api {
                return Ok(false);
            }
        }
        *last = Some((source, Instant::now()));
        drop(last);

        self.cols.store(u32::from(cols), Ordering::Relaxed);
        self.rows.store(u32::from(rows), Ordering::Relaxed);
        self.recording.resize(cols, rows).await;
        if let Some(master) = &self.pty_master {
            pty::resize(master, cols, rows).map_err(|e| SessionError::Io(std::io::Error::other(e)))?;
        }
        Ok(true)
    }

    /// Send `signal` to the whole process group (a raw Ctrl-C-equivalent or
    /// a nominated signal from `CONTROL_CMD.kill`).
    pub fn send_signal(&self, signal: i32) -> std::io::Result<()> {
        pty::signal_group(self.pgid.load(Ordering::Relaxed), signal)
    }

    /// Immediate kill: SIGKILL to the process group, no grace period.
    pub fn kill(&self) {
        let _ = pty::signal_group(self.pgid.load(Ordering::Relaxed), libc::SIGKILL);
    }

    /// Graceful kill: SIGTERM, poll for exit, SIGKILL at the deadline.
    pub async fn graceful_kill(&self) {
        let pgid = self.pgid.load(Ordering::Relaxed);
        if pgid == 0 {
            return;
        }
        let _ = pty::signal_group(pgid, libc::SIGTERM);
        let deadline = Instant::now() + pty::GRACEFUL_KILL_DEADLINE;
        loop {
            if !self.is_running().await {
                return;
            }
            if Instant::now() >= deadline {
                let _ = pty::signal_group(pgid, libc::SIGKILL);
                return;
            }
            tokio::time::sleep(pty::GRACEFUL_KILL_POLL).await;
        }
    }

    async fn mark_exited(&self, code: i32) {
        *self.status.lock().await = SessionStatus::Exited;
        self.exit_code.store(code, Ordering::Relaxed);
        self.has_exit_code.store(true, Ordering::Relaxed);
        self.recording.exit(code).await;
        self.events
            .publish(EventKind::SessionExit, Some(self.id.clone()), json!({"exit_code": code}))
            .await;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

async fn stdin_pump(mut writer: tokio::fs::File, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if writer.write_all(&data).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

async fn output_pump(session: Arc<SessionHandle>, mut reader: tokio::fs::File) {
    let mut tmp = [0u8; 4096];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &tmp[..n];
                let now = now_epoch_secs();
                let observation = session.activity.lock().await.observe(chunk, now);
                session.recording.output(chunk).await;
                let bell_count = observation.filtered.iter().filter(|&&b| b == 0x07).count();
                session.buffer.lock().await.push(observation.filtered);
                if observation.transitioned {
                    session
                        .events
                        .publish(
                            EventKind::SessionActivity,
                            Some(session.id.clone()),
                            json!({"isActive": observation.state.is_active}),
                        )
                        .await;
                }
                for _ in 0..bell_count {
                    session.events.publish(EventKind::SessionBell, Some(session.id.clone()), json!({})).await;
                }
            }
        }
    }
    info!(session_id = %session.id, "output pump closed");
}

async fn exit_watcher(session: Arc<SessionHandle>, mut child: tokio::process::Child) {
    let code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "wait() failed");
            -1
        }
    };
    session.mark_exited(code).await;
    let manifest = Manifest {
        id: session.id.clone(),
        command: session.command.clone(),
        working_dir: session.working_dir.clone(),
        name: session.name.lock().await.clone(),
        status: "exited".to_string(),
        cols: u16::try_from(session.cols.load(Ordering::Relaxed)).unwrap_or(0),
        rows: u16::try_from(session.rows.load(Ordering::Relaxed)).unwrap_or(0),
        pid: None,
        created_at: session.created_at,
        exit_code: Some(code),
    };
    if let Err(e) = recording::write_manifest(&session.dir, &manifest).await {
        error!(session_id = %session.id, error = %e, "failed to flush manifest on exit");
    }
}
