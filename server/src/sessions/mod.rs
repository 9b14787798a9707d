//! Session manager (C6).
//!
//! The single authority for creating, listing, and destroying sessions.
//! Each session gets its own directory under the control root
//! (`<controlRoot>/<shortId>/`, §6) holding its manifest, recording log, and
//! (once C7 binds it) its IPC socket. `Create` is transactional: if the PTY
//! spawn fails, the directory is removed before the error is returned.

pub mod buffer;
pub mod session;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::pty::{DEFAULT_COLS, DEFAULT_ROWS};
use crate::recording::{self, Manifest};
use crate::title::TitleMode;
use session::{ResizeSource, SessionError, SessionHandle, SessionRecord};

/// How long an exited session's directory survives before `Cleanup` removes
/// it (§4.6's "short grace interval").
const CLEANUP_GRACE: Duration = Duration::from_secs(5 * 60);

/// Host limit on `AF_UNIX` socket path length, platform-conservative (§4.7).
const MAX_SOCKET_PATH_LEN: usize = 103;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub name: Option<String>,
    pub title_mode: Option<TitleMode>,
}

#[derive(Debug)]
pub enum CreateError {
    LimitReached(usize),
    SocketPathTooLong(usize),
    InvalidSize { cols: u16, rows: u16 },
    Session(SessionError),
    Io(std::io::Error),
}

impl std::fmt::Display for CreateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreateError::LimitReached(max) => write!(f, "session limit reached (max {max})"),
            CreateError::SocketPathTooLong(len) => {
                write!(f, "IPC socket path would be {len} bytes, exceeding the {MAX_SOCKET_PATH_LEN}-byte limit")
            }
            CreateError::InvalidSize { cols, rows } => {
                write!(f, "invalid terminal size {cols}x{rows}: cols and rows must be nonzero")
            }
            CreateError::Session(e) => write!(f, "{e}"),
            CreateError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CreateError {}

/// Per-element outcome of a bulk operation (§4.6): never aborts mid-batch.
pub struct BulkOutcome<T> {
    pub id: String,
    pub result: Result<T, String>,
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    control_root: PathBuf,
    events: EventBus,
    max_sessions: usize,
    buffer_size: usize,
    ipc_socket_mode: u32,
}

impl SessionManager {
    pub fn new(
        control_root: PathBuf,
        events: EventBus,
        max_sessions: usize,
        buffer_size: usize,
        ipc_socket_mode: u32,
    ) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            control_root,
            events,
            max_sessions,
            buffer_size,
            ipc_socket_mode,
        }
    }

    pub fn control_root(&self) -> &Path {
        &self.control_root
    }

    fn session_dir(&self, short_id: &str) -> PathBuf {
        self.control_root.join(short_id)
    }

    /// Create a new session. Transactional: on any failure after the
    /// directory is created, the directory is removed before returning.
    pub async fn create(&self, opts: CreateOptions) -> Result<Arc<SessionHandle>, CreateError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_sessions {
                return Err(CreateError::LimitReached(self.max_sessions));
            }
        }

        if opts.cols == Some(0) || opts.rows == Some(0) {
            return Err(CreateError::InvalidSize {
                cols: opts.cols.unwrap_or(DEFAULT_COLS),
                rows: opts.rows.unwrap_or(DEFAULT_ROWS),
            });
        }

        let short_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let dir = self.session_dir(&short_id);

        let socket_path = recording::ipc_socket_path(&dir);
        let socket_path_len = socket_path.as_os_str().len();
        if socket_path_len > MAX_SOCKET_PATH_LEN {
            return Err(CreateError::SocketPathTooLong(socket_path_len));
        }

        let working_dir = opts
            .working_dir
            .map(|d| crate::util::expand_tilde(&d).into_owned())
            .unwrap_or_else(|| std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));
        let cols = opts.cols.unwrap_or(DEFAULT_COLS);
        let rows = opts.rows.unwrap_or(DEFAULT_ROWS);
        let title_mode = opts.title_mode.unwrap_or(TitleMode::None);

        let spawn_result = SessionHandle::spawn(
            short_id.clone(),
            opts.command.clone(),
            working_dir.clone(),
            cols,
            rows,
            opts.name.clone(),
            title_mode,
            dir.clone(),
            self.events.clone(),
            self.buffer_size,
        )
        .await;

        let handle = match spawn_result {
            Ok(h) => h,
            Err(e) => {
                if dir.exists() {
                    let _ = tokio::fs::remove_dir_all(&dir).await;
                }
                return Err(CreateError::Session(e));
            }
        };

        let manifest = Manifest {
            id: short_id.clone(),
            command: opts.command,
            working_dir,
            name: opts.name,
            status: "running".to_string(),
            cols,
            rows,
            pid: Some(handle.snapshot().await.pid.unwrap_or(0)),
            created_at: handle.created_at,
            exit_code: None,
        };
        if let Err(e) = recording::write_manifest(&dir, &manifest).await {
            warn!(session_id = %short_id, error = %e, "failed to write initial manifest");
        }

        self.sessions.write().await.insert(short_id.clone(), Arc::clone(&handle));

        let ipc_session = Arc::clone(&handle);
        let ipc_socket_path = recording::ipc_socket_path(&dir);
        let ipc_socket_mode = self.ipc_socket_mode;
        tokio::spawn(async move {
            if let Err(e) = crate::ipc::serve(ipc_session, &ipc_socket_path, ipc_socket_mode).await {
                warn!(error = %e, "IPC socket server exited with error");
            }
        });

        info!(session_id = %short_id, "session created");
        Ok(handle)
    }

    pub async fn list(&self) -> Vec<SessionRecord> {
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for s in sessions {
            out.push(s.snapshot().await);
        }
        out
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn rename(&self, id: &str, name: Option<String>) -> Result<(), String> {
        let session = self.get(id).await.ok_or_else(|| format!("session {id} not found"))?;
        session.rename(name).await;
        self.flush_manifest(&session).await;
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16, source: ResizeSource) -> Result<bool, String> {
        let session = self.get(id).await.ok_or_else(|| format!("session {id} not found"))?;
        let applied = session.resize(cols, rows, source).await.map_err(|e| e.to_string())?;
        if applied {
            self.flush_manifest(&session).await;
        }
        Ok(applied)
    }

    pub async fn write_stdin(&self, id: &str, data: &[u8]) -> Result<(), String> {
        let session = self.get(id).await.ok_or_else(|| format!("session {id} not found"))?;
        session.write_stdin(data).await.map_err(|e| e.to_string())
    }

    pub async fn signal(&self, id: &str, signal: i32) -> Result<(), String> {
        let session = self.get(id).await.ok_or_else(|| format!("session {id} not found"))?;
        session.send_signal(signal).map_err(|e| e.to_string())
    }

    /// Delete (kill and forget) a session. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let session = self.sessions.write().await.remove(id);
        match session {
            Some(s) => {
                s.graceful_kill().await;
                info!(session_id = %id, "session deleted");
                true
            }
            None => false,
        }
    }

    async fn flush_manifest(&self, session: &SessionHandle) {
        let record = session.snapshot().await;
        let manifest = Manifest {
            id: record.id,
            command: record.command,
            working_dir: record.working_dir,
            name: record.name,
            status: format!("{:?}", record.status).to_lowercase(),
            cols: record.cols,
            rows: record.rows,
            pid: record.pid,
            created_at: record.created_at,
            exit_code: record.exit_code,
        };
        if let Err(e) = recording::write_manifest(&session.dir, &manifest).await {
            warn!(session_id = %session.id, error = %e, "failed to flush manifest");
        }
    }

    /// Remove every exited session whose directory has outlived the cleanup
    /// grace period. Returns the removed ids.
    pub async fn cleanup_exited(&self) -> Vec<String> {
        let candidates: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        let mut removed = Vec::new();
        for session in candidates {
            if session.status().await != session::SessionStatus::Exited {
                continue;
            }
            let age = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .saturating_sub(session.created_at);
            if age < CLEANUP_GRACE.as_secs() {
                continue;
            }
            self.sessions.write().await.remove(&session.id);
            let _ = tokio::fs::remove_dir_all(&session.dir).await;
            removed.push(session.id.clone());
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "cleaned up exited sessions");
        }
        removed
    }

    /// Re-evaluate idle classification and flush `activity.json` for every
    /// live session (§4.6). Driven by the manager's periodic sweep tick.
    pub async fn sweep_activity(&self) {
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.sweep_activity().await;
        }
    }

    /// Kill every running session (used at shutdown). SIGTERM all first,
    /// then wait up to the graceful-kill deadline, then SIGKILL stragglers.
    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        let handles: Vec<_> = sessions
            .into_iter()
            .map(|s| tokio::spawn(async move { s.graceful_kill().await }))
            .collect();
        for h in handles {
            let _ = h.await;
        }
    }

    /// Scan the control root for session directories left behind by a prior
    /// run and register them read-only, promoting any non-terminal status
    /// to `exited(code=-1)` before persisting it back (§4.6).
    pub async fn restore_on_startup(&self) {
        let mut entries = match tokio::fs::read_dir(&self.control_root).await {
            Ok(e) => e,
            Err(_) => return,
        };
        let mut restored = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest = match recording::read_manifest(&dir).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mut manifest = manifest;
            if manifest.status != "exited" {
                manifest.status = "exited".to_string();
                manifest.exit_code.get_or_insert(-1);
                manifest.pid = None;
                if let Err(e) = recording::write_manifest(&dir, &manifest).await {
                    warn!(session_id = %manifest.id, error = %e, "failed to persist restart promotion");
                }
            }
            let handle = SessionHandle::from_manifest(&manifest, dir, self.events.clone());
            self.sessions.write().await.insert(handle.id.clone(), handle);
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "restored sessions from disk");
        }
    }

    pub async fn bulk_create(&self, requests: Vec<CreateOptions>) -> Vec<BulkOutcome<String>> {
        let mut out = Vec::with_capacity(requests.len());
        for opts in requests {
            let label = opts.command.join(" ");
            match self.create(opts).await {
                Ok(handle) => out.push(BulkOutcome { id: handle.id.clone(), result: Ok(handle.id.clone()) }),
                Err(e) => out.push(BulkOutcome { id: label, result: Err(e.to_string()) }),
            }
        }
        out
    }

    pub async fn bulk_delete(&self, ids: Vec<String>) -> Vec<BulkOutcome<()>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let existed = self.delete(&id).await;
            let result = if existed { Ok(()) } else { Err(format!("session {id} not found")) };
            out.push(BulkOutcome { id, result });
        }
        out
    }

    pub async fn bulk_resize(&self, requests: Vec<(String, u16, u16)>) -> Vec<BulkOutcome<bool>> {
        let mut out = Vec::with_capacity(requests.len());
        for (id, cols, rows) in requests {
            let result = self.resize(&id, cols, rows, ResizeSource::Api).await;
            out.push(BulkOutcome { id, result });
        }
        out
    }
}

/// Helper used by the runtime bootstrap to ensure the control root exists
/// before the manager is constructed.
pub async fn ensure_control_root(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}
