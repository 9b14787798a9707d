//! Process & PTY adapter (C1).
//!
//! Spawns a child process attached to a pseudo-terminal and exposes the
//! small surface the session state machine needs: read, write, resize, kill,
//! wait. Uses the `nix` crate for POSIX PTY allocation and raw `libc` calls
//! for the signal-safe parts of `pre_exec`.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// Session-id env var exported to every spawned child. Read only at the
/// boundary (by the `vt` forwarder) to avoid accidental session recursion.
pub const SESSION_ID_ENV: &str = "TUNNELFORGE_SESSION_ID";

/// Default terminal size when the caller specifies neither dimension.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Errors that can occur while spawning a PTY-backed process.
#[derive(Debug)]
pub enum SpawnError {
    /// `argv[0]` could not be resolved via alias table, `PATH`, or as a literal path.
    CommandNotFound(String),
    /// The resolved binary exists but could not be executed (permissions).
    PermissionDenied(String),
    /// `openpty()` failed.
    PtyAllocationFailed(String),
    /// The requested working directory does not exist.
    WorkdirMissing(String),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::CommandNotFound(cmd) => write!(f, "command not found: {cmd}"),
            SpawnError::PermissionDenied(cmd) => write!(f, "permission denied: {cmd}"),
            SpawnError::PtyAllocationFailed(e) => write!(f, "PTY allocation failed: {e}"),
            SpawnError::WorkdirMissing(dir) => write!(f, "working directory missing: {dir}"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Resolution strategy that successfully located `argv[0]`, recorded for
/// diagnostics (logged at spawn time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    Alias,
    Path,
    Literal,
}

/// Resolve `argv[0]` via (1) an alias table, (2) `PATH` lookup, (3) a literal
/// path fallback. Returns the resolved command and which strategy fired.
pub fn resolve_argv0(argv0: &str, aliases: &HashMap<String, String>) -> Option<(String, ResolvedVia)> {
    if let Some(target) = aliases.get(argv0) {
        return Some((target.clone(), ResolvedVia::Alias));
    }
    if argv0.contains('/') {
        if Path::new(argv0).is_file() {
            return Some((argv0.to_string(), ResolvedVia::Literal));
        }
        return None;
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(argv0);
        if candidate.is_file() {
            return Some((candidate.to_string_lossy().into_owned(), ResolvedVia::Path));
        }
    }
    None
}

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(cols: u16, rows: u16) -> Result<PtyPair, SpawnError> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } =
        openpty(&winsize, None).map_err(|e| SpawnError::PtyAllocationFailed(e.to_string()))?;
    Ok(PtyPair { master, slave })
}

/// Spawn `argv` on the slave side of `pty`.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal, and stdin/stdout/stderr are all connected to the slave fd. Sets
/// `TERM=xterm-256color` unless the caller's `env` already contains `TERM`,
/// and always exports [`SESSION_ID_ENV`].
pub fn spawn(
    pty: &PtyPair,
    argv: &[String],
    working_dir: &str,
    env: Option<&HashMap<String, String>>,
    session_id: &str,
) -> Result<Child, SpawnError> {
    if !Path::new(working_dir).is_dir() {
        return Err(SpawnError::WorkdirMissing(working_dir.to_string()));
    }
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SpawnError::CommandNotFound(String::new()))?;

    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(working_dir).kill_on_drop(true);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

    if let Some(vars) = env {
        cmd.envs(vars);
    }
    let has_term = env.is_some_and(|e| e.contains_key("TERM"));
    if !has_term {
        cmd.env("TERM", "xterm-256color");
    }
    cmd.env(SESSION_ID_ENV, session_id);

    // SAFETY: all syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SpawnError::CommandNotFound(program.clone()),
        std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.clone()),
        _ => SpawnError::CommandNotFound(format!("{program}: {e}")),
    })
}

/// Resize a PTY's terminal window.
pub fn resize(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), nix::Error> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that writes a Winsize struct.
    let ret = unsafe {
        libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(winsize))
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Duplicate the PTY master fd into an owned read half and write half so the
/// read-pump and write-pump tasks can each own a tokio file handle while the
/// original fd stays alive for resize.
pub fn split_master(master_raw: RawFd) -> std::io::Result<(tokio::fs::File, tokio::fs::File)> {
    let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
    if writer_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
    if reader_fd < 0 {
        unsafe {
            libc::close(writer_fd);
        }
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: both fds were just created by dup() and are owned exclusively here.
    let write_half = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
    let read_half = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });
    Ok((write_half, read_half))
}

/// Send `signal` to the process group `pgid`. Sending to `-pgid` reaches
/// every process in the group (job-control shells, pipelines, TUIs).
pub fn signal_group(pgid: u32, signal: i32) -> Result<(), std::io::Error> {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pgid as i32;
    if pgid <= 0 {
        return Ok(());
    }
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Graceful-kill deadline: SIGTERM, poll every 500 ms, SIGKILL at 3 s.
pub const GRACEFUL_KILL_DEADLINE: std::time::Duration = std::time::Duration::from_secs(3);
pub const GRACEFUL_KILL_POLL: std::time::Duration = std::time::Duration::from_millis(500);
/// When the caller explicitly requests SIGKILL, skip the grace period.
pub const IMMEDIATE_KILL_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_argv0_via_alias() {
        let mut aliases = HashMap::new();
        aliases.insert("myshell".to_string(), "/bin/sh".to_string());
        let (resolved, via) = resolve_argv0("myshell", &aliases).unwrap();
        assert_eq!(resolved, "/bin/sh");
        assert_eq!(via, ResolvedVia::Alias);
    }

    #[test]
    fn resolve_argv0_via_path() {
        let aliases = HashMap::new();
        let (resolved, via) = resolve_argv0("sh", &aliases).expect("sh should be on PATH");
        assert!(resolved.ends_with("/sh"));
        assert_eq!(via, ResolvedVia::Path);
    }

    #[test]
    fn resolve_argv0_unknown_fails() {
        let aliases = HashMap::new();
        assert!(resolve_argv0("definitely-not-a-real-binary-xyz", &aliases).is_none());
    }
}
