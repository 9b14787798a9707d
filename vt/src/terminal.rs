//! Local terminal raw-mode management and resize detection.
//!
//! Puts stdin into raw mode for the duration of an attachment (so keystrokes
//! reach the remote PTY byte-for-byte) and restores the original settings on
//! drop. Window-size changes are picked up via `SIGWINCH` and the
//! `TIOCGWINSZ` ioctl, the same pair the server's own PTY layer uses in
//! reverse (`TIOCSWINSZ`) to apply a size.

use std::os::fd::AsRawFd;

use nix::sys::termios::{self, SetArg, Termios};

/// RAII guard that restores the terminal's original mode on drop.
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    /// Switch stdin into raw mode, returning a guard that restores it.
    pub fn enable() -> nix::Result<Self> {
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &self.original);
    }
}

/// Current size of the controlling terminal, via `TIOCGWINSZ` on stdout.
pub fn current_size() -> (u16, u16) {
    let stdout = std::io::stdout();
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ is a well-defined ioctl that fills a winsize struct.
    let ret = unsafe { libc::ioctl(stdout.as_raw_fd(), libc::TIOCGWINSZ, std::ptr::addr_of_mut!(winsize)) };
    if ret == -1 || winsize.ws_col == 0 || winsize.ws_row == 0 {
        return (crate::DEFAULT_COLS, crate::DEFAULT_ROWS);
    }
    (winsize.ws_col, winsize.ws_row)
}

/// Install a `SIGWINCH` handler and return a task that emits the current
/// terminal size each time the window is resized.
pub fn spawn_resize_watcher() -> tokio::sync::mpsc::Receiver<(u16, u16)> {
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    tokio::spawn(async move {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(s) => s,
            Err(_) => return,
        };
        loop {
            if signal.recv().await.is_none() {
                return;
            }
            if tx.send(current_size()).await.is_err() {
                return;
            }
        }
    });
    rx
}
