//! Local terminal modes and window-size plumbing.

use std::io::IsTerminal;
use std::os::fd::RawFd;

use nix::sys::termios::{self, SetArg, Termios};

/// Raw-mode guard for the attach client's terminal.
///
/// Entering switches stdin to raw mode and remembers the previous
/// settings; [`restore`](Self::restore) puts them back and is idempotent,
/// and `Drop` restores as well so every exit path (including panics)
/// leaves the terminal usable. Off a tty this is a no-op.
pub struct RawModeGuard {
    saved: Option<Termios>,
}

impl RawModeGuard {
    pub fn enter() -> Self {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Self { saved: None };
        }
        let Ok(saved) = termios::tcgetattr(&stdin) else {
            return Self { saved: None };
        };
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        if termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).is_err() {
            return Self { saved: None };
        }
        Self { saved: Some(saved) }
    }

    /// Restore the saved terminal modes. Safe to call more than once.
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &saved);
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Window size of the controlling terminal, with the conventional
/// 80×24 fallback when stdin is not a terminal.
pub fn window_size() -> (u16, u16) {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc == 0 {
        (ws.ws_col, ws.ws_row)
    } else {
        (80, 24)
    }
}

/// Apply a window size to a terminal fd (the PTY master in the daemon).
pub fn set_window_size(fd: RawFd, cols: u16, rows: u16) -> std::io::Result<()> {
    let ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_size_has_fallback_off_tty() {
        // Under the test harness stdin is usually a pipe; either branch
        // must yield plausible nonzero dimensions.
        let (cols, rows) = window_size();
        if !std::io::stdin().is_terminal() {
            assert_eq!((cols, rows), (80, 24));
        } else {
            assert!(cols > 0 && rows > 0);
        }
    }

    #[test]
    fn test_raw_mode_guard_noop_off_tty() {
        let mut guard = RawModeGuard::enter();
        guard.restore();
        guard.restore(); // idempotent
    }
}
