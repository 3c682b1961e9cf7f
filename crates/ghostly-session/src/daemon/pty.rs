//! PTY host: the session shell on its pseudoterminal.
//!
//! The daemon owns the master side; the child becomes session leader on
//! the slave and execs the user's shell. All wait-status decoding for
//! exit-code delivery lives here too.

use std::env;
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{Winsize, openpty};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, execvp, fork};

use crate::daemon::terminal;

/// Shell used when `$SHELL` is unset.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// How long a blocked master write may stall before the frame is dropped.
const WRITE_STALL_MS: u16 = 1000;

/// The daemon-owned master side of the session PTY, plus the child pid.
pub struct PtyChild {
    master: OwnedFd,
    pub pid: Pid,
}

impl PtyChild {
    /// Create the pseudoterminal pair and fork the session shell.
    ///
    /// Without a command the shell runs as a login shell (`-l`); with one
    /// it runs `-l -c <command>`. The shell binary comes from `$SHELL`,
    /// falling back to /bin/bash. The child exits with status 127 when
    /// exec fails. The parent keeps the master non-blocking.
    pub fn spawn(command: Option<&str>) -> Result<Self> {
        let ws = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(&ws, None).context("openpty failed")?;

        // Argv is assembled before the fork so the child only touches
        // async-signal-safe calls between fork and exec.
        let shell = env::var("SHELL").unwrap_or_else(|_| DEFAULT_SHELL.to_string());
        let shell_c = CString::new(shell).context("shell path contains NUL")?;
        let mut argv = vec![shell_c.clone(), CString::new("-l")?];
        if let Some(cmd) = command {
            argv.push(CString::new("-c")?);
            argv.push(CString::new(cmd).context("command contains NUL")?);
        }

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => exec_child(&pty.slave, &pty.master, &shell_c, &argv),
            ForkResult::Parent { child } => {
                drop(pty.slave);
                set_nonblocking(pty.master.as_raw_fd())?;
                Ok(Self {
                    master: pty.master,
                    pid: child,
                })
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// One read from the master. `Ok(0)` means the slave side hung up;
    /// `WouldBlock` means nothing is pending right now.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(
                    self.master.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Write a whole buffer to the master, completing partial writes.
    ///
    /// The master is non-blocking, so `EAGAIN` waits for writability
    /// under a bounded poll instead of spinning; a stall past the
    /// deadline fails the write.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        let fd = self.master.as_raw_fd();
        while !buf.is_empty() {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n > 0 {
                buf = &buf[n as usize..];
                continue;
            }
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pty master accepted no bytes",
                ));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::WouldBlock => wait_writable(fd)?,
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Push a window-size change to the child's terminal.
    pub fn set_winsize(&self, cols: u16, rows: u16) -> io::Result<()> {
        terminal::set_window_size(self.master.as_raw_fd(), cols, rows)
    }
}

/// Child-side setup between fork and exec: new session, controlling
/// terminal on the slave, stdio onto the slave, then exec.
fn exec_child(slave: &OwnedFd, master: &OwnedFd, shell: &CStr, argv: &[CString]) -> ! {
    let slave_fd = slave.as_raw_fd();
    unsafe {
        libc::setsid();
        libc::ioctl(slave_fd, libc::TIOCSCTTY, 0);
        libc::dup2(slave_fd, libc::STDIN_FILENO);
        libc::dup2(slave_fd, libc::STDOUT_FILENO);
        libc::dup2(slave_fd, libc::STDERR_FILENO);
        if slave_fd > 2 {
            libc::close(slave_fd);
        }
        libc::close(master.as_raw_fd());
    }
    let _ = execvp(shell, argv);
    // Only reached when exec failed.
    unsafe { libc::_exit(127) }
}

/// Decode a wait status into the session exit code: the plain status for
/// a normal exit, 128 + signal number for a signal death.
pub fn decode_wait_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(128 + sig as i32),
        _ => None,
    }
}

/// Same decoding over a raw `waitpid` status word, usable from the
/// SIGCHLD handler.
pub fn decode_raw_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        0
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn wait_writable(fd: RawFd) -> io::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLOUT)];
    match poll(&mut fds, PollTimeout::from(WRITE_STALL_MS)) {
        Ok(n) if n > 0 => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "pty master not writable within 1s",
        )),
        Err(nix::errno::Errno::EINTR) => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}
