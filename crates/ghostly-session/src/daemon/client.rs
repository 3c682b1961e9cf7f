//! Client-side session operations: attach, open, kill.
//!
//! `attach` puts the local terminal into raw mode, forwards keystrokes
//! to the daemon (intercepting the detach key) and renders daemon output,
//! tracking window-size changes along the way. The terminal is restored
//! on every exit path.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, kill as send_signal, signal};
use nix::unistd::Pid;
use tracing::debug;

use ghostly_core::protocol::{self, Frame};

use crate::daemon::ensure_valid_name;
use crate::daemon::registry::{Registry, process_alive};
use crate::daemon::terminal::{self, RawModeGuard};

/// Detach key: Ctrl+\ .
pub const DETACH_KEY: u8 = 0x1C;

/// Client-side read buffer for stdin chunks.
const BUF_SIZE: usize = 8192;

/// Poll budget for the attach loop.
const POLL_INTERVAL_MS: u16 = 500;

static GOT_WINCH: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigwinch(_: libc::c_int) {
    GOT_WINCH.store(true, Ordering::Release);
}

/// Connect to a named session and run the interactive client.
///
/// The returned code is 0 after a detach, or the session's exit code
/// when the session ended while attached.
pub fn attach(name: &str) -> Result<i32> {
    ensure_valid_name(name)?;
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignoring SIGPIPE")?;

    let registry = Registry::open()?;
    let socket_path = registry.socket_path(name);
    Registry::check_socket_path(&socket_path)?;

    let mut stream = UnixStream::connect(&socket_path)
        .with_context(|| format!("cannot attach to session '{name}': not running"))?;

    let (cols, rows) = terminal::window_size();
    protocol::write_frame(&mut stream, &Frame::Hello { cols, rows })
        .with_context(|| format!("failed to send handshake to session '{name}'"))?;

    let mut guard = RawModeGuard::enter();
    unsafe { signal(Signal::SIGWINCH, SigHandler::Handler(handle_sigwinch)) }
        .context("installing SIGWINCH handler")?;

    let code = run_attached(name, &mut stream, &mut guard);
    guard.restore();
    Ok(code)
}

/// The attach loop: poll stdin and the session socket, 500 ms budget.
fn run_attached(name: &str, stream: &mut UnixStream, guard: &mut RawModeGuard) -> i32 {
    let mut exit_code = 0i32;
    let mut buf = [0u8; BUF_SIZE];

    loop {
        let stdin_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
        let sock_raw = stream.as_raw_fd();
        let sock_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(sock_raw) };
        let mut fds = [
            PollFd::new(stdin_fd, PollFlags::POLLIN),
            PollFd::new(sock_fd, PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                maybe_send_winch(stream);
                continue;
            }
            Err(_) => break,
        }

        let stdin_flags = fds[0].revents().unwrap_or(PollFlags::empty());
        let sock_flags = fds[1].revents().unwrap_or(PollFlags::empty());
        drop(fds);

        maybe_send_winch(stream);

        if stdin_flags.contains(PollFlags::POLLIN) {
            match read_stdin(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    if chunk.contains(&DETACH_KEY) {
                        // The whole chunk is discarded: bytes sharing a
                        // read with the detach key never reach the
                        // session, before or after it.
                        let _ = protocol::write_frame(stream, &Frame::Detach);
                        guard.restore();
                        eprintln!("\r\n[detached from '{name}']\r");
                        return 0;
                    }
                    if protocol::write_frame(stream, &Frame::Data(chunk.to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if sock_flags.contains(PollFlags::POLLIN) {
            let raw = match protocol::read_frame(stream) {
                Ok(raw) => raw,
                Err(_) => break,
            };
            match raw.decode() {
                Some(Frame::Data(bytes)) => {
                    if !bytes.is_empty() && write_stdout(&bytes).is_err() {
                        break;
                    }
                }
                Some(Frame::Exit(code)) => {
                    debug!(code, "session ended");
                    exit_code = code as i32;
                    break;
                }
                _ => {}
            }
        }
        if sock_flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            break;
        }
    }

    exit_code
}

/// Attach if the session is alive, otherwise create it and then attach.
pub fn open(name: &str, command: Option<&str>) -> Result<i32> {
    ensure_valid_name(name)?;
    let registry = Registry::open()?;

    if registry.socket_path(name).exists() {
        if registry.session_alive(name) {
            return attach(name);
        }
        debug!(name, "cleaning stale session before open");
        registry.remove_session(name);
    }

    crate::daemon::server::create(name, command)?;
    // Brief grace for the fresh daemon to reach accept().
    thread::sleep(Duration::from_millis(100));
    attach(name)
}

/// Terminate a session: SIGTERM, up to ~1 s of liveness polling, then
/// SIGKILL, and registry cleanup either way.
pub fn kill(name: &str) -> Result<i32> {
    ensure_valid_name(name)?;
    let registry = Registry::open()?;

    let pid = registry.read_pid(name).filter(|&p| process_alive(p));
    let Some(pid) = pid else {
        registry.remove_session(name);
        bail!("Session '{name}' not found or already dead");
    };

    let target = Pid::from_raw(pid);
    let _ = send_signal(target, Signal::SIGTERM);
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(100));
        if !process_alive(pid) {
            registry.remove_session(name);
            println!("Session '{name}' killed.");
            return Ok(0);
        }
    }

    let _ = send_signal(target, Signal::SIGKILL);
    thread::sleep(Duration::from_millis(100));
    registry.remove_session(name);
    println!("Session '{name}' killed (SIGKILL).");
    Ok(0)
}

/// One unbuffered read from stdin. Buffered readers would hide bytes
/// from the poll loop.
fn read_stdin(buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::read(
                libc::STDIN_FILENO,
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

fn write_stdout(bytes: &[u8]) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(bytes)?;
    stdout.flush()
}

fn maybe_send_winch(stream: &mut UnixStream) {
    if GOT_WINCH.swap(false, Ordering::AcqRel) {
        let (cols, rows) = terminal::window_size();
        let _ = protocol::write_frame(stream, &Frame::Winch { cols, rows });
    }
}
