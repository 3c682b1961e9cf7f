//! Session daemon: client multiplexer and lifecycle.
//!
//! One daemon process per session. `create` double-forks it free of the
//! invoking terminal; the grandchild spawns the shell on a PTY, binds
//! the session socket and runs a single-threaded poll loop that fans PTY
//! output out to every attached client and funnels client input back in.
//! Signal handlers only touch the atomic flags below; all real work
//! happens on the loop after poll wakes.

use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, setsid};
use tracing::{debug, warn};

use ghostly_core::protocol::{self, Frame};

use crate::daemon::ensure_valid_name;
use crate::daemon::pty::{PtyChild, decode_raw_status, decode_wait_status};
use crate::daemon::registry::{Registry, process_alive};

/// Upper bound on simultaneously attached clients.
pub const MAX_CLIENTS: usize = 16;

/// PTY read buffer size.
const BUF_SIZE: usize = 8192;

/// Handshake receive budget for a fresh connection.
const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Operational per-client receive timeout.
const CLIENT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-client send stall budget; past it the client is dropped.
const CLIENT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Event-loop poll budget.
const POLL_INTERVAL_MS: u16 = 1000;

// Signal-handler state. Handlers store into these and nothing else; the
// event loop consumes them on its next wake.
static RUNNING: AtomicBool = AtomicBool::new(true);
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);
/// Child exit code decoded at reap time; -1 until recorded.
static CHILD_EXIT: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigchld(_: libc::c_int) {
    let pid = CHILD_PID.load(Ordering::Acquire);
    if pid > 0 {
        let mut status: libc::c_int = 0;
        let reaped = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if reaped == pid {
            CHILD_EXIT.store(decode_raw_status(status), Ordering::Release);
            CHILD_PID.store(-1, Ordering::Release);
        }
        RUNNING.store(false, Ordering::Release);
    }
}

extern "C" fn handle_sigterm(_: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

/// Daemonise a new session.
///
/// Validates the name, refuses a live duplicate, cleans a stale one,
/// then double-forks: the intermediate process starts a new session and
/// exits so the daemon is re-parented to init. The invoker polls up to
/// ~1 s for the socket to appear and returns success.
pub fn create(name: &str, command: Option<&str>) -> Result<i32> {
    ensure_valid_name(name)?;
    let registry = Registry::open()?;
    let socket_path = registry.socket_path(name);
    Registry::check_socket_path(&socket_path)?;

    if socket_path.exists() {
        if let Some(pid) = registry.read_pid(name) {
            if process_alive(pid) {
                bail!("Session '{name}' already exists (pid {pid})");
            }
        }
        debug!(name, "cleaning stale session before create");
        registry.remove_session(name);
    }

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => {
            for _ in 0..20 {
                thread::sleep(Duration::from_millis(50));
                if socket_path.exists() {
                    break;
                }
            }
            Ok(0)
        }
        ForkResult::Child => {
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                Ok(ForkResult::Child) => {}
                Err(_) => unsafe { libc::_exit(1) },
            }

            redirect_stdio_to_null();
            let code = match run_server(&registry, name, command) {
                Ok(code) => code,
                Err(err) => {
                    warn!(%err, "session daemon failed");
                    1
                }
            };
            unsafe { libc::_exit(code) }
        }
    }
}

/// The daemon body: PTY fork, socket bind, event loop, shutdown.
///
/// Returns the child's exit code, which becomes the daemon's own.
fn run_server(registry: &Registry, name: &str, command: Option<&str>) -> Result<i32> {
    let displayed = command.unwrap_or("bash").to_string();
    let child = PtyChild::spawn(command)?;

    let socket_path = registry.socket_path(name);
    let listener = match bind_session_socket(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            // No socket means no session: take the child down with us.
            let _ = kill(child.pid, Signal::SIGTERM);
            let _ = waitpid(child.pid, None);
            return Err(err);
        }
    };

    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let pid = process::id() as i32;
    registry.write_pid_file(name, pid)?;
    registry.write_info_file(name, pid, 0, created, &displayed)?;

    CHILD_PID.store(child.pid.as_raw(), Ordering::Release);
    RUNNING.store(true, Ordering::Release);
    unsafe {
        signal(Signal::SIGCHLD, SigHandler::Handler(handle_sigchld))
            .context("installing SIGCHLD handler")?;
        signal(Signal::SIGTERM, SigHandler::Handler(handle_sigterm))
            .context("installing SIGTERM handler")?;
        signal(Signal::SIGPIPE, SigHandler::SigIgn).context("ignoring SIGPIPE")?;
    }

    let mut server = Server {
        registry,
        name,
        displayed,
        created,
        child,
        listener,
        clients: Vec::new(),
    };
    server.run_loop();
    Ok(server.shutdown())
}

struct Server<'a> {
    registry: &'a Registry,
    name: &'a str,
    displayed: String,
    created: i64,
    child: PtyChild,
    listener: UnixListener,
    clients: Vec<UnixStream>,
}

impl Server<'_> {
    /// The readiness loop: listener, PTY master and every client socket
    /// under one poll with a 1 s budget, until the running flag clears.
    fn run_loop(&mut self) {
        let mut buf = [0u8; BUF_SIZE];

        while RUNNING.load(Ordering::Acquire) {
            let listener_fd = self.listener.as_raw_fd();
            let master_fd = self.child.master_fd();
            let client_fds: Vec<RawFd> = self.clients.iter().map(|c| c.as_raw_fd()).collect();

            let mut fds = Vec::with_capacity(2 + client_fds.len());
            fds.push(PollFd::new(borrow_fd(listener_fd), PollFlags::POLLIN));
            fds.push(PollFd::new(borrow_fd(master_fd), PollFlags::POLLIN));
            for fd in &client_fds {
                fds.push(PollFd::new(borrow_fd(*fd), PollFlags::POLLIN));
            }

            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(%err, "poll failed, shutting session down");
                    break;
                }
            }

            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|f| f.revents().unwrap_or(PollFlags::empty()))
                .collect();
            drop(fds);

            if revents[0].contains(PollFlags::POLLIN) {
                self.accept_client();
            }

            if revents[1].contains(PollFlags::POLLIN) {
                match self.child.read(&mut buf) {
                    Ok(0) => RUNNING.store(false, Ordering::Release),
                    Ok(n) => self.broadcast(&Frame::Data(buf[..n].to_vec())),
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => RUNNING.store(false, Ordering::Release),
                }
            }
            if revents[1].intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                RUNNING.store(false, Ordering::Release);
            }

            // Back to front so removal keeps the untouched indices
            // valid. A removal during the broadcast above may have
            // reordered the table, so each slot must still hold the fd
            // it was polled with; anyone skipped is picked up next tick.
            for i in (0..client_fds.len()).rev() {
                if i >= self.clients.len() || self.clients[i].as_raw_fd() != client_fds[i] {
                    continue;
                }
                let flags = revents[2 + i];
                if flags.contains(PollFlags::POLLIN) {
                    self.service_client(i);
                } else if flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    self.remove_client(i);
                }
            }
        }
    }

    /// Accept one connection and run the HELLO admission on it.
    ///
    /// Connections past the client cap, and connections that fail the
    /// handshake, are closed without touching session state.
    fn accept_client(&mut self) {
        let stream = match self.listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(err) => {
                debug!(%err, "accept failed");
                return;
            }
        };

        if self.clients.len() >= MAX_CLIENTS {
            debug!("client table full, refusing connection");
            return;
        }

        match admit(stream) {
            Ok((client, cols, rows)) => {
                let _ = self.child.set_winsize(cols, rows);
                self.clients.push(client);
                self.write_info();
                debug!(clients = self.clients.len(), "client attached");
            }
            Err(err) => debug!(%err, "handshake failed, dropping connection"),
        }
    }

    /// Handle one frame from client `i`, dispatching by type. Unknown
    /// and malformed frames are ignored for forward compatibility.
    fn service_client(&mut self, i: usize) {
        let raw = match protocol::read_frame(&mut self.clients[i]) {
            Ok(raw) => raw,
            Err(_) => {
                self.remove_client(i);
                return;
            }
        };

        match raw.decode() {
            Some(Frame::Data(bytes)) => {
                if !bytes.is_empty() {
                    // Sustained master back-pressure costs the frame,
                    // never the session.
                    if let Err(err) = self.child.write_all(&bytes) {
                        warn!(%err, "dropping input frame after master write failure");
                    }
                }
            }
            Some(Frame::Winch { cols, rows }) => {
                let _ = self.child.set_winsize(cols, rows);
            }
            Some(Frame::Detach) => {
                debug!("client detached");
                self.remove_client(i);
            }
            _ => {}
        }
    }

    fn broadcast(&mut self, frame: &Frame) {
        if broadcast_frame(&mut self.clients, frame) {
            self.write_info();
        }
    }

    /// Drop client `i`: close its socket, shrink the table, publish the
    /// new count. Safe to call with an index that is already gone.
    fn remove_client(&mut self, i: usize) {
        if i < self.clients.len() {
            self.clients.swap_remove(i);
            self.write_info();
        }
    }

    fn write_info(&self) {
        let _ = self.registry.write_info_file(
            self.name,
            process::id() as i32,
            self.clients.len() as u32,
            self.created,
            &self.displayed,
        );
    }

    /// Tear the session down, exactly once, as the loop exits.
    ///
    /// Escalates SIGHUP → SIGTERM → SIGKILL against an unreaped child
    /// with the fixed 50 ms / 100 ms pauses, folds any newly observed
    /// wait status into the recorded exit code, broadcasts the final
    /// EXIT frame, closes every descriptor and erases the registry
    /// files. Each step is best-effort; the sequence always completes.
    fn shutdown(mut self) -> i32 {
        let pid = CHILD_PID.load(Ordering::Acquire);
        if pid > 0 {
            let child = Pid::from_raw(pid);
            let _ = kill(child, Signal::SIGHUP);
            thread::sleep(Duration::from_millis(50));
            if !try_reap(child) {
                let _ = kill(child, Signal::SIGTERM);
                thread::sleep(Duration::from_millis(100));
                if !try_reap(child) {
                    let _ = kill(child, Signal::SIGKILL);
                    // The child is unambiguously terminal now; block.
                    if let Ok(status) = waitpid(child, None) {
                        record_exit_status(status);
                    }
                }
            }
        }

        let code = CHILD_EXIT.load(Ordering::Acquire).max(0);
        broadcast_frame(&mut self.clients, &Frame::Exit(code as u8));

        self.clients.clear();
        self.registry.remove_session(self.name);
        debug!(name = self.name, code, "session closed");
        code
    }
}

/// Run the admission handshake on a fresh connection: a well-formed
/// HELLO within 2 s, or the connection is discarded. On success the
/// socket is switched to its operational timeouts.
fn admit(mut stream: UnixStream) -> Result<(UnixStream, u16, u16)> {
    stream.set_read_timeout(Some(HELLO_TIMEOUT))?;
    let raw = protocol::read_frame(&mut stream)?;
    match raw.decode() {
        Some(Frame::Hello { cols, rows }) => {
            stream.set_read_timeout(Some(CLIENT_RECV_TIMEOUT))?;
            stream.set_write_timeout(Some(CLIENT_SEND_TIMEOUT))?;
            Ok((stream, cols, rows))
        }
        _ => bail!("first frame was not a well-formed HELLO"),
    }
}

/// Send one frame to every client, dropping those whose send fails.
/// Iterates back to front so in-place removal stays sound. Returns true
/// when the table changed.
fn broadcast_frame(clients: &mut Vec<UnixStream>, frame: &Frame) -> bool {
    let before = clients.len();
    for i in (0..clients.len()).rev() {
        if protocol::write_frame(&mut clients[i], frame).is_err() {
            debug!("dropping client after failed send");
            clients.swap_remove(i);
        }
    }
    clients.len() != before
}

/// Bind the listening socket, replacing any leftover node, and force
/// mode 0600 on it.
fn bind_session_socket(path: &Path) -> Result<UnixListener> {
    let _ = fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind session socket {}", path.display()))?;
    listener.set_nonblocking(true)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Non-blocking reap attempt during shutdown escalation. Treats an
/// already-reaped child (the handler got there first) as done.
fn try_reap(child: Pid) -> bool {
    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => {
            record_exit_status(status);
            true
        }
        Err(_) => true,
    }
}

/// Keep the first recorded exit code; later observations never override
/// the one decoded at reap time.
fn record_exit_status(status: WaitStatus) {
    if CHILD_EXIT.load(Ordering::Acquire) < 0 {
        if let Some(code) = decode_wait_status(status) {
            CHILD_EXIT.store(code, Ordering::Release);
        }
    }
}

fn redirect_stdio_to_null() {
    if let Ok(null) = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
    {
        let fd = null.as_raw_fd();
        unsafe {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
        }
    }
}

fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // The raw fds polled here are owned by `self` for the whole tick.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostly_core::protocol::{read_frame, write_frame};
    use std::io::Read;

    #[test]
    fn test_admit_accepts_well_formed_hello() {
        let (mut peer, stream) = UnixStream::pair().unwrap();
        write_frame(
            &mut peer,
            &Frame::Hello {
                cols: 132,
                rows: 43,
            },
        )
        .unwrap();

        let (_client, cols, rows) = admit(stream).expect("hello should admit");
        assert_eq!((cols, rows), (132, 43));
    }

    #[test]
    fn test_admit_rejects_wrong_first_frame() {
        let (mut peer, stream) = UnixStream::pair().unwrap();
        write_frame(&mut peer, &Frame::Data(b"sneaky".to_vec())).unwrap();
        assert!(admit(stream).is_err());
    }

    #[test]
    fn test_admit_rejects_malformed_hello_payload() {
        let (mut peer, stream) = UnixStream::pair().unwrap();
        // HELLO tag with a 2-byte payload: wrong shape.
        use std::io::Write;
        peer.write_all(&[0x05, 0, 0, 0, 2, 0, 80]).unwrap();
        assert!(admit(stream).is_err());
    }

    #[test]
    fn test_admit_rejects_closed_peer() {
        let (peer, stream) = UnixStream::pair().unwrap();
        drop(peer);
        assert!(admit(stream).is_err());
    }

    #[test]
    fn test_admit_times_out_without_hello() {
        let (_peer, stream) = UnixStream::pair().unwrap();
        let start = std::time::Instant::now();
        assert!(admit(stream).is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "returned too early");
        assert!(elapsed < Duration::from_secs(10), "timeout missed");
    }

    #[test]
    fn test_broadcast_drops_failed_client_only() {
        let (mut alive_peer, alive) = UnixStream::pair().unwrap();
        let (dead_peer, dead) = UnixStream::pair().unwrap();
        drop(dead_peer);

        let mut clients = vec![alive, dead];
        let changed = broadcast_frame(&mut clients, &Frame::Data(b"hello".to_vec()));

        assert!(changed);
        assert_eq!(clients.len(), 1);
        let raw = read_frame(&mut alive_peer).unwrap();
        assert_eq!(raw.decode(), Some(Frame::Data(b"hello".to_vec())));
    }

    #[test]
    fn test_broadcast_unchanged_table_reports_false() {
        let (mut peer_a, a) = UnixStream::pair().unwrap();
        let (mut peer_b, b) = UnixStream::pair().unwrap();
        let mut clients = vec![a, b];

        let changed = broadcast_frame(&mut clients, &Frame::Exit(0));
        assert!(!changed);
        assert_eq!(clients.len(), 2);

        for peer in [&mut peer_a, &mut peer_b] {
            let raw = read_frame(peer).unwrap();
            assert_eq!(raw.decode(), Some(Frame::Exit(0)));
        }
    }

    #[test]
    fn test_bind_session_socket_replaces_stale_node_and_sets_mode() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("s.sock");
        fs::write(&path, "stale").unwrap();

        let listener = bind_session_socket(&path).expect("bind");
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        // The socket accepts connections.
        let mut client = UnixStream::connect(&path).unwrap();
        let (mut conn, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        use std::io::Write;
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
