//! End-to-end tests driving the compiled binary against real daemons.
//!
//! Each test uses a unique session name so the per-user registry can be
//! shared with whatever else is running, and kills its session on the
//! way out.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use ghostly_core::protocol::{Frame, read_frame, write_frame};

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ghostly-session"))
}

fn unique_name(tag: &str) -> String {
    format!("e2e-{tag}-{}", std::process::id())
}

fn socket_path(name: &str) -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/ghostly-{uid}/{name}.sock"))
}

fn info_path(name: &str) -> PathBuf {
    socket_path(name).with_extension("info")
}

fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

/// Connect to a session's socket and complete the HELLO handshake.
fn attach_raw(name: &str) -> UnixStream {
    let mut stream = UnixStream::connect(socket_path(name)).expect("connect");
    write_frame(&mut stream, &Frame::Hello { cols: 80, rows: 24 }).expect("hello");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

#[test]
fn test_create_list_kill_lifecycle() {
    let name = unique_name("lifecycle");

    let status = bin()
        .args(["create", &name, "--", "sleep", "30"])
        .status()
        .expect("run create");
    assert!(status.success());
    assert!(
        wait_for(Duration::from_secs(2), || socket_path(&name).exists()),
        "socket never appeared"
    );

    let list = bin().args(["list", "--json"]).output().expect("run list");
    let listing = String::from_utf8_lossy(&list.stdout).to_string();
    assert!(listing.contains(&name), "list should show {name}: {listing}");
    assert!(listing.contains("sleep 30"));

    let status = bin().args(["kill", &name]).status().expect("run kill");
    assert!(status.success());
    assert!(!socket_path(&name).exists());
    assert!(!info_path(&name).exists());

    // A second kill finds nothing and reports failure.
    let again = bin().args(["kill", &name]).status().expect("run kill");
    assert!(!again.success());
}

#[test]
fn test_attached_client_sees_output_and_exit_code() {
    let name = unique_name("exitcode");

    let status = bin()
        .args([
            "create",
            &name,
            "--",
            "sleep",
            "1;",
            "echo",
            "e2e-marker;",
            "exit",
            "7",
        ])
        .status()
        .expect("run create");
    assert!(status.success());
    assert!(wait_for(Duration::from_secs(2), || socket_path(&name)
        .exists()));

    let mut stream = attach_raw(&name);

    let mut collected = Vec::new();
    let mut exit_code = None;
    while exit_code.is_none() {
        let raw = match read_frame(&mut stream) {
            Ok(raw) => raw,
            Err(e) => panic!(
                "stream ended before EXIT (saw {:?}): {e}",
                String::from_utf8_lossy(&collected)
            ),
        };
        match raw.decode() {
            Some(Frame::Data(bytes)) => collected.extend_from_slice(&bytes),
            Some(Frame::Exit(code)) => exit_code = Some(code),
            _ => {}
        }
    }

    let output = String::from_utf8_lossy(&collected);
    assert!(output.contains("e2e-marker"), "missing marker in {output:?}");
    assert_eq!(exit_code, Some(7));

    // EXIT is the final frame: the stream reaches EOF afterwards.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty(), "bytes after EXIT: {rest:?}");

    // The session erased its registry files on the way out.
    assert!(wait_for(Duration::from_secs(2), || !socket_path(&name)
        .exists()));
    assert!(!info_path(&name).exists());
}

#[test]
fn test_detach_leaves_session_running() {
    let name = unique_name("detach");

    let status = bin()
        .args(["create", &name, "--", "sleep", "30"])
        .status()
        .expect("run create");
    assert!(status.success());
    assert!(wait_for(Duration::from_secs(2), || socket_path(&name)
        .exists()));

    let mut stream = attach_raw(&name);
    assert!(
        wait_for(Duration::from_secs(2), || std::fs::read_to_string(
            info_path(&name)
        )
        .is_ok_and(|s| s.contains("clients=1"))),
        "client count never reached 1"
    );

    write_frame(&mut stream, &Frame::Detach).expect("detach");
    assert!(
        wait_for(Duration::from_secs(2), || std::fs::read_to_string(
            info_path(&name)
        )
        .is_ok_and(|s| s.contains("clients=0"))),
        "client count never fell back to 0"
    );

    // Still alive and listed after the detach.
    let list = bin().args(["list"]).output().expect("run list");
    assert!(String::from_utf8_lossy(&list.stdout).contains(&name));

    let status = bin().args(["kill", &name]).status().expect("run kill");
    assert!(status.success());
}

#[test]
fn test_version_and_invalid_name_surface() {
    let version = bin().arg("version").output().expect("run version");
    assert!(
        String::from_utf8_lossy(&version.stdout).contains("ghostly-session")
    );

    let bad = bin()
        .args(["attach", "no/such/name"])
        .output()
        .expect("run attach");
    assert!(!bad.status.success());
    assert!(String::from_utf8_lossy(&bad.stderr).contains("invalid session name"));
}
