//! On-disk session registry.
//!
//! Every session owns three files under the per-user root
//! `/tmp/ghostly-<uid>` (mode 0700): `<name>.sock`, `<name>.pid` and
//! `<name>.info`. A session is alive iff its pid file names a live
//! process; anything else is stale and removed on discovery.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::unistd::getuid;
use tracing::debug;

use ghostly_core::session::{SessionInfo, valid_session_name};

/// Handle to the per-user registry directory.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    /// Open the calling user's registry, creating and verifying the root.
    pub fn open() -> Result<Self> {
        let root = PathBuf::from(format!("/tmp/ghostly-{}", getuid().as_raw()));
        Self::at(root)
    }

    /// Open a registry rooted at an explicit directory.
    ///
    /// The root must be a real directory (not a symlink) owned by the
    /// caller; the symlink and foreign-owner cases are treated as
    /// attacks and refused outright. Permissions are forced to 0700.
    pub fn at(root: PathBuf) -> Result<Self> {
        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot create registry root {}", root.display()));
            }
        }

        let meta = fs::symlink_metadata(&root)
            .with_context(|| format!("cannot stat registry root {}", root.display()))?;
        if meta.file_type().is_symlink() {
            bail!(
                "registry root {} is a symlink (possible attack)",
                root.display()
            );
        }
        if !meta.is_dir() {
            bail!("registry root {} is not a directory", root.display());
        }
        let uid = getuid().as_raw();
        if meta.uid() != uid {
            bail!(
                "registry root {} not owned by uid {} (owner {})",
                root.display(),
                uid,
                meta.uid()
            );
        }
        fs::set_permissions(&root, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("cannot set mode 0700 on {}", root.display()))?;

        Ok(Self { root })
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.sock"))
    }

    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.pid"))
    }

    pub fn info_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.info"))
    }

    /// Refuse socket paths that would not fit in `sockaddr_un.sun_path`,
    /// before any bind or connect is attempted.
    pub fn check_socket_path(path: &Path) -> Result<()> {
        if path.as_os_str().len() >= sun_path_capacity() {
            bail!("socket path too long: {}", path.display());
        }
        Ok(())
    }

    /// Parse the session's pid file. Missing or unparsable files yield
    /// `None`.
    pub fn read_pid(&self, name: &str) -> Option<i32> {
        let text = fs::read_to_string(self.pid_path(name)).ok()?;
        let pid: i32 = text.split_whitespace().next()?.parse().ok()?;
        (pid > 0).then_some(pid)
    }

    pub fn write_pid_file(&self, name: &str, pid: i32) -> std::io::Result<()> {
        fs::write(self.pid_path(name), format!("{pid}\n"))
    }

    pub fn write_info_file(
        &self,
        name: &str,
        pid: i32,
        clients: u32,
        created: i64,
        command: &str,
    ) -> std::io::Result<()> {
        fs::write(
            self.info_path(name),
            format!("pid={pid}\nclients={clients}\ncreated={created}\ncmd={command}\n"),
        )
    }

    /// Best-effort unlink of all three session files. Idempotent.
    pub fn remove_session(&self, name: &str) {
        let _ = fs::remove_file(self.socket_path(name));
        let _ = fs::remove_file(self.pid_path(name));
        let _ = fs::remove_file(self.info_path(name));
    }

    /// True when the session's pid file names a live process.
    pub fn session_alive(&self, name: &str) -> bool {
        self.read_pid(name).is_some_and(process_alive)
    }

    /// Scan the root for sessions, removing stale entries on the way.
    ///
    /// Only `*.sock` entries whose stem passes name validation count;
    /// anything with a dead or missing pid is cleaned up and skipped.
    pub fn enumerate(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return sessions;
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(name) = file_name.strip_suffix(".sock") else {
                continue;
            };
            if !valid_session_name(name) {
                continue;
            }

            let pid = self.read_pid(name).unwrap_or(0);
            if !process_alive(pid) {
                debug!(name, "removing stale session files");
                self.remove_session(name);
                continue;
            }

            let mut info = SessionInfo {
                name: name.to_string(),
                clients: 0,
                created: 0,
                command: "bash".to_string(),
                pid,
            };
            self.read_info_into(name, &mut info);
            sessions.push(info);
        }

        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    /// Fill a record from the info file, tolerating missing keys, any
    /// key order and unknown extra lines.
    fn read_info_into(&self, name: &str, info: &mut SessionInfo) {
        let Ok(text) = fs::read_to_string(self.info_path(name)) else {
            return;
        };
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("clients=") {
                if let Ok(clients) = value.trim().parse() {
                    info.clients = clients;
                }
            } else if let Some(value) = line.strip_prefix("created=") {
                if let Ok(created) = value.trim().parse() {
                    info.created = created;
                }
            } else if let Some(value) = line.strip_prefix("cmd=") {
                info.command = value.trim_end().to_string();
            }
        }
    }
}

/// Probe process liveness without delivering a signal.
pub fn process_alive(pid: i32) -> bool {
    // kill(pid, 0) performs the permission and existence checks only.
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

fn sun_path_capacity() -> usize {
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::at(tmp.path().join("reg")).unwrap();
        (tmp, registry)
    }

    #[test]
    fn test_at_creates_root_with_mode_0700() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("reg");
        let _registry = Registry::at(root.clone()).unwrap();
        let meta = fs::metadata(&root).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn test_at_refuses_symlink_root() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = Registry::at(link).unwrap_err();
        assert!(err.to_string().contains("symlink"));
    }

    #[test]
    fn test_at_refuses_plain_file_root() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, "x").unwrap();

        let err = Registry::at(file).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_path_triples_share_the_name_stem() {
        let (_tmp, registry) = registry();
        assert!(registry.socket_path("s1").ends_with("s1.sock"));
        assert!(registry.pid_path("s1").ends_with("s1.pid"));
        assert!(registry.info_path("s1").ends_with("s1.info"));
    }

    #[test]
    fn test_check_socket_path_length() {
        Registry::check_socket_path(Path::new("/tmp/ghostly-1000/ok.sock")).unwrap();
        let long = format!("/tmp/{}.sock", "x".repeat(200));
        assert!(Registry::check_socket_path(Path::new(&long)).is_err());
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let (_tmp, registry) = registry();
        registry.write_pid_file("s1", 4242).unwrap();
        assert_eq!(registry.read_pid("s1"), Some(4242));
    }

    #[test]
    fn test_read_pid_rejects_garbage() {
        let (_tmp, registry) = registry();
        fs::write(registry.pid_path("s1"), "not-a-pid\n").unwrap();
        assert_eq!(registry.read_pid("s1"), None);
        fs::write(registry.pid_path("s1"), "-5\n").unwrap();
        assert_eq!(registry.read_pid("s1"), None);
        assert_eq!(registry.read_pid("missing"), None);
    }

    #[test]
    fn test_info_file_parse_tolerates_order_and_extras() {
        let (_tmp, registry) = registry();
        fs::write(
            registry.info_path("s1"),
            "future=stuff\ncmd=vim notes.txt\ncreated=1700000000\nclients=3\n",
        )
        .unwrap();
        let mut info = SessionInfo {
            name: "s1".into(),
            clients: 0,
            created: 0,
            command: "bash".into(),
            pid: 1,
        };
        registry.read_info_into("s1", &mut info);
        assert_eq!(info.clients, 3);
        assert_eq!(info.created, 1_700_000_000);
        assert_eq!(info.command, "vim notes.txt");
    }

    #[test]
    fn test_enumerate_reports_live_session() {
        let (_tmp, registry) = registry();
        let pid = std::process::id() as i32;
        fs::write(registry.socket_path("live"), "").unwrap();
        registry.write_pid_file("live", pid).unwrap();
        registry
            .write_info_file("live", pid, 1, 1_700_000_000, "bash")
            .unwrap();

        let sessions = registry.enumerate();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "live");
        assert_eq!(sessions[0].pid, pid);
        assert_eq!(sessions[0].clients, 1);
        assert_eq!(sessions[0].command, "bash");
    }

    #[test]
    fn test_enumerate_cleans_stale_session() {
        let (_tmp, registry) = registry();
        // A pid far above any plausible live process.
        fs::write(registry.socket_path("stale"), "").unwrap();
        registry.write_pid_file("stale", 2_000_000_000).unwrap();
        registry
            .write_info_file("stale", 2_000_000_000, 0, 0, "bash")
            .unwrap();

        assert!(registry.enumerate().is_empty());
        assert!(!registry.socket_path("stale").exists());
        assert!(!registry.pid_path("stale").exists());
        assert!(!registry.info_path("stale").exists());
    }

    #[test]
    fn test_enumerate_skips_invalid_names() {
        let (_tmp, registry) = registry();
        // Files landing next to the sockets that must never be listed.
        let root = registry.socket_path("probe");
        let root = root.parent().unwrap();
        fs::write(root.join("bad name.sock"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();
        assert!(registry.enumerate().is_empty());
    }

    #[test]
    fn test_remove_session_is_idempotent() {
        let (_tmp, registry) = registry();
        registry.write_pid_file("gone", 1).unwrap();
        registry.remove_session("gone");
        registry.remove_session("gone");
        assert!(!registry.pid_path("gone").exists());
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
        assert!(!process_alive(2_000_000_000));
    }
}
