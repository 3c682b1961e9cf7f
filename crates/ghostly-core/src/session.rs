//! Session naming rules and the record surfaced by `list`.

use serde::{Deserialize, Serialize};

/// Maximum session name length.
pub const MAX_NAME_LEN: usize = 64;

/// Validate a session name.
///
/// Names are path components under the registry root, so the rules are
/// strict: 1..=64 characters drawn from `[A-Za-z0-9._-]`, and never the
/// reserved `.` or `..`. Every entry point applies this, and names read
/// back from the registry that fail it are treated as nonexistent.
pub fn valid_session_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name == "." || name == ".." {
        return false;
    }
    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// A live session as reported by `list`.
///
/// Field order matches the JSON output shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    /// Currently attached client count.
    pub clients: u32,
    /// Creation time, epoch seconds.
    pub created: i64,
    /// The displayed command line.
    pub command: String,
    /// The daemon's process id.
    pub pid: i32,
}
