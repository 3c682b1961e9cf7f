//! Host information report for the `info` subcommand.
//!
//! A pure reporting utility: load average, disk usage of the home
//! filesystem, environment identity, SLURM queue depth and the live
//! session count. Every probe degrades to `N/A` rather than failing the
//! command.

use std::env;
use std::process::Command;

use anyhow::Result;
use nix::sys::statvfs::statvfs;

use crate::daemon::registry::Registry;

pub fn report(json: bool) -> Result<i32> {
    let user = env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let conda = env::var("CONDA_DEFAULT_ENV").unwrap_or_else(|_| "none".to_string());
    let load = load_average()
        .map(|l| format!("{l:.2}"))
        .unwrap_or_else(|| "N/A".to_string());
    let disk = home_disk_usage()
        .map(|pct| format!("{pct}%"))
        .unwrap_or_else(|| "N/A".to_string());
    let jobs = slurm_job_count(&user).unwrap_or_else(|| "N/A".to_string());
    let sessions = Registry::open()
        .map(|registry| registry.enumerate().len())
        .unwrap_or(0);

    if json {
        let payload = serde_json::json!({
            "user": user,
            "conda": conda,
            "load": load,
            "disk": disk,
            "slurm_jobs": jobs,
            "sessions": sessions,
            "backend": "ghostly",
        });
        println!("{payload}");
    } else {
        println!("USER:{user}");
        println!("CONDA:{conda}");
        println!("LOAD:{load}");
        println!("DISK:{disk}");
        println!("JOBS:{jobs}");
        println!("MUX:ghostly");
        println!("SESSIONS:{sessions}");
    }
    Ok(0)
}

/// 1-minute load average.
fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n >= 1).then_some(loads[0])
}

/// Percent of the home filesystem in use.
fn home_disk_usage() -> Option<u64> {
    let home = env::var("HOME").ok()?;
    let stat = statvfs(home.as_str()).ok()?;
    let frag = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frag;
    let avail = stat.blocks_available() as u64 * frag;
    if total == 0 {
        return None;
    }
    Some(100 * (total - avail) / total)
}

/// Number of queued SLURM jobs for `user`, as a string.
///
/// `squeue` runs without a shell; a user name carrying anything outside
/// `[A-Za-z0-9._-]` is refused rather than passed along. `None` when
/// squeue is missing or fails.
fn slurm_job_count(user: &str) -> Option<String> {
    let safe = !user.is_empty()
        && user
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if !safe {
        return None;
    }

    let output = Command::new("squeue")
        .args(["-u", user, "-h"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let count = output
        .stdout
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .count();
    Some(count.to_string())
}
