//! Identity of OS processes on this host.
//!
//! A bare pid is not enough to recognise a worker: once the worker dies the
//! kernel can hand its pid to an unrelated process. Worker sessions record
//! the hostname and the process start time next to the pid, and a process
//! only counts as the recorded one when all three match.

use std::sync::OnceLock;

/// Name of this host, or `"unknown"` if it can't be read.
pub fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| read_hostname().unwrap_or_else(|_| "unknown".to_string()))
}

#[cfg(unix)]
fn read_hostname() -> std::io::Result<String> {
    let mut buf = vec![0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(end);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(not(unix))]
fn read_hostname() -> std::io::Result<String> {
    Ok("unknown".to_string())
}

/// Start time of `pid` in clock ticks since boot, from `/proc/<pid>/stat`.
///
/// `None` if the process doesn't exist or the platform has no procfs.
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: i64) -> Option<i64> {
    if pid <= 0 {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: i64) -> Option<i64> {
    None
}

/// Field 22 of a `/proc/<pid>/stat` line. The command name in field 2 may
/// itself contain spaces and parentheses, so fields are counted from the
/// last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_start_time(stat: &str) -> Option<i64> {
    let (_, rest) = stat.rsplit_once(')')?;
    // rest starts at field 3 (state)
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

/// Whether an OS process with this pid exists on this host.
///
/// A process owned by another user still counts.
#[cfg(unix)]
pub fn pid_exists(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_exists(_pid: i64) -> bool {
    true
}

/// Whether the process recorded as (`hostname`, `pid`, `start_time`) is
/// still running here.
///
/// A process on another host is never treated as running, since nothing on
/// this host can observe or signal it. Without a recorded start time only
/// the pid is compared.
pub fn is_running(recorded_host: &str, pid: i64, start_time: Option<i64>) -> bool {
    if recorded_host != hostname() || !pid_exists(pid) {
        return false;
    }
    match start_time {
        Some(recorded) => process_start_time(pid) == Some(recorded),
        None => true,
    }
}
