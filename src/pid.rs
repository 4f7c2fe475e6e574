use crate::atomic;
use crate::paths::Paths;
use crate::sys::{self, PidProbe};
use std::fs;
use std::io;

pub fn write_pid_file(paths: &Paths) -> io::Result<()> {
    atomic::write_atomic(&paths.pid_file(), std::process::id().to_string().as_bytes())
}

pub fn read_pid_file(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid_file(paths: &Paths) {
    let _ = fs::remove_file(paths.pid_file());
}

/// Pid of the daemon serving this data directory, if one is alive. A pid file
/// left behind by a dead daemon is removed.
pub fn running_daemon(paths: &Paths) -> io::Result<Option<u32>> {
    let Some(pid) = read_pid_file(paths) else {
        return Ok(None);
    };
    match sys::probe_pid(pid)? {
        PidProbe::Alive => Ok(Some(pid)),
        PidProbe::Gone => {
            tracing::debug!(pid, "removing stale daemon pid file");
            remove_pid_file(paths);
            Ok(None)
        }
    }
}

pub fn is_daemon_running(paths: &Paths) -> io::Result<bool> {
    Ok(running_daemon(paths)?.is_some())
}
