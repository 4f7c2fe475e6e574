use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::time::Duration;

/// Result of a zero-signal probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidProbe {
    Alive,
    Gone,
}

fn to_pid(pid: u32) -> io::Result<Pid> {
    // pid 0 and negative values address process groups, never a single tunnel.
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

/// `kill(pid, 0)`. EPERM means the process exists but belongs to someone else.
pub fn probe_pid(pid: u32) -> io::Result<PidProbe> {
    let pid = match to_pid(pid) {
        Ok(p) => p,
        Err(_) => return Ok(PidProbe::Gone),
    };
    match signal::kill(pid, None) {
        Ok(()) => Ok(PidProbe::Alive),
        Err(Errno::ESRCH) => Ok(PidProbe::Gone),
        Err(Errno::EPERM) => Ok(PidProbe::Alive),
        Err(e) => Err(io::Error::other(e)),
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    matches!(probe_pid(pid), Ok(PidProbe::Alive))
}

/// Deliver `sig`. Returns `Ok(false)` when the process was already gone.
pub fn send_signal(pid: u32, sig: Signal) -> io::Result<bool> {
    match signal::kill(to_pid(pid)?, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// SIGTERM, poll until the process disappears, SIGKILL once `timeout`
/// elapses. Returns whether the process was still around to be signalled.
pub async fn terminate(pid: u32, timeout: Duration) -> io::Result<bool> {
    if !send_signal(pid, Signal::SIGTERM)? {
        return Ok(false);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while is_pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
            let _ = send_signal(pid, Signal::SIGKILL);
            tokio::time::sleep(Duration::from_millis(100)).await;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(true)
}

/// Resolves on the first SIGTERM or SIGINT.
pub async fn signal_shutdown() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_self_is_alive() {
        assert_eq!(probe_pid(std::process::id()).unwrap(), PidProbe::Alive);
    }

    #[test]
    fn test_probe_missing_pid_is_gone() {
        // above the default pid_max, so never allocated
        assert_eq!(probe_pid(4_194_305).unwrap(), PidProbe::Gone);
    }

    #[test]
    fn test_probe_zero_is_gone() {
        assert_eq!(probe_pid(0).unwrap(), PidProbe::Gone);
    }

    #[test]
    fn test_send_signal_to_missing_pid() {
        assert!(!send_signal(4_194_305, Signal::SIGTERM).unwrap());
    }

    #[tokio::test]
    async fn test_terminate_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        assert!(terminate(pid, Duration::from_secs(5)).await.unwrap());
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
        assert!(!is_pid_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_missing_pid() {
        assert!(!terminate(4_194_305, Duration::from_millis(100)).await.unwrap());
    }
}
