//! Owner process liveness and termination.

use std::time::Duration;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether a process with this pid exists.
///
/// A process we may not signal still exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn send(pid: u32, signal: Signal) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), signal).is_ok(),
        _ => false,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Never signals the calling process. Returns true once the process is gone.
#[cfg(unix)]
pub async fn terminate_process(pid: u32, grace: Duration) -> bool {
    if pid == std::process::id() {
        debug!(pid, "Not terminating own process");
        return false;
    }
    if !is_process_alive(pid) {
        return true;
    }

    info!(pid, "Sending SIGTERM to job owner");
    if !send(pid, Signal::SIGTERM) {
        return !is_process_alive(pid);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!(pid, "Job owner ignored SIGTERM, sending SIGKILL");
    send(pid, Signal::SIGKILL);
    tokio::time::sleep(POLL_INTERVAL).await;
    !is_process_alive(pid)
}

#[cfg(not(unix))]
pub async fn terminate_process(_pid: u32, _grace: Duration) -> bool {
    false
}
