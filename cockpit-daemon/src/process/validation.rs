//! Process validation for orphan recovery

use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[cfg(unix)]
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Start time of a live process (Unix timestamp, seconds), if it can be queried.
#[cfg(unix)]
pub fn process_start_time(pid: u32) -> Option<i64> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        false,
        ProcessRefreshKind::nothing(),
    );
    let process = sys.process(sysinfo_pid)?;
    Some(process.start_time() as i64)
}

#[cfg(not(unix))]
pub fn process_start_time(_pid: u32) -> Option<i64> {
    None
}

/// Whether a process with this PID exists right now
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 only checks for existence
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    false
}

/// Validate that a previously recorded process is still the same live process.
///
/// `expected_start_time` guards against PID reuse: a process with the same PID
/// but a different start time is not ours.
pub fn validate_running_process(pid: u32, expected_start_time: Option<i64>) -> bool {
    if !process_exists(pid) {
        trace!("Process {} does not exist", pid);
        return false;
    }

    let Some(expected_ts) = expected_start_time else {
        warn!("No recorded start time for PID {}, cannot rule out PID reuse", pid);
        return false;
    };

    let Some(actual_ts) = process_start_time(pid) else {
        trace!("Cannot query start time for PID {}, rejecting", pid);
        return false;
    };

    let diff = (expected_ts - actual_ts).abs();
    if diff > 1 {
        trace!(
            "Process {} start time mismatch: expected {}, got {} - likely PID reuse",
            pid, expected_ts, actual_ts
        );
        return false;
    }

    true
}

/// Kill a process group left behind by a previous daemon run.
///
/// Sends SIGTERM to the group, waits up to `grace`, then SIGKILL.
/// Returns `true` if the process is gone afterwards.
pub async fn kill_process_by_pid(pid: u32, grace: Duration) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let nix_pid = Pid::from_raw(pid as i32);

        if !process_exists(pid) {
            return true;
        }

        info!("Killing orphaned process group {} (SIGTERM)", pid);
        if let Err(e) = killpg(nix_pid, Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !process_exists(pid) {
                debug!("Process group {} terminated gracefully", pid);
                return true;
            }
        }

        warn!("Process group {} did not respond to SIGTERM, sending SIGKILL", pid);
        if let Err(e) = killpg(nix_pid, Signal::SIGKILL) {
            warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
            return false;
        }

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if !process_exists(pid) {
                debug!("Process group {} killed with SIGKILL", pid);
                return true;
            }
        }

        error!("Process {} survived SIGKILL", pid);
        false
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
        warn!("kill_process_by_pid not supported on this platform");
        false
    }
}
