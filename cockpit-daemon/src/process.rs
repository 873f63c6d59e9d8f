//! Process controller
//!
//! This module provides:
//! - `CommandSpec` - Rendered launch specification
//! - `spawn_service` - Spawn one process instance with an exit watcher
//! - `terminate` - Graceful then forceful termination with confirmation
//! - `validate_running_process` / `kill_process_by_pid` - Orphan recovery

mod command;
mod spawn;
mod validation;

pub use command::CommandSpec;
pub use spawn::{SpawnedProcess, port_in_use, spawn_process};
pub use validation::{kill_process_by_pid, process_exists, process_start_time, validate_running_process};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{DaemonError, Result};
use crate::logs::LogStore;

/// How long to wait for the OS to confirm exit after the forceful signal
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How a process instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Exit notification, tagged with the generation the process was spawned as
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub service: String,
    pub generation: u64,
    pub pid: u32,
    pub exit: ProcessExit,
}

/// Handle to one live process instance.
///
/// The `Child` itself is owned by the watcher task, which reaps it and
/// publishes the exit; handles are cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    generation: u64,
    started_at: DateTime<Utc>,
    /// OS start time, recorded for orphan recovery
    os_start_time: Option<i64>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn os_start_time(&self) -> Option<i64> {
        self.os_start_time
    }

    /// Exit status, once the process has been reaped
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the process has been reaped, up to `timeout`.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => exit.clone(),
            // Watcher gone without publishing; trust the OS
            Ok(Err(_)) if !process_exists(self.pid) => Some(ProcessExit {
                code: None,
                signal: None,
                at: Utc::now(),
            }),
            _ => None,
        }
    }
}

/// Spawn one process instance of a service.
///
/// A watcher task reaps the child and publishes a `ProcessExitEvent` tagged
/// with `generation` on `exit_tx`, whether or not the exit was requested.
pub fn spawn_service(
    service: &str,
    generation: u64,
    spec: &CommandSpec,
    logs: Arc<LogStore>,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
) -> Result<ProcessHandle> {
    info!(
        "Starting service {} (generation {}): {:?}",
        service, generation, spec.program_and_args
    );

    let spawned = spawn_process(service, spec, logs)?;
    let pid = spawned.child.id().ok_or_else(|| {
        DaemonError::Internal(format!("Service {} exited before its PID was read", service))
    })?;

    let (exit_state_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = mpsc::channel(1);

    tokio::spawn(watch_process(
        service.to_string(),
        generation,
        pid,
        spawned,
        exit_state_tx,
        kill_rx,
        exit_tx,
    ));

    Ok(ProcessHandle {
        pid,
        generation,
        started_at: Utc::now(),
        os_start_time: process_start_time(pid),
        exit_rx,
        kill_tx,
    })
}

/// Own the child until it exits, then publish the exit.
async fn watch_process(
    service: String,
    generation: u64,
    pid: u32,
    spawned: SpawnedProcess,
    exit_state_tx: watch::Sender<Option<ProcessExit>>,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
) {
    let SpawnedProcess {
        mut child,
        stdout_task,
        stderr_task,
    } = spawned;

    let status = loop {
        tokio::select! {
            result = child.wait() => break result,
            Some(()) = kill_rx.recv() => {
                debug!("Kill requested for service {} (PID {})", service, pid);
                let _ = child.start_kill();
            }
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit {
            code: status.code(),
            signal: exit_signal(&status),
            at: Utc::now(),
        },
        Err(e) => {
            warn!("Error waiting for service {} (PID {}): {}", service, pid, e);
            ProcessExit {
                code: None,
                signal: None,
                at: Utc::now(),
            }
        }
    };

    info!("Service {} (PID {}) exited: {}", service, pid, exit.describe());

    // Let the capture tasks drain what the process printed before exiting
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
    }

    exit_state_tx.send_replace(Some(exit.clone()));

    if exit_tx
        .send(ProcessExitEvent {
            service: service.clone(),
            generation,
            pid,
            exit,
        })
        .await
        .is_err()
    {
        debug!("Exit event channel closed for service {}", service);
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Send a signal to the whole process group of a service process
#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    debug!("Sending {:?} to process group {}", signal, pid);
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Terminate a process instance.
///
/// Sends SIGTERM to the process group, waits up to `grace`, then escalates to
/// SIGKILL. Resolves once the exit is confirmed, or with `TerminationTimeout`
/// if even the forceful kill is not confirmed within `KILL_CONFIRM_TIMEOUT`.
pub async fn terminate(service: &str, handle: &ProcessHandle, grace: Duration) -> Result<ProcessExit> {
    if let Some(exit) = handle.exit() {
        return Ok(exit);
    }

    info!("Stopping service {} (PID {})", service, handle.pid);

    #[cfg(unix)]
    signal_group(handle.pid, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = handle.kill_tx.try_send(());

    if let Some(exit) = handle.wait_exit(grace).await {
        debug!("Service {} stopped: {}", service, exit.describe());
        return Ok(exit);
    }

    warn!("Service {} did not stop gracefully, force killing", service);

    #[cfg(unix)]
    signal_group(handle.pid, nix::sys::signal::Signal::SIGKILL);
    let _ = handle.kill_tx.try_send(());

    match handle.wait_exit(KILL_CONFIRM_TIMEOUT).await {
        Some(exit) => Ok(exit),
        None => Err(DaemonError::TerminationTimeout {
            service: service.to_string(),
            pid: handle.pid,
        }),
    }
}

#[cfg(test)]
mod tests;
