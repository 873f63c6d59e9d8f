//! Spawning service processes and capturing their output

use std::net::{Ipv4Addr, TcpListener};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::CommandSpec;
use crate::errors::{DaemonError, Result};
use crate::logs::LogStore;

/// A freshly spawned child and its output capture tasks
pub struct SpawnedProcess {
    pub child: Child,
    pub stdout_task: Option<JoinHandle<()>>,
    pub stderr_task: Option<JoinHandle<()>>,
}

/// Whether something already listens on `127.0.0.1:port`
pub fn port_in_use(port: u16) -> bool {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
    }
}

/// Build a `Command` from a `CommandSpec` after the pre-spawn checks.
fn build_command(service: &str, spec: &CommandSpec) -> Result<Command> {
    let Some((program, args)) = spec.program_and_args.split_first() else {
        return Err(DaemonError::Config(format!(
            "Service {} has empty command",
            service
        )));
    };

    if !spec.working_dir.is_dir() {
        return Err(DaemonError::WorkingDirMissing {
            service: service.to_string(),
            path: spec.working_dir.clone(),
        });
    }

    if let Some(port) = spec.port
        && port_in_use(port)
    {
        return Err(DaemonError::PortInUse {
            service: service.to_string(),
            port,
        });
    }

    debug!("Spawning command: {} {:?}", program, args);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .envs(&spec.environment);

    // Own process group so termination reaches worker subprocesses
    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

/// Spawn a task that appends every line of a stream to the service log.
///
/// Lines are decoded lossily. The stream is drained until EOF no matter what
/// it carries, so the child never sees a closed pipe.
fn spawn_capture_task(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    logs: Arc<LogStore>,
    service: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    logs.append(&service, line.trim_end_matches(['\n', '\r']));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Output capture for service {} failed: {}", service, e);
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    break;
                }
            }
        }
    })
}

/// Spawn the process described by `spec`, mirroring stdout/stderr into `logs`.
pub fn spawn_process(service: &str, spec: &CommandSpec, logs: Arc<LogStore>) -> Result<SpawnedProcess> {
    let mut cmd = build_command(service, spec)?;

    let mut child = cmd.spawn().map_err(|e| DaemonError::ProcessSpawn {
        service: service.to_string(),
        source: e,
    })?;

    debug!("Service {} spawned with PID {:?}", service, child.id());

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| spawn_capture_task(stdout, logs.clone(), service.to_string()));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| spawn_capture_task(stderr, logs, service.to_string()));

    Ok(SpawnedProcess {
        child,
        stdout_task,
        stderr_task,
    })
}
