//! Error types for service orchestration

use std::time::Duration;

use crate::config::format_duration;
use crate::errors::DaemonError;
use crate::state::ServiceState;

/// Errors reported by orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Failed to spawn service {service}: {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: DaemonError,
    },

    #[error("Service {service} cannot start because dependency {dependency} is not running: {reason}")]
    DependencyFailed {
        service: String,
        dependency: String,
        reason: String,
    },

    #[error("Service {service} did not become healthy within {}", format_duration(.timeout))]
    StartupTimeout { service: String, timeout: Duration },

    #[error("Service {service} failed to start: {reason}")]
    StartFailed { service: String, reason: String },

    #[error("Start of service {service} was interrupted (now {state})")]
    StartInterrupted { service: String, state: ServiceState },

    #[error("Service {service} (PID {pid}) could not be confirmed stopped")]
    TerminationTimeout { service: String, pid: u32 },

    #[error("Switch to model {model} failed: {source}")]
    ModelSwitchFailed {
        model: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Daemon error: {0}")]
    DaemonError(#[from] DaemonError),
}

impl OrchestratorError {
    /// Map a process-level termination failure onto the operation error
    pub(super) fn from_termination(error: DaemonError) -> Self {
        match error {
            DaemonError::TerminationTimeout { service, pid } => {
                OrchestratorError::TerminationTimeout { service, pid }
            }
            other => OrchestratorError::DaemonError(other),
        }
    }
}
