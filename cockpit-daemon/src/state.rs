use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::process::ProcessHandle;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Error,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Error => "error",
            ServiceState::Stopping => "stopping",
        }
    }

    /// States in which a process is expected to be alive and monitored
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::Unhealthy
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running | Error | Stopping)
                | (Running, Unhealthy | Stopping | Error)
                | (Unhealthy, Running | Stopping | Error)
                | (Error, Starting | Stopping | Stopped)
                | (Stopping, Stopped | Error)
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus the generation it belongs to, published to monitors and waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSignal {
    pub state: ServiceState,
    pub generation: u64,
}

impl StateSignal {
    /// Whether a task started for `generation` should keep working
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state.is_active()
    }
}

/// Mutable runtime record of one service
#[derive(Debug)]
pub struct ServiceRuntime {
    pub state: ServiceState,
    /// Present while a spawned process has not been confirmed exited
    pub process: Option<ProcessHandle>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
    /// Incremented on every spawn
    pub generation: u64,
    /// The current generation failed by running out its startup timeout
    pub startup_expired: bool,
    /// Health monitor task of the current generation
    pub monitor: Option<JoinHandle<()>>,
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self {
            state: ServiceState::Stopped,
            process: None,
            started_at: None,
            last_error: None,
            exit_code: None,
            generation: 0,
            startup_expired: false,
            monitor: None,
        }
    }
}

impl ServiceRuntime {
    /// Move to `next` if the state machine allows it. Returns whether the state changed.
    pub fn transition(&mut self, service: &str, next: ServiceState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "Ignoring invalid transition for service {}: {} -> {}",
                service, self.state, next
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Move to Error and record the reason
    pub fn fail(&mut self, service: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let changed = self.transition(service, ServiceState::Error);
        if changed {
            self.last_error = Some(reason);
        }
        changed
    }

    /// Stop the current health monitor, if any
    pub fn abort_monitor(&mut self) {
        if let Some(task) = self.monitor.take() {
            task.abort();
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }
}

/// Read-only projection of one service, safe to hand to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub id: String,
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    /// Probe URL; `None` for liveness-only services
    pub health_endpoint: Option<String>,
    pub depends_on: Vec<String>,
    pub model_bound: bool,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub health_failures: u32,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
}
