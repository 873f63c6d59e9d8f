//! Async utilities to wait for state transitions

use cockpit_daemon::ServiceOrchestrator;
use cockpit_daemon::state::ServiceState;
use std::time::Duration;
use tokio::time::{Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Error type for wait operations
#[derive(Debug)]
pub enum WaitError {
    Timeout { last: Option<ServiceState> },
    ServiceNotFound,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout { last } => write!(f, "Wait operation timed out (last state: {:?})", last),
            WaitError::ServiceNotFound => write!(f, "Service not found"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Wait for a service to reach `state`
pub async fn wait_for_state(
    orchestrator: &ServiceOrchestrator,
    service: &str,
    state: ServiceState,
    timeout: Duration,
) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    loop {
        let current = orchestrator.state_of(service).ok_or(WaitError::ServiceNotFound)?;
        if current == state {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout { last: Some(current) });
        }
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for_running(
    orchestrator: &ServiceOrchestrator,
    service: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_state(orchestrator, service, ServiceState::Running, timeout).await
}

pub async fn wait_for_error(
    orchestrator: &ServiceOrchestrator,
    service: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_state(orchestrator, service, ServiceState::Error, timeout).await
}

pub async fn wait_for_stopped(
    orchestrator: &ServiceOrchestrator,
    service: &str,
    timeout: Duration,
) -> Result<(), WaitError> {
    wait_for_state(orchestrator, service, ServiceState::Stopped, timeout).await
}

/// Poll `condition` until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> Result<(), WaitError> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout { last: None });
        }
        sleep(POLL_INTERVAL).await;
    }
    Ok(())
}
