//! Applying health and exit events to the runtime records

use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Inner;
use crate::health::{HealthEvent, HealthEventKind};
use crate::process::ProcessExitEvent;
use crate::state::ServiceState;

/// Feed monitor and watcher events into the orchestrator until it is dropped.
pub(super) async fn run_event_loop(
    inner: Weak<Inner>,
    mut health_rx: mpsc::Receiver<HealthEvent>,
    mut exit_rx: mpsc::Receiver<ProcessExitEvent>,
) {
    loop {
        tokio::select! {
            Some(event) = health_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                if let HealthEventKind::StartupExpired { .. } = event.kind {
                    // Terminating takes the operation lock; keep the loop free
                    tokio::spawn(async move {
                        inner.expire_startup(&event.service, event.generation).await;
                    });
                } else {
                    inner.apply_health_event(event);
                }
            }
            Some(event) = exit_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.apply_exit_event(event);
            }
            else => break,
        }
    }
    debug!("Orchestrator event loop stopped");
}

/// What an exit meant for the service that owned the process
enum ExitDisposition {
    Stale,
    Expected,
    Unexpected,
}

impl Inner {
    pub(super) fn apply_health_event(&self, event: HealthEvent) {
        let HealthEvent {
            service,
            generation,
            kind,
        } = event;
        let Some(slot) = self.slots.get(&service) else {
            warn!("Health event for unknown service {}", service);
            return;
        };

        let transition = slot.update(|rt| {
            if rt.generation != generation {
                debug!(
                    "Discarding stale health event for {} (generation {}, current {})",
                    service, generation, rt.generation
                );
                return None;
            }

            let from = rt.state;
            let changed = match (&kind, from) {
                (HealthEventKind::Ready, ServiceState::Starting) => {
                    rt.transition(&service, ServiceState::Running)
                }
                (HealthEventKind::Unhealthy { .. }, ServiceState::Running) => {
                    rt.transition(&service, ServiceState::Unhealthy)
                }
                (HealthEventKind::Recovered, ServiceState::Unhealthy) => {
                    rt.transition(&service, ServiceState::Running)
                }
                (HealthEventKind::Failed { reason, .. }, ServiceState::Unhealthy) => {
                    rt.fail(&service, format!("health check failing: {}", reason))
                }
                _ => {
                    debug!("Ignoring {:?} for {} in state {}", kind, service, from);
                    false
                }
            };
            changed.then_some((from, rt.state))
        });

        let Some((from, to)) = transition else {
            return;
        };
        match &kind {
            HealthEventKind::Unhealthy { failures } => {
                warn!("Service {} unhealthy after {} failed checks", service, failures)
            }
            HealthEventKind::Failed { failures, reason } => error!(
                "Service {} failed after {} consecutive failed checks: {}",
                service, failures, reason
            ),
            _ => info!("Service {}: {} -> {}", service, from, to),
        }
        self.logs
            .append(&service, &format!("[cockpit] {} -> {}", from, to));
    }

    pub(super) fn apply_exit_event(&self, event: ProcessExitEvent) {
        let ProcessExitEvent {
            service,
            generation,
            pid,
            exit,
        } = event;
        let Some(slot) = self.slots.get(&service) else {
            warn!("Exit event for unknown service {}", service);
            return;
        };

        let disposition = slot.update(|rt| {
            if rt.generation != generation {
                return ExitDisposition::Stale;
            }
            rt.exit_code = exit.code;
            match rt.state {
                // The stop operation owns the record until it confirms
                ServiceState::Stopping => ExitDisposition::Expected,
                ServiceState::Error | ServiceState::Stopped => {
                    rt.process = None;
                    ExitDisposition::Expected
                }
                ServiceState::Starting | ServiceState::Running | ServiceState::Unhealthy => {
                    rt.abort_monitor();
                    rt.process = None;
                    rt.fail(
                        &service,
                        format!("process exited unexpectedly ({})", exit.describe()),
                    );
                    ExitDisposition::Unexpected
                }
            }
        });

        match disposition {
            ExitDisposition::Stale => {
                debug!(
                    "Discarding exit of {} pid {} from superseded generation {}",
                    service, pid, generation
                );
                return;
            }
            ExitDisposition::Expected => {
                debug!("Service {} pid {} exited: {}", service, pid, exit.describe());
            }
            ExitDisposition::Unexpected => {
                error!(
                    "Service {} pid {} exited unexpectedly: {}",
                    service,
                    pid,
                    exit.describe()
                );
                self.logs.append(
                    &service,
                    &format!("[cockpit] process {} exited unexpectedly ({})", pid, exit.describe()),
                );
            }
        }
        self.persist();
    }
}
