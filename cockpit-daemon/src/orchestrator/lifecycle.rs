//! Per-service start/stop operations and their dependency-ordered aggregates

use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use super::{Inner, OrchestratorError, Result, ServiceSlot};
use crate::config::format_duration;
use crate::health::{MonitorParams, spawn_health_monitor};
use crate::process::{CommandSpec, spawn_service, terminate};
use crate::state::{ServiceState, StateSignal};

impl Inner {
    /// Start a service and everything it depends on, in start order.
    pub(super) async fn start_service(&self, service: &str) -> Result<()> {
        self.slot(service)?;

        for id in self.graph.dependencies_of(service) {
            let result = self.start_one(&id).await;
            if id == service {
                return result;
            }
            if let Err(e) = result {
                return Err(OrchestratorError::DependencyFailed {
                    service: service.to_string(),
                    dependency: id,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop a service after all of its dependents, in stop order.
    pub(super) async fn stop_service(&self, service: &str) -> Result<()> {
        self.slot(service)?;

        for id in self.graph.dependents_of(service) {
            self.stop_one(&id).await?;
        }
        Ok(())
    }

    pub(super) async fn restart_service(&self, service: &str) -> Result<()> {
        self.slot(service)?;

        // Dependents are stopped with the service; bring back the ones that were up
        let active_dependents: Vec<String> = self
            .graph
            .dependents_of(service)
            .into_iter()
            .filter(|id| id != service && self.is_active(id))
            .collect();

        info!("Restarting service {}", service);
        self.stop_service(service).await?;
        tokio::time::sleep(self.restart_delay).await;
        self.start_service(service).await?;

        for id in active_dependents.iter().rev() {
            self.start_service(id).await?;
        }
        Ok(())
    }

    pub(super) async fn start_all(&self) -> Result<()> {
        let mut failed: Vec<String> = Vec::new();
        let mut first_error = None;

        for id in self.graph.start_order() {
            let failed_dependency = failed
                .iter()
                .find(|f| self.graph.depends_on(id, f))
                .cloned();

            let result = match failed_dependency {
                Some(dependency) => Err(OrchestratorError::DependencyFailed {
                    service: id.clone(),
                    dependency,
                    reason: "dependency failed to start".to_string(),
                }),
                None => self.start_one(id).await,
            };

            if let Err(e) = result {
                error!("Failed to start service {}: {}", id, e);
                failed.push(id.clone());
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub(super) async fn stop_all(&self) -> Result<()> {
        let order = self.graph.stop_order().to_vec();
        self.stop_in_order(&order).await
    }

    /// Stop each service in `order` (a stop-order subsequence). A service is
    /// skipped while something depending on it could not be stopped.
    pub(super) async fn stop_in_order(&self, order: &[String]) -> Result<()> {
        let mut failed: Vec<String> = Vec::new();
        let mut first_error = None;

        for id in order {
            if let Some(dependent) = failed.iter().find(|f| self.graph.depends_on(f, id)) {
                warn!(
                    "Leaving service {} up: dependent {} could not be stopped",
                    id, dependent
                );
                continue;
            }
            if let Err(e) = self.stop_one(id).await {
                error!("Failed to stop service {}: {}", id, e);
                failed.push(id.clone());
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub(super) fn is_active(&self, service: &str) -> bool {
        self.slots
            .get(service)
            .is_some_and(|slot| slot.signal().state.is_active())
    }

    /// Start one service whose dependencies are already handled.
    ///
    /// Resolves once this attempt reaches Running, or fails.
    pub(super) async fn start_one(&self, service: &str) -> Result<()> {
        let slot = self.slot(service)?;

        let generation = {
            let _op = slot.op_lock.lock().await;
            let signal = slot.signal();
            match signal.state {
                ServiceState::Running | ServiceState::Unhealthy => {
                    debug!("Service {} already {}", service, signal.state);
                    return Ok(());
                }
                // Someone else is starting it; share their outcome
                ServiceState::Starting => signal.generation,
                ServiceState::Stopping => {
                    return Err(OrchestratorError::StartInterrupted {
                        service: service.to_string(),
                        state: signal.state,
                    });
                }
                ServiceState::Stopped | ServiceState::Error => self.launch(service, slot).await?,
            }
        };

        self.await_ready(service, slot, generation).await
    }

    /// Spawn a new process instance. Caller holds the operation lock.
    async fn launch(&self, service: &str, slot: &ServiceSlot) -> Result<u64> {
        let definition = &slot.definition;

        for dependency in self.graph.dependencies(service) {
            let state = self
                .slots
                .get(dependency)
                .map(|dep| dep.signal().state)
                .unwrap_or(ServiceState::Stopped);
            if state != ServiceState::Running {
                return Err(OrchestratorError::DependencyFailed {
                    service: service.to_string(),
                    dependency: dependency.clone(),
                    reason: format!("dependency is {}", state),
                });
            }
        }

        // An Error state may still own a live process
        let leftover = slot.update(|rt| {
            rt.abort_monitor();
            rt.process.clone()
        });
        if let Some(process) = leftover {
            debug!("Reaping leftover process {} of service {}", process.pid(), service);
            terminate(service, &process, definition.stop_grace_period)
                .await
                .map_err(OrchestratorError::from_termination)?;
            slot.update(|rt| rt.process = None);
        }

        let vars = self.models.read().active_vars();

        slot.health_failures.store(0, Ordering::Relaxed);
        let generation = slot.update(|rt| {
            rt.generation += 1;
            rt.transition(service, ServiceState::Starting);
            rt.last_error = None;
            rt.startup_expired = false;
            rt.exit_code = None;
            rt.started_at = None;
            rt.generation
        });

        let spawned = CommandSpec::render(definition, &vars).and_then(|spec| {
            spawn_service(
                service,
                generation,
                &spec,
                self.logs.clone(),
                self.exit_tx.clone(),
            )
        });
        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                error!("Failed to spawn service {}: {}", service, e);
                self.logs.append(service, &format!("[cockpit] spawn failed: {}", e));
                slot.update(|rt| rt.fail(service, e.to_string()));
                self.persist();
                return Err(OrchestratorError::SpawnFailed {
                    service: service.to_string(),
                    source: e,
                });
            }
        };

        self.logs.append(
            service,
            &format!(
                "[cockpit] spawned pid {} (generation {})",
                process.pid(),
                generation
            ),
        );

        let monitor = spawn_health_monitor(MonitorParams {
            service: service.to_string(),
            generation,
            endpoint: definition.health_endpoint(),
            config: definition.healthcheck.clone(),
            probe: self.probe.clone(),
            process: process.clone(),
            state_rx: slot.state_tx.subscribe(),
            events: self.health_tx.clone(),
            failures: slot.health_failures.clone(),
        });

        slot.update(|rt| {
            // The process may already have exited and been reported
            if rt.generation == generation && rt.state.is_active() {
                rt.started_at = Some(process.started_at());
                rt.process = Some(process);
                rt.monitor = Some(monitor);
            } else {
                monitor.abort();
            }
        });

        self.persist();
        Ok(generation)
    }

    /// Wait for `generation` to leave Starting.
    ///
    /// The health monitor enforces the startup timeout on its own; a waiter
    /// that outlives it expires the attempt itself.
    async fn await_ready(&self, service: &str, slot: &ServiceSlot, generation: u64) -> Result<()> {
        let timeout = slot.definition.healthcheck.startup_timeout;
        let mut state_rx = slot.state_tx.subscribe();

        let waited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| s.generation != generation || s.state != ServiceState::Starting),
        )
        .await
        .map(|res| res.map(|signal| *signal));

        let signal = match waited {
            Ok(Ok(signal)) => signal,
            Ok(Err(_)) => {
                return Err(OrchestratorError::StartInterrupted {
                    service: service.to_string(),
                    state: slot.signal().state,
                });
            }
            Err(_) => {
                self.expire_startup(service, generation).await;
                slot.signal()
            }
        };
        self.start_outcome(service, slot, generation, signal).await
    }

    async fn start_outcome(
        &self,
        service: &str,
        slot: &ServiceSlot,
        generation: u64,
        signal: StateSignal,
    ) -> Result<()> {
        if signal.generation != generation {
            return Err(OrchestratorError::StartInterrupted {
                service: service.to_string(),
                state: signal.state,
            });
        }
        match signal.state {
            ServiceState::Running | ServiceState::Unhealthy => {
                info!("Service {} is running", service);
                Ok(())
            }
            ServiceState::Error => {
                let (expired, reason) = {
                    let rt = slot.runtime.lock();
                    (
                        rt.startup_expired,
                        rt.last_error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    )
                };
                if expired {
                    // Expiry terminates under the operation lock; wait for it
                    drop(slot.op_lock.lock().await);
                    return Err(OrchestratorError::StartupTimeout {
                        service: service.to_string(),
                        timeout: slot.definition.healthcheck.startup_timeout,
                    });
                }
                Err(OrchestratorError::StartFailed {
                    service: service.to_string(),
                    reason,
                })
            }
            state => Err(OrchestratorError::StartInterrupted {
                service: service.to_string(),
                state,
            }),
        }
    }

    /// Fail `generation` for exceeding its startup timeout and terminate its
    /// process. No-op once that generation has left Starting.
    pub(super) async fn expire_startup(&self, service: &str, generation: u64) {
        let Some(slot) = self.slots.get(service) else {
            return;
        };
        let _op = slot.op_lock.lock().await;

        let signal = slot.signal();
        if signal.generation != generation || signal.state != ServiceState::Starting {
            return;
        }

        let timeout = slot.definition.healthcheck.startup_timeout;
        warn!(
            "Service {} did not become healthy within {}",
            service,
            format_duration(&timeout)
        );
        let process = slot.update(|rt| {
            rt.fail(
                service,
                format!("did not become healthy within {}", format_duration(&timeout)),
            );
            rt.startup_expired = true;
            rt.abort_monitor();
            rt.process.clone()
        });
        self.logs.append(
            service,
            &format!("[cockpit] startup timed out after {}", format_duration(&timeout)),
        );

        if let Some(process) = process {
            match terminate(service, &process, slot.definition.stop_grace_period).await {
                Ok(exit) => slot.update(|rt| {
                    rt.exit_code = exit.code;
                    rt.process = None;
                }),
                Err(e) => error!("Failed to terminate service {} after startup timeout: {}", service, e),
            }
        }
        self.persist();
    }

    /// Stop one service whose dependents are already handled.
    pub(super) async fn stop_one(&self, service: &str) -> Result<()> {
        let slot = self.slot(service)?;
        let _op = slot.op_lock.lock().await;

        if slot.signal().state == ServiceState::Stopped {
            debug!("Service {} already stopped", service);
            return Ok(());
        }

        let process = slot.update(|rt| {
            rt.abort_monitor();
            rt.transition(service, ServiceState::Stopping);
            rt.process.clone()
        });

        let result = match &process {
            Some(process) => terminate(service, process, slot.definition.stop_grace_period)
                .await
                .map(Some),
            None => Ok(None),
        };

        match result {
            Ok(exit) => {
                slot.update(|rt| {
                    rt.process = None;
                    if let Some(exit) = &exit {
                        rt.exit_code = exit.code;
                    }
                    rt.transition(service, ServiceState::Stopped);
                });
                if let Some(exit) = exit {
                    self.logs
                        .append(service, &format!("[cockpit] stopped ({})", exit.describe()));
                }
                info!("Service {} stopped", service);
                self.persist();
                Ok(())
            }
            Err(e) => {
                error!("Service {} could not be stopped: {}", service, e);
                slot.update(|rt| rt.fail(service, e.to_string()));
                self.persist();
                Err(OrchestratorError::from_termination(e))
            }
        }
    }
}
