//! Service orchestration
//!
//! `ServiceOrchestrator` owns one runtime record per service and is the only
//! place that mutates them. Operations on one service are serialized by a
//! per-service operation lock; operations on unrelated services run
//! concurrently. Health monitors and exit watchers never touch the records
//! directly: they send generation-tagged events to the event loop, which
//! discards anything belonging to a superseded process instance.

mod error;
mod events;
mod lifecycle;
mod model;

pub use error::OrchestratorError;
pub use model::SwitchOutcome;

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::{CockpitConfig, ModelConfig, ModelVariant, ServiceDefinition};
use crate::deps::DependencyGraph;
use crate::gpu::{GpuInfo, query_gpu_info};
use crate::health::{HealthEvent, HealthProbe, HttpProbe};
use crate::logs::{LogLine, LogStore};
use crate::persistence::{PersistedProcess, PersistedState, StatePersistence};
use crate::process::{ProcessExitEvent, kill_process_by_pid, validate_running_process};
use crate::state::{ServiceRuntime, ServiceSnapshot, ServiceState, StateSignal};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Pause between the stop and start halves of a restart, so ports are released
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Grace period for orphans whose service no longer exists in the config
const ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Per-service record: definition, operation lock and runtime state
pub(crate) struct ServiceSlot {
    definition: ServiceDefinition,
    /// Serializes start/stop operations on this service
    op_lock: tokio::sync::Mutex<()>,
    runtime: Mutex<ServiceRuntime>,
    /// Published after every runtime mutation
    state_tx: watch::Sender<StateSignal>,
    health_failures: Arc<AtomicU32>,
}

impl ServiceSlot {
    fn new(definition: ServiceDefinition) -> Self {
        let runtime = ServiceRuntime::default();
        let (state_tx, _) = watch::channel(StateSignal {
            state: runtime.state,
            generation: runtime.generation,
        });
        Self {
            definition,
            op_lock: tokio::sync::Mutex::new(()),
            runtime: Mutex::new(runtime),
            state_tx,
            health_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    fn signal(&self) -> StateSignal {
        *self.state_tx.borrow()
    }

    /// Mutate the runtime record and publish the resulting state.
    fn update<R>(&self, f: impl FnOnce(&mut ServiceRuntime) -> R) -> R {
        let mut runtime = self.runtime.lock();
        let result = f(&mut runtime);
        let signal = StateSignal {
            state: runtime.state,
            generation: runtime.generation,
        };
        self.state_tx.send_if_modified(|current| {
            if *current == signal {
                false
            } else {
                *current = signal;
                true
            }
        });
        result
    }
}

pub(crate) struct Inner {
    graph: DependencyGraph,
    slots: BTreeMap<String, ServiceSlot>,
    models: RwLock<ModelConfig>,
    /// At most one model switch in flight
    switch_lock: tokio::sync::Mutex<()>,
    probe: Arc<dyn HealthProbe>,
    logs: Arc<LogStore>,
    persistence: StatePersistence,
    health_tx: mpsc::Sender<HealthEvent>,
    exit_tx: mpsc::Sender<ProcessExitEvent>,
    restart_delay: Duration,
}

/// Coordinator for the supervised services
#[derive(Clone)]
pub struct ServiceOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServiceOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceOrchestrator")
            .field("services", &self.inner.graph.start_order())
            .field("model", &self.current_model())
            .finish()
    }
}

impl ServiceOrchestrator {
    /// Build an orchestrator probing health over HTTP.
    ///
    /// Must be called inside a tokio runtime: the event loop is spawned here.
    pub fn new(config: CockpitConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    pub fn with_probe(config: CockpitConfig, probe: Arc<dyn HealthProbe>) -> Result<Self> {
        Self::build(config, probe, RESTART_DELAY)
    }

    pub fn build(config: CockpitConfig, probe: Arc<dyn HealthProbe>, restart_delay: Duration) -> Result<Self> {
        let graph = DependencyGraph::build(&config.services)?;

        let slots = config
            .services
            .into_iter()
            .map(|(id, mut definition)| {
                definition.id = id.clone();
                (id, ServiceSlot::new(definition))
            })
            .collect();

        let (health_tx, health_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            graph,
            slots,
            models: RwLock::new(config.models),
            switch_lock: tokio::sync::Mutex::new(()),
            probe,
            logs: Arc::new(LogStore::new(&config.logs)),
            persistence: StatePersistence::new(config.state_file),
            health_tx,
            exit_tx,
            restart_delay,
        });

        tokio::spawn(events::run_event_loop(
            Arc::downgrade(&inner),
            health_rx,
            exit_rx,
        ));

        Ok(Self { inner })
    }

    /// Restore the persisted model selection and terminate processes left
    /// running by a previous daemon, so every service starts from Stopped.
    pub async fn recover(&self) -> Result<()> {
        let Some(state) = self.inner.persistence.load()? else {
            return Ok(());
        };

        if let Some(model) = state.active_model {
            let mut models = self.inner.models.write();
            if models.set_active(&model) {
                info!("Restored model selection: {}", model);
            } else {
                warn!(
                    "Persisted model {} is no longer configured, keeping {:?}",
                    model,
                    models.active_id()
                );
            }
        }

        for (service, process) in state.processes {
            if !validate_running_process(process.pid, process.start_time) {
                continue;
            }
            warn!(
                "Terminating orphaned process {} of service {} from a previous run",
                process.pid, service
            );
            let grace = self
                .inner
                .slots
                .get(&service)
                .map(|slot| slot.definition.stop_grace_period)
                .unwrap_or(ORPHAN_GRACE_PERIOD);
            if !kill_process_by_pid(process.pid, grace).await {
                warn!("Orphaned process {} of service {} survived", process.pid, service);
            }
        }

        self.inner.persist();
        Ok(())
    }

    /// Start a service after its dependencies; resolves on Running or failure.
    pub async fn start(&self, service: &str) -> Result<()> {
        self.inner.start_service(service).await
    }

    /// Stop a service after everything that depends on it.
    pub async fn stop(&self, service: &str) -> Result<()> {
        self.inner.stop_service(service).await
    }

    /// Stop then start a service, bringing back the dependents that were active.
    pub async fn restart(&self, service: &str) -> Result<()> {
        self.inner.restart_service(service).await
    }

    pub async fn start_all(&self) -> Result<()> {
        self.inner.start_all().await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.inner.stop_all().await
    }

    pub async fn switch_model(&self, model: &str) -> Result<SwitchOutcome> {
        self.inner.switch_model(model).await
    }

    /// Snapshot of every service in start order. Never waits on an operation.
    pub fn status(&self) -> Vec<ServiceSnapshot> {
        let vars = self.inner.models.read().active_vars();
        self.inner
            .graph
            .start_order()
            .iter()
            .filter_map(|id| self.inner.slots.get(id).map(|slot| snapshot(slot, &vars)))
            .collect()
    }

    pub fn service_status(&self, service: &str) -> Result<ServiceSnapshot> {
        let slot = self.inner.slot(service)?;
        let vars = self.inner.models.read().active_vars();
        Ok(snapshot(slot, &vars))
    }

    pub fn state_of(&self, service: &str) -> Option<ServiceState> {
        self.inner.slots.get(service).map(|slot| slot.signal().state)
    }

    pub fn current_model(&self) -> Option<String> {
        self.inner.models.read().active_id().map(String::from)
    }

    pub fn available_models(&self) -> Vec<ModelVariant> {
        self.inner.models.read().variants.clone()
    }

    /// Last `lines` log entries of a service, oldest first
    pub fn logs(&self, service: &str, lines: usize, filtered: bool) -> Result<Vec<LogLine>> {
        self.inner.slot(service)?;
        Ok(self.inner.logs.tail(service, lines, filtered))
    }

    /// Current GPU name, memory and utilization; all `None` without a GPU
    pub async fn gpu_info(&self) -> GpuInfo {
        query_gpu_info().await
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }
}

fn snapshot(slot: &ServiceSlot, vars: &std::collections::HashMap<String, String>) -> ServiceSnapshot {
    let definition = &slot.definition;
    let runtime = slot.runtime.lock();
    ServiceSnapshot {
        id: definition.id.clone(),
        name: definition.display_name(vars),
        state: runtime.state,
        pid: runtime.pid(),
        port: definition.port,
        health_endpoint: definition.health_endpoint(),
        depends_on: definition.depends_on.clone(),
        model_bound: definition.uses_model(),
        generation: runtime.generation,
        started_at: runtime.started_at,
        health_failures: slot.health_failures.load(Ordering::Relaxed),
        last_error: runtime.last_error.clone(),
        exit_code: runtime.exit_code,
    }
}

impl Inner {
    fn slot(&self, service: &str) -> Result<&ServiceSlot> {
        self.slots
            .get(service)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service.to_string()))
    }

    /// Rewrite the state file from the current runtime records.
    fn persist(&self) {
        let processes = self
            .slots
            .iter()
            .filter_map(|(id, slot)| {
                let runtime = slot.runtime.lock();
                let process = runtime.process.as_ref().filter(|p| !p.has_exited())?;
                Some((
                    id.clone(),
                    PersistedProcess {
                        pid: process.pid(),
                        start_time: process.os_start_time(),
                        generation: process.generation(),
                        started_at: process.started_at(),
                    },
                ))
            })
            .collect();

        let state = PersistedState {
            active_model: self.models.read().active_id().map(String::from),
            processes,
        };

        if let Err(e) = self.persistence.save(&state) {
            warn!("Failed to save daemon state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests;
