//! Health monitor
//!
//! One task per live process instance probes the service's health endpoint
//! and reports threshold-crossing observations as `HealthEvent`s. Raw probe
//! results never leave this module.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HealthCheck;
use crate::process::ProcessHandle;
use crate::state::{ServiceState, StateSignal};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// A single bounded-time readiness check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// HTTP GET probe: any 2xx response is healthy
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        // Probes target local services, never a system proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let request = self.client.get(url).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::Unhealthy(format!("HTTP {}", response.status())),
            Ok(Err(e)) => ProbeOutcome::Unhealthy(e.to_string()),
            Err(_) => ProbeOutcome::Unhealthy(format!("timed out after {:?}", timeout)),
        }
    }
}

/// Threshold-crossing observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEventKind {
    /// First success after spawn
    Ready,
    /// Consecutive failures reached the unhealthy threshold while Running
    Unhealthy { failures: u32 },
    /// Success while Unhealthy
    Recovered,
    /// Further failures reached the error threshold while Unhealthy
    Failed { failures: u32, reason: String },
    /// Still Starting when the startup timeout elapsed
    StartupExpired { timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub service: String,
    pub generation: u64,
    pub kind: HealthEventKind,
}

/// Consecutive success/failure bookkeeping for one process instance.
///
/// Pure state: feed it the service's current state and each probe outcome,
/// and it says which transition (if any) the observation warrants.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    unhealthy_threshold: u32,
    error_threshold: u32,
    failures: u32,
    successes: u32,
}

impl HealthTracker {
    pub fn new(config: &HealthCheck) -> Self {
        Self {
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            error_threshold: config.error_threshold.max(1),
            failures: 0,
            successes: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    pub fn observe(&mut self, state: ServiceState, outcome: &ProbeOutcome) -> Option<HealthEventKind> {
        match outcome {
            ProbeOutcome::Healthy => {
                self.failures = 0;
                self.successes = self.successes.saturating_add(1);
                match state {
                    ServiceState::Starting => Some(HealthEventKind::Ready),
                    ServiceState::Unhealthy => Some(HealthEventKind::Recovered),
                    _ => None,
                }
            }
            ProbeOutcome::Unhealthy(reason) => {
                self.successes = 0;
                self.failures = self.failures.saturating_add(1);
                match state {
                    ServiceState::Running if self.failures >= self.unhealthy_threshold => {
                        Some(HealthEventKind::Unhealthy {
                            failures: self.failures,
                        })
                    }
                    ServiceState::Unhealthy
                        if self.failures >= self.unhealthy_threshold + self.error_threshold =>
                    {
                        Some(HealthEventKind::Failed {
                            failures: self.failures,
                            reason: reason.clone(),
                        })
                    }
                    // Starting failures only count; the startup timeout decides
                    _ => None,
                }
            }
        }
    }
}

/// Everything a monitor task needs
pub struct MonitorParams {
    pub service: String,
    pub generation: u64,
    /// Probe URL; `None` means liveness-only readiness
    pub endpoint: Option<String>,
    pub config: HealthCheck,
    pub probe: Arc<dyn HealthProbe>,
    pub process: ProcessHandle,
    pub state_rx: watch::Receiver<StateSignal>,
    pub events: mpsc::Sender<HealthEvent>,
    /// Shared with the status snapshot
    pub failures: Arc<AtomicU32>,
}

/// Spawn a health monitor task for one process instance
pub fn spawn_health_monitor(params: MonitorParams) -> JoinHandle<()> {
    tokio::spawn(monitor_loop(params))
}

/// Resolves once the state no longer belongs to an active `generation`
async fn left_generation(state_rx: &mut watch::Receiver<StateSignal>, generation: u64) {
    let _ = state_rx.wait_for(|s| !s.is_current(generation)).await;
}

/// Resolves once `generation` is no longer Starting
async fn left_starting(state_rx: &mut watch::Receiver<StateSignal>, generation: u64) {
    let _ = state_rx
        .wait_for(|s| s.generation != generation || s.state != ServiceState::Starting)
        .await;
}

/// Sleep for `duration` unless the service leaves this generation first.
async fn sleep_while_current(
    state_rx: &mut watch::Receiver<StateSignal>,
    generation: u64,
    duration: Duration,
) -> bool {
    tokio::select! {
        _ = sleep(duration) => state_rx.borrow().is_current(generation),
        _ = left_generation(state_rx, generation) => false,
    }
}

/// Sends this instance's events to the orchestrator
struct Reporter {
    service: String,
    generation: u64,
    events: mpsc::Sender<HealthEvent>,
}

impl Reporter {
    async fn send(&self, kind: HealthEventKind) {
        let event = HealthEvent {
            service: self.service.clone(),
            generation: self.generation,
            kind,
        };
        if self.events.send(event).await.is_err() {
            debug!("Health event channel closed");
        }
    }
}

async fn monitor_loop(params: MonitorParams) {
    let MonitorParams {
        service,
        generation,
        endpoint,
        config,
        probe,
        process,
        state_rx,
        events,
        failures,
    } = params;

    let reporter = Reporter {
        service,
        generation,
        events,
    };

    // The deadline never resolves; the monitor ends with the probe loop
    let deadline_rx = state_rx.clone();
    tokio::select! {
        _ = startup_deadline(&reporter, deadline_rx, config.startup_timeout) => {}
        _ = probe_loop(&reporter, endpoint, &config, probe, &process, state_rx, &failures) => {}
    }

    debug!(
        "Health check for {} stopped (generation {})",
        reporter.service, generation
    );
}

/// Report `StartupExpired` if the instance is still Starting after `timeout`,
/// whether or not anyone is waiting on the start.
async fn startup_deadline(
    reporter: &Reporter,
    mut state_rx: watch::Receiver<StateSignal>,
    timeout: Duration,
) {
    let generation = reporter.generation;
    let expired = tokio::select! {
        _ = sleep(timeout) => {
            let signal = *state_rx.borrow();
            signal.generation == generation && signal.state == ServiceState::Starting
        }
        _ = left_starting(&mut state_rx, generation) => false,
    };

    if expired {
        warn!(
            "Service {} still starting after {:?}",
            reporter.service, timeout
        );
        reporter.send(HealthEventKind::StartupExpired { timeout }).await;
    }
    std::future::pending::<()>().await
}

async fn probe_loop(
    reporter: &Reporter,
    endpoint: Option<String>,
    config: &HealthCheck,
    probe: Arc<dyn HealthProbe>,
    process: &ProcessHandle,
    mut state_rx: watch::Receiver<StateSignal>,
    failures: &AtomicU32,
) {
    let service = &reporter.service;
    let generation = reporter.generation;

    let start_period = config.effective_start_period(endpoint.is_some());
    if !start_period.is_zero() {
        debug!(
            "Health check for {} waiting for start period: {:?}",
            service, start_period
        );
    }
    if !sleep_while_current(&mut state_rx, generation, start_period).await {
        debug!("Health check for {} stopping - service left generation {}", service, generation);
        return;
    }

    let Some(url) = endpoint else {
        // Liveness-only: surviving the start period is readiness
        if !process.has_exited() && state_rx.borrow().state == ServiceState::Starting {
            info!("Service {} alive after {:?}, treating as ready", service, start_period);
            reporter.send(HealthEventKind::Ready).await;
        }
        return;
    };

    let mut tracker = HealthTracker::new(config);

    loop {
        let outcome = tokio::select! {
            outcome = probe.probe(&url, config.timeout) => outcome,
            _ = left_generation(&mut state_rx, generation) => break,
        };

        let signal = *state_rx.borrow();
        if !signal.is_current(generation) {
            break;
        }

        let event = tracker.observe(signal.state, &outcome);
        failures.store(tracker.failures(), Ordering::Relaxed);

        match &outcome {
            ProbeOutcome::Healthy => debug!("Health check passed for {}", service),
            ProbeOutcome::Unhealthy(reason) => warn!(
                "Health check failed for {} ({} consecutive): {}",
                service,
                tracker.failures(),
                reason
            ),
        }

        if let Some(kind) = event {
            let terminal = matches!(kind, HealthEventKind::Failed { .. });
            reporter.send(kind).await;
            if terminal {
                break;
            }
        }

        if !sleep_while_current(&mut state_rx, generation, config.interval).await {
            break;
        }
    }
}
