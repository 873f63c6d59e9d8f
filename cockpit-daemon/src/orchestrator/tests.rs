use super::*;
use crate::config::{HealthCheck, LogConfig};
use crate::errors::DaemonError;
use crate::health::{HealthEventKind, ProbeOutcome};
use crate::process::{CommandSpec, ProcessExit, process_exists, spawn_service};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

/// Probe that always answers the same
struct StaticProbe(ProbeOutcome);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, _url: &str, _timeout: Duration) -> ProbeOutcome {
        self.0.clone()
    }
}

fn healthy() -> Arc<dyn HealthProbe> {
    Arc::new(StaticProbe(ProbeOutcome::Healthy))
}

/// Liveness-only service, ready 100ms after spawn
fn service(command: &[&str]) -> ServiceDefinition {
    let mut def = ServiceDefinition::new(command.iter().map(|s| s.to_string()).collect());
    def.healthcheck = HealthCheck {
        start_period: Some(Duration::from_millis(100)),
        startup_timeout: Duration::from_secs(5),
        ..HealthCheck::default()
    };
    def.stop_grace_period = Duration::from_secs(2);
    def
}

fn sleeper() -> ServiceDefinition {
    service(&["sleep", "30"])
}

fn depending(mut def: ServiceDefinition, deps: &[&str]) -> ServiceDefinition {
    def.depends_on = deps.iter().map(|s| s.to_string()).collect();
    def
}

fn config(dir: &TempDir, services: Vec<(&str, ServiceDefinition)>) -> CockpitConfig {
    CockpitConfig {
        logs: LogConfig {
            dir: dir.path().join("logs"),
            ..LogConfig::default()
        },
        state_file: dir.path().join("state.json"),
        models: ModelConfig::default(),
        services: services
            .into_iter()
            .map(|(id, mut def)| {
                def.id = id.to_string();
                def.working_dir = Some(dir.path().to_path_buf());
                (id.to_string(), def)
            })
            .collect(),
    }
}

fn orchestrator(config: CockpitConfig, probe: Arc<dyn HealthProbe>) -> ServiceOrchestrator {
    ServiceOrchestrator::build(config, probe, Duration::from_millis(50)).unwrap()
}

async fn wait_for_state(orch: &ServiceOrchestrator, service: &str, state: ServiceState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.state_of(service) != Some(state) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} to be {}, still {:?}",
            service,
            state,
            orch.state_of(service)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn persisted(dir: &TempDir) -> PersistedState {
    StatePersistence::new(dir.path().join("state.json"))
        .load()
        .unwrap()
        .expect("state file written")
}

#[tokio::test]
async fn test_unknown_service() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());

    assert!(matches!(orch.start("nope").await, Err(OrchestratorError::ServiceNotFound(ref s)) if s == "nope"));
    assert!(matches!(orch.stop("nope").await, Err(OrchestratorError::ServiceNotFound(_))));
    assert!(matches!(orch.restart("nope").await, Err(OrchestratorError::ServiceNotFound(_))));
    assert!(matches!(orch.service_status("nope"), Err(OrchestratorError::ServiceNotFound(_))));
    assert!(matches!(orch.logs("nope", 10, false), Err(OrchestratorError::ServiceNotFound(_))));
    assert_eq!(orch.state_of("nope"), None);
}

#[tokio::test]
async fn test_cyclic_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cfg = config(
        &dir,
        vec![
            ("a", depending(sleeper(), &["b"])),
            ("b", depending(sleeper(), &["a"])),
        ],
    );
    let err = ServiceOrchestrator::with_probe(cfg, healthy()).unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::DaemonError(DaemonError::CyclicDependency { .. })
    ));
}

#[tokio::test]
async fn test_status_reports_health_endpoint() {
    let dir = TempDir::new().unwrap();
    let mut server = sleeper();
    server.port = Some(8000);
    server.healthcheck.path = Some("/health".to_string());
    let orch = orchestrator(
        config(&dir, vec![("server", server), ("worker", sleeper())]),
        healthy(),
    );

    assert_eq!(
        orch.service_status("server").unwrap().health_endpoint.as_deref(),
        Some("http://127.0.0.1:8000/health")
    );
    assert_eq!(orch.service_status("worker").unwrap().health_endpoint, None);
}

#[tokio::test]
async fn test_start_and_stop() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());

    let initial = orch.service_status("a").unwrap();
    assert_eq!(initial.state, ServiceState::Stopped);
    assert_eq!(initial.generation, 0);
    assert_eq!(initial.pid, None);

    orch.start("a").await.unwrap();
    let running = orch.service_status("a").unwrap();
    assert_eq!(running.state, ServiceState::Running);
    assert_eq!(running.generation, 1);
    let pid = running.pid.expect("running service has a pid");
    assert!(running.started_at.is_some());
    assert_eq!(persisted(&dir).processes["a"].pid, pid);

    // Already running is a no-op
    orch.start("a").await.unwrap();
    assert_eq!(orch.service_status("a").unwrap().generation, 1);

    orch.stop("a").await.unwrap();
    let stopped = orch.service_status("a").unwrap();
    assert_eq!(stopped.state, ServiceState::Stopped);
    assert_eq!(stopped.pid, None);
    assert!(persisted(&dir).processes.is_empty());

    let logs = orch.logs("a", 10, false).unwrap();
    assert!(logs.iter().any(|l| l.line.contains("spawned pid")));

    // Already stopped is a no-op
    orch.stop("a").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());

    let (first, second) = tokio::join!(orch.start("a"), orch.start("a"));
    first.unwrap();
    second.unwrap();

    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.generation, 1);

    orch.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_start_brings_up_dependencies_and_stop_takes_down_dependents() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        config(
            &dir,
            vec![
                ("a", sleeper()),
                ("b", depending(sleeper(), &["a"])),
                ("c", depending(sleeper(), &["b"])),
                ("other", sleeper()),
            ],
        ),
        healthy(),
    );

    orch.start("c").await.unwrap();
    let status = orch.status();
    let started = |id: &str| status.iter().find(|s| s.id == id).unwrap().started_at.unwrap();
    assert!(started("a") <= started("b"));
    assert!(started("b") <= started("c"));
    assert_eq!(orch.state_of("other"), Some(ServiceState::Stopped));

    orch.stop("a").await.unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(orch.state_of(id), Some(ServiceState::Stopped));
    }
}

#[tokio::test]
async fn test_stale_events_are_discarded() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());
    orch.start("a").await.unwrap();

    let health = |generation, kind| HealthEvent {
        service: "a".to_string(),
        generation,
        kind,
    };

    orch.inner
        .apply_health_event(health(0, HealthEventKind::Unhealthy { failures: 3 }));
    assert_eq!(orch.state_of("a"), Some(ServiceState::Running));

    orch.inner
        .apply_health_event(health(1, HealthEventKind::Unhealthy { failures: 3 }));
    assert_eq!(orch.state_of("a"), Some(ServiceState::Unhealthy));

    orch.inner.apply_health_event(health(1, HealthEventKind::Recovered));
    assert_eq!(orch.state_of("a"), Some(ServiceState::Running));

    orch.inner.apply_exit_event(ProcessExitEvent {
        service: "a".to_string(),
        generation: 0,
        pid: 1,
        exit: ProcessExit {
            code: Some(1),
            signal: None,
            at: Utc::now(),
        },
    });
    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert!(status.pid.is_some());

    orch.stop("a").await.unwrap();
}

#[tokio::test]
async fn test_health_failure_escalates_to_error() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());
    orch.start("a").await.unwrap();

    orch.inner.apply_health_event(HealthEvent {
        service: "a".to_string(),
        generation: 1,
        kind: HealthEventKind::Unhealthy { failures: 3 },
    });
    orch.inner.apply_health_event(HealthEvent {
        service: "a".to_string(),
        generation: 1,
        kind: HealthEventKind::Failed {
            failures: 6,
            reason: "HTTP 503".to_string(),
        },
    });

    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Error);
    assert!(status.last_error.unwrap().contains("HTTP 503"));

    // Stop from Error still terminates the process
    let pid = status.pid.unwrap();
    orch.stop("a").await.unwrap();
    assert_eq!(orch.state_of("a"), Some(ServiceState::Stopped));
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_unexpected_exit_moves_to_error() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        config(&dir, vec![("a", service(&["sh", "-c", "sleep 0.5; exit 4"]))]),
        healthy(),
    );

    orch.start("a").await.unwrap();
    wait_for_state(&orch, "a", ServiceState::Error).await;

    let status = orch.service_status("a").unwrap();
    assert_eq!(status.exit_code, Some(4));
    assert_eq!(status.pid, None);
    assert!(status.last_error.unwrap().contains("exited unexpectedly"));

    orch.stop("a").await.unwrap();
    assert_eq!(orch.state_of("a"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_startup_timeout() {
    let dir = TempDir::new().unwrap();
    let mut def = sleeper();
    def.healthcheck = HealthCheck {
        url: Some("http://127.0.0.1:1/health".to_string()),
        interval: Duration::from_millis(50),
        start_period: Some(Duration::ZERO),
        startup_timeout: Duration::from_millis(300),
        ..HealthCheck::default()
    };
    let orch = orchestrator(
        config(&dir, vec![("a", def)]),
        Arc::new(StaticProbe(ProbeOutcome::Unhealthy("not ready".to_string()))),
    );

    let err = orch.start("a").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StartupTimeout { ref service, .. } if service == "a"));

    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Error);
    assert_eq!(status.pid, None);
    assert!(status.health_failures > 0);
}

#[tokio::test]
async fn test_startup_timeout_without_waiter() {
    let dir = TempDir::new().unwrap();
    let mut def = sleeper();
    def.healthcheck = HealthCheck {
        url: Some("http://127.0.0.1:1/health".to_string()),
        interval: Duration::from_millis(50),
        start_period: Some(Duration::ZERO),
        startup_timeout: Duration::from_millis(300),
        ..HealthCheck::default()
    };
    let orch = orchestrator(
        config(&dir, vec![("a", def)]),
        Arc::new(StaticProbe(ProbeOutcome::Unhealthy("not ready".to_string()))),
    );

    // The caller gives up long before the startup timeout
    let abandoned = tokio::time::timeout(Duration::from_millis(100), orch.start("a")).await;
    assert!(abandoned.is_err());
    assert_eq!(orch.state_of("a"), Some(ServiceState::Starting));
    let pid = orch.service_status("a").unwrap().pid.unwrap();

    wait_for_state(&orch, "a", ServiceState::Error).await;
    let status = orch.service_status("a").unwrap();
    assert!(status.last_error.unwrap().contains("did not become healthy"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while process_exists(pid) || orch.service_status("a").unwrap().pid.is_some() {
        assert!(tokio::time::Instant::now() < deadline, "process {} still alive", pid);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A fresh attempt times out again under its own generation
    let err = orch.start("a").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StartupTimeout { .. }));
    assert_eq!(orch.service_status("a").unwrap().generation, 2);

    orch.stop("a").await.unwrap();
    assert_eq!(orch.state_of("a"), Some(ServiceState::Stopped));
}

#[tokio::test]
async fn test_spawn_failure() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        config(
            &dir,
            vec![
                ("a", service(&["/nonexistent/cockpit-test-binary"])),
                ("b", depending(sleeper(), &["a"])),
            ],
        ),
        healthy(),
    );

    let err = orch.start("a").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SpawnFailed { .. }));
    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Error);
    assert!(status.last_error.is_some());

    // The dependent is never spawned
    let err = orch.start("b").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::DependencyFailed { ref service, ref dependency, .. }
            if service == "b" && dependency == "a"
    ));
    let b = orch.service_status("b").unwrap();
    assert_eq!(b.state, ServiceState::Stopped);
    assert_eq!(b.generation, 0);
}

#[tokio::test]
async fn test_start_all_skips_dependents_of_failed_service() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        config(
            &dir,
            vec![
                ("a", service(&["/nonexistent/cockpit-test-binary"])),
                ("b", depending(sleeper(), &["a"])),
                ("c", depending(sleeper(), &["b"])),
                ("independent", sleeper()),
            ],
        ),
        healthy(),
    );

    let err = orch.start_all().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SpawnFailed { ref service, .. } if service == "a"));

    assert_eq!(orch.state_of("a"), Some(ServiceState::Error));
    assert_eq!(orch.state_of("b"), Some(ServiceState::Stopped));
    assert_eq!(orch.state_of("c"), Some(ServiceState::Stopped));
    assert_eq!(orch.state_of("independent"), Some(ServiceState::Running));

    orch.stop_all().await.unwrap();
    for snapshot in orch.status() {
        assert_eq!(snapshot.state, ServiceState::Stopped, "{}", snapshot.id);
    }
}

#[tokio::test]
async fn test_restart_brings_back_active_dependents() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(
        config(
            &dir,
            vec![
                ("a", sleeper()),
                ("b", depending(sleeper(), &["a"])),
                ("c", depending(sleeper(), &["a"])),
            ],
        ),
        healthy(),
    );

    orch.start("b").await.unwrap();
    orch.restart("a").await.unwrap();

    let status = orch.service_status("a").unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.generation, 2);
    let b = orch.service_status("b").unwrap();
    assert_eq!(b.state, ServiceState::Running);
    assert_eq!(b.generation, 2);
    // Was not running before the restart
    assert_eq!(orch.state_of("c"), Some(ServiceState::Stopped));

    orch.stop_all().await.unwrap();
}

fn model_config(dir: &TempDir) -> CockpitConfig {
    let mut llm = service(&["sh", "-c", "sleep 30", "{{ model }}"]);
    llm.name = Some("LLM ({{ model_short }})".to_string());

    let mut cfg = config(
        dir,
        vec![
            ("llm", llm),
            ("api", depending(sleeper(), &["llm"])),
            ("other", sleeper()),
        ],
    );
    cfg.models = ModelConfig {
        active: Some("org/small".to_string()),
        variants: vec![ModelVariant::new("org/small"), ModelVariant::new("org/large")],
    };
    cfg
}

#[tokio::test]
async fn test_switch_model_validation() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(model_config(&dir), healthy());

    assert!(matches!(
        orch.switch_model("org/missing").await,
        Err(OrchestratorError::UnknownModel(ref m)) if m == "org/missing"
    ));
    assert_eq!(
        orch.switch_model("org/small").await.unwrap(),
        SwitchOutcome::Unchanged {
            model: "org/small".to_string()
        }
    );
    assert_eq!(orch.available_models().len(), 2);
}

#[tokio::test]
async fn test_switch_model_with_nothing_running() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(model_config(&dir), healthy());

    let outcome = orch.switch_model("org/large").await.unwrap();
    assert_eq!(
        outcome,
        SwitchOutcome::Switched {
            previous: Some("org/small".to_string()),
            current: "org/large".to_string(),
            restarted: vec![],
        }
    );
    assert_eq!(orch.current_model().as_deref(), Some("org/large"));
    assert_eq!(persisted(&dir).active_model.as_deref(), Some("org/large"));
    for snapshot in orch.status() {
        assert_eq!(snapshot.state, ServiceState::Stopped);
    }
}

#[tokio::test]
async fn test_switch_model_restarts_affected_services() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(model_config(&dir), healthy());
    orch.start_all().await.unwrap();
    assert_eq!(orch.service_status("llm").unwrap().name, "LLM (small)");

    let outcome = orch.switch_model("org/large").await.unwrap();
    assert_eq!(
        outcome,
        SwitchOutcome::Switched {
            previous: Some("org/small".to_string()),
            current: "org/large".to_string(),
            restarted: vec!["llm".to_string(), "api".to_string()],
        }
    );

    let llm = orch.service_status("llm").unwrap();
    assert_eq!(llm.state, ServiceState::Running);
    assert_eq!(llm.generation, 2);
    assert!(llm.model_bound);
    assert_eq!(llm.name, "LLM (large)");
    assert_eq!(orch.service_status("api").unwrap().generation, 2);
    // Not model-bound and not a dependent: untouched
    assert_eq!(orch.service_status("other").unwrap().generation, 1);

    orch.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_recover_restores_model_and_kills_orphans() {
    let dir = TempDir::new().unwrap();
    let logs = Arc::new(LogStore::new(&LogConfig {
        dir: dir.path().join("logs"),
        ..LogConfig::default()
    }));
    let spec = CommandSpec {
        program_and_args: vec!["sleep".to_string(), "30".to_string()],
        working_dir: dir.path().to_path_buf(),
        environment: std::env::vars().collect(),
        port: None,
    };
    let (exit_tx, _exit_rx) = mpsc::channel(4);
    let orphan = spawn_service("llm", 7, &spec, logs, exit_tx).unwrap();

    let mut processes = BTreeMap::new();
    processes.insert(
        "llm".to_string(),
        PersistedProcess {
            pid: orphan.pid(),
            start_time: orphan.os_start_time(),
            generation: 7,
            started_at: orphan.started_at(),
        },
    );
    StatePersistence::new(dir.path().join("state.json"))
        .save(&PersistedState {
            active_model: Some("org/large".to_string()),
            processes,
        })
        .unwrap();

    let orch = orchestrator(model_config(&dir), healthy());
    orch.recover().await.unwrap();

    assert_eq!(orch.current_model().as_deref(), Some("org/large"));
    assert!(orphan.wait_exit(Duration::from_secs(5)).await.is_some());
    assert_eq!(orch.state_of("llm"), Some(ServiceState::Stopped));
    assert!(persisted(&dir).processes.is_empty());
}

#[tokio::test]
async fn test_recover_ignores_unknown_persisted_model() {
    let dir = TempDir::new().unwrap();
    StatePersistence::new(dir.path().join("state.json"))
        .save(&PersistedState {
            active_model: Some("org/removed".to_string()),
            processes: BTreeMap::new(),
        })
        .unwrap();

    let orch = orchestrator(model_config(&dir), healthy());
    orch.recover().await.unwrap();
    assert_eq!(orch.current_model().as_deref(), Some("org/small"));
}

#[test]
fn test_termination_failures_map_to_operation_errors() {
    let err = OrchestratorError::from_termination(DaemonError::TerminationTimeout {
        service: "vllm".to_string(),
        pid: 4242,
    });
    assert!(matches!(err, OrchestratorError::TerminationTimeout { ref service, pid: 4242 } if service == "vllm"));
    assert_eq!(err.to_string(), "Service vllm (PID 4242) could not be confirmed stopped");

    let err = OrchestratorError::from_termination(DaemonError::Internal("watcher gone".to_string()));
    assert!(matches!(err, OrchestratorError::DaemonError(DaemonError::Internal(_))));

    let wrapped = OrchestratorError::ModelSwitchFailed {
        model: "org/large".to_string(),
        source: Box::new(OrchestratorError::TerminationTimeout {
            service: "vllm".to_string(),
            pid: 4242,
        }),
    };
    assert_eq!(
        wrapped.to_string(),
        "Switch to model org/large failed: Service vllm (PID 4242) could not be confirmed stopped"
    );
}

#[tokio::test]
async fn test_gpu_info_without_gpu_is_all_none() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(config(&dir, vec![("a", sleeper())]), healthy());

    let info = orch.gpu_info().await;
    if info.name.is_none() {
        assert_eq!(info, GpuInfo::default());
    }
}
