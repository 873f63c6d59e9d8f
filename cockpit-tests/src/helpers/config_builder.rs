//! Programmatic config creation with builder pattern

use cockpit_daemon::config::{CockpitConfig, HealthCheck, LogConfig, ModelConfig, ModelVariant, ServiceDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builder for creating test configurations
pub struct TestConfigBuilder {
    models: ModelConfig,
    services: BTreeMap<String, ServiceDefinition>,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            models: ModelConfig::default(),
            services: BTreeMap::new(),
        }
    }

    pub fn add_service(mut self, name: &str, service: ServiceDefinition) -> Self {
        self.services.insert(name.to_string(), service);
        self
    }

    /// Add a model variant; the first one added is the default selection
    pub fn add_model(mut self, id: &str) -> Self {
        self.models.variants.push(ModelVariant::new(id));
        self
    }

    pub fn with_active_model(mut self, id: &str) -> Self {
        self.models.active = Some(id.to_string());
        self
    }

    /// Build a finalized config rooted at `dir` (logs, state file and working dirs inside it)
    pub fn build(self, dir: &Path) -> CockpitConfig {
        let mut config = self.raw();
        config
            .finalize(dir)
            .unwrap_or_else(|e| panic!("invalid test config: {}", e));
        config
    }

    /// Write the config to `services.yaml` in `dir` and return the path
    pub fn write_to_file(self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join("services.yaml");
        let contents = serde_yaml::to_string(&self.raw()).map_err(std::io::Error::other)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn raw(self) -> CockpitConfig {
        CockpitConfig {
            logs: LogConfig::default(),
            state_file: PathBuf::from("state.json"),
            models: self.models,
            services: self.services,
        }
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test service definitions
pub struct TestServiceBuilder {
    definition: ServiceDefinition,
}

impl TestServiceBuilder {
    pub fn new(command: Vec<String>) -> Self {
        let mut definition = ServiceDefinition::new(command);
        definition.healthcheck = TestHealthCheckBuilder::liveness().build();
        definition.stop_grace_period = Duration::from_secs(2);
        Self { definition }
    }

    /// Create a long-running service using 'sleep'
    pub fn long_running() -> Self {
        Self::new(vec!["sleep".to_string(), "3600".to_string()])
    }

    /// Long-running service whose command line carries the active model
    pub fn model_bound() -> Self {
        Self::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "sleep 3600".to_string(),
            "{{ model }}".to_string(),
        ])
    }

    /// Create a service that runs for `seconds` then exits with `code`
    pub fn exits_after(seconds: f64, code: i32) -> Self {
        Self::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("sleep {}; exit {}", seconds, code),
        ])
    }

    /// Long-running shell service that appends its id to `file` when terminated
    pub fn records_stop(id: &str, file: &Path) -> Self {
        Self::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "trap 'echo {} >> {}; exit 0' TERM; while true; do sleep 0.1; done",
                id,
                file.display()
            ),
        ])
    }

    /// Model-bound shell service: prints `serving <model>` on start and
    /// appends its id to `file` when terminated
    pub fn serves_model(id: &str, file: &Path) -> Self {
        Self::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "trap 'echo {} >> {}; exit 0' TERM; echo \"serving $1\"; while true; do sleep 0.1; done",
                id,
                file.display()
            ),
            "sh".to_string(),
            "{{ model }}".to_string(),
        ])
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.definition.name = Some(name.to_string());
        self
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.definition.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthCheck) -> Self {
        self.definition.healthcheck = healthcheck;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.definition.port = Some(port);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.definition
            .environment
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.definition.stop_grace_period = grace;
        self
    }

    pub fn build(self) -> ServiceDefinition {
        self.definition
    }
}

/// Builder for creating health check configurations
pub struct TestHealthCheckBuilder {
    check: HealthCheck,
}

impl TestHealthCheckBuilder {
    /// No endpoint: ready once the process survived a short start period
    pub fn liveness() -> Self {
        Self {
            check: HealthCheck {
                start_period: Some(Duration::from_millis(100)),
                startup_timeout: Duration::from_secs(10),
                ..HealthCheck::default()
            },
        }
    }

    /// Probe `url` quickly, with low thresholds
    pub fn http(url: &str) -> Self {
        Self {
            check: HealthCheck {
                url: Some(url.to_string()),
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(500),
                start_period: Some(Duration::ZERO),
                startup_timeout: Duration::from_secs(10),
                unhealthy_threshold: 2,
                error_threshold: 2,
                ..HealthCheck::default()
            },
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check.interval = interval;
        self
    }

    pub fn with_thresholds(mut self, unhealthy: u32, error: u32) -> Self {
        self.check.unhealthy_threshold = unhealthy;
        self.check.error_threshold = error;
        self
    }

    pub fn with_start_period(mut self, period: Duration) -> Self {
        self.check.start_period = Some(period);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.check.startup_timeout = timeout;
        self
    }

    pub fn build(self) -> HealthCheck {
        self.check
    }
}
