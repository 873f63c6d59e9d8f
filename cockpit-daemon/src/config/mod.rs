//! Configuration module for the cockpit daemon
//!
//! This module provides:
//! - `CockpitConfig` - Root configuration structure
//! - `ServiceDefinition` - Immutable per-service definition
//! - `ModelConfig` - Available model variants and the active selection
//! - Helper types for health checks, logs and durations

mod duration;
mod health;
mod logs;
mod models;

pub use duration::{format_duration, parse_duration};
pub use health::{HealthCheck, LIVENESS_START_PERIOD};
pub use logs::{DEFAULT_MAX_LOG_SIZE, HEALTH_CHECK_PATTERNS, LogConfig};
pub use models::{ModelConfig, ModelVariant, ScalarString};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deps::DependencyGraph;
use crate::env::{expand_home, template_placeholders};
use crate::errors::{DaemonError, Result};
use duration::{deserialize_duration, serialize_duration};

/// Template keys every model variant provides
const BUILTIN_MODEL_KEYS: &[&str] = &["model", "model_short"];

/// Root configuration (`services.yaml`)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CockpitConfig {
    #[serde(default)]
    pub logs: LogConfig,
    /// State file path, relative to the config file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
}

/// Static description of one supervised service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Filled from the map key when the config is finalized
    #[serde(skip)]
    pub id: String,
    /// Display name; may reference model placeholders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub healthcheck: HealthCheck,
    #[serde(default = "default_stop_grace_period", deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub stop_grace_period: Duration,
}

impl ServiceDefinition {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            id: String::new(),
            name: None,
            command,
            working_dir: None,
            environment: BTreeMap::new(),
            port: None,
            depends_on: Vec::new(),
            healthcheck: HealthCheck::default(),
            stop_grace_period: default_stop_grace_period(),
        }
    }

    /// Every string that is rendered against the active model before use.
    fn templated_fields(&self) -> impl Iterator<Item = &str> {
        self.name
            .as_deref()
            .into_iter()
            .chain(self.command.iter().map(String::as_str))
            .chain(self.environment.values().map(String::as_str))
    }

    /// Whether the launch spec depends on the active model selection.
    pub fn uses_model(&self) -> bool {
        self.templated_fields()
            .any(|field| !template_placeholders(field).is_empty())
    }

    /// Probe URL, or `None` for liveness-only services.
    pub fn health_endpoint(&self) -> Option<String> {
        self.healthcheck.endpoint(self.port)
    }

    /// Display name rendered against the given model placeholders.
    /// Falls back to the raw template (or the id) if rendering fails.
    pub fn display_name(&self, vars: &HashMap<String, String>) -> String {
        match &self.name {
            Some(name) => crate::env::render_template(name, vars).unwrap_or_else(|_| name.clone()),
            None => self.id.clone(),
        }
    }
}

impl CockpitConfig {
    /// Load, resolve and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::ConfigNotFound(path.to_path_buf())
            } else {
                DaemonError::Io(e)
            }
        })?;

        let deserializer = serde_yaml::Deserializer::from_str(&contents);
        let mut config: CockpitConfig =
            serde_path_to_error::deserialize(deserializer).map_err(|source| {
                DaemonError::ConfigParse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.finalize(&config_dir)?;
        Ok(config)
    }

    /// Fill service ids, resolve relative paths against `config_dir` and validate.
    pub fn finalize(&mut self, config_dir: &Path) -> Result<()> {
        for (id, service) in self.services.iter_mut() {
            service.id = id.clone();
            let working_dir = match &service.working_dir {
                Some(dir) => resolve_path(config_dir, dir),
                None => config_dir.to_path_buf(),
            };
            service.working_dir = Some(working_dir);
        }
        self.logs.dir = resolve_path(config_dir, &self.logs.dir);
        self.state_file = resolve_path(config_dir, &self.state_file);

        self.validate()
    }

    /// Check everything that can be checked before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        self.validate_models()?;

        for (id, service) in &self.services {
            if service.command.is_empty() {
                return Err(DaemonError::Config(format!(
                    "Service {} has empty command",
                    id
                )));
            }

            let health = &service.healthcheck;
            if health.url.is_none() && health.path.is_some() && service.port.is_none() {
                return Err(DaemonError::Config(format!(
                    "Service {} has a healthcheck path but no port",
                    id
                )));
            }
            if health.unhealthy_threshold == 0 || health.error_threshold == 0 {
                return Err(DaemonError::Config(format!(
                    "Service {} healthcheck thresholds must be at least 1",
                    id
                )));
            }
            if health.interval.is_zero() {
                return Err(DaemonError::Config(format!(
                    "Service {} healthcheck interval must be non-zero",
                    id
                )));
            }

            self.validate_templates(id, service)?;
        }

        DependencyGraph::build(&self.services)?;
        Ok(())
    }

    fn validate_models(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for variant in &self.models.variants {
            if !seen.insert(variant.id.as_str()) {
                return Err(DaemonError::Config(format!(
                    "Duplicate model id: {}",
                    variant.id
                )));
            }
        }

        if let Some(active) = &self.models.active
            && !self.models.contains(active)
        {
            return Err(DaemonError::Config(format!(
                "Active model '{}' is not among the configured variants",
                active
            )));
        }
        Ok(())
    }

    /// Every placeholder must be resolvable for every variant, so any switch can render.
    fn validate_templates(&self, id: &str, service: &ServiceDefinition) -> Result<()> {
        for field in service.templated_fields() {
            for key in template_placeholders(field) {
                if self.models.variants.is_empty() {
                    return Err(DaemonError::Template {
                        service: id.to_string(),
                        message: format!("placeholder '{}' used but no models are configured", key),
                    });
                }
                if BUILTIN_MODEL_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if let Some(variant) = self
                    .models
                    .variants
                    .iter()
                    .find(|v| v.template_value(&key).is_none())
                {
                    return Err(DaemonError::Template {
                        service: id.to_string(),
                        message: format!(
                            "placeholder '{}' has no value for model '{}'",
                            key, variant.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}
