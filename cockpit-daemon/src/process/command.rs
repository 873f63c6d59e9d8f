//! Rendered launch specification for one service process

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::ServiceDefinition;
use crate::env::{build_service_env, render_template};
use crate::errors::{DaemonError, Result};

/// Everything needed to launch one process instance.
///
/// Built from a `ServiceDefinition` at spawn time, with model placeholders
/// already substituted for the active model.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program and arguments (e.g., ["vllm", "serve", "org/model"])
    pub program_and_args: Vec<String>,
    pub working_dir: PathBuf,
    /// Full environment (inherited daemon environment plus overrides)
    pub environment: HashMap<String, String>,
    /// Declared port, checked for availability before spawning
    pub port: Option<u16>,
}

impl CommandSpec {
    /// Render a service definition against the given model placeholders.
    pub fn render(definition: &ServiceDefinition, vars: &HashMap<String, String>) -> Result<Self> {
        let template_err = |message: String| DaemonError::Template {
            service: definition.id.clone(),
            message,
        };

        let program_and_args = definition
            .command
            .iter()
            .map(|arg| render_template(arg, vars))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(template_err)?;

        let environment =
            build_service_env(&definition.environment, vars).map_err(template_err)?;

        let working_dir = definition
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            program_and_args,
            working_dir,
            environment,
            port: definition.port,
        })
    }

    pub fn program(&self) -> Option<&str> {
        self.program_and_args.first().map(String::as_str)
    }
}
