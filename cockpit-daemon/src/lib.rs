pub mod config;
pub mod deps;
pub mod env;
pub mod errors;
pub mod gpu;
pub mod health;
pub mod logs;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod state;

pub use config::CockpitConfig;
pub use orchestrator::{OrchestratorError, ServiceOrchestrator, SwitchOutcome};

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "services.yaml";
