//! Test utilities for the cockpit workspace
//!
//! This crate provides builders, a scripted health probe, a fake HTTP health
//! endpoint and polling helpers for exercising the orchestrator end to end
//! with real child processes.

pub mod helpers;

pub use helpers::config_builder::{TestConfigBuilder, TestHealthCheckBuilder, TestServiceBuilder};
pub use helpers::fake_health::FakeHealthServer;
pub use helpers::scripted_probe::ScriptedProbe;
pub use helpers::wait_utils::{wait_for_error, wait_for_running, wait_for_state, wait_for_stopped, wait_until};
