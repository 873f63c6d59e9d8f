//! Health check configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::duration::{
    deserialize_duration, deserialize_optional_duration, serialize_duration,
    serialize_optional_duration,
};

/// Start period used for liveness-only services when none is configured.
pub const LIVENESS_START_PERIOD: Duration = Duration::from_secs(2);

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    /// Full probe URL. Takes precedence over `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Probe path on `http://127.0.0.1:{port}`; requires the service to declare a port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_interval", deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub interval: Duration,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub timeout: Duration,
    #[serde(
        default,
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_period: Option<Duration>,
    #[serde(default = "default_startup_timeout", deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub startup_timeout: Duration,
    /// Consecutive failures while Running before the service is marked Unhealthy
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    /// Further consecutive failures while Unhealthy before the service is marked Error
    #[serde(default = "default_threshold")]
    pub error_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            url: None,
            path: None,
            interval: default_interval(),
            timeout: default_timeout(),
            start_period: None,
            startup_timeout: default_startup_timeout(),
            unhealthy_threshold: default_threshold(),
            error_threshold: default_threshold(),
        }
    }
}

impl HealthCheck {
    /// Resolve the probe URL, if the service has a health endpoint at all.
    pub fn endpoint(&self, port: Option<u16>) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        let path = self.path.as_deref()?;
        let port = port?;
        let path = path.strip_prefix('/').unwrap_or(path);
        Some(format!("http://127.0.0.1:{}/{}", port, path))
    }

    /// Delay before the first probe (or before liveness-only readiness).
    pub fn effective_start_period(&self, has_endpoint: bool) -> Duration {
        match self.start_period {
            Some(period) => period,
            None if has_endpoint => Duration::ZERO,
            None => LIVENESS_START_PERIOD,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_threshold() -> u32 {
    3
}
