//! Log storage configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Access-log fragments produced by health probes hitting the supervised servers
pub const HEALTH_CHECK_PATTERNS: &[&str] = &[
    "\"GET /health HTTP",
    "\"GET /v1/models HTTP",
    "\"GET /v1/health HTTP",
];

/// Default max log file size before truncation (10MB)
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Directory holding one log file per service, relative to the config file
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// Truncate a service log once it grows past this many bytes. `null` = unbounded.
    #[serde(default = "default_max_size")]
    pub max_size: Option<u64>,
    /// Lines containing any of these are hidden from filtered tails
    #[serde(default = "default_filter_patterns")]
    pub filter_patterns: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            max_size: default_max_size(),
            filter_patterns: default_filter_patterns(),
        }
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_max_size() -> Option<u64> {
    Some(DEFAULT_MAX_LOG_SIZE)
}

fn default_filter_patterns() -> Vec<String> {
    HEALTH_CHECK_PATTERNS.iter().map(|p| p.to_string()).collect()
}
