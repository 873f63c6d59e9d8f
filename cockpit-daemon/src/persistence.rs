//! Daemon state file
//!
//! `state.json` records the selected model and the live processes of each
//! service, so a restarted daemon can restore the selection and clean up
//! processes left behind by its previous incarnation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{DaemonError, Result};

/// A process recorded by a previous daemon run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProcess {
    pub pid: u32,
    /// OS start time (Unix seconds), used to detect PID reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
    #[serde(default)]
    pub processes: BTreeMap<String, PersistedProcess>,
}

/// Reads and atomically rewrites the state file
#[derive(Debug, Clone)]
pub struct StatePersistence {
    path: PathBuf,
}

impl StatePersistence {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file. A missing or unreadable file yields `None`.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| DaemonError::State {
            path: self.path.clone(),
            message: format!("failed to read: {}", e),
        })?;

        match serde_json::from_str(&content) {
            Ok(state) => {
                debug!("Loaded daemon state from {:?}", self.path);
                Ok(Some(state))
            }
            Err(e) => {
                warn!("Failed to parse {:?}, ignoring: {}", self.path, e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let content = serde_json::to_string_pretty(state).map_err(|e| DaemonError::State {
            path: self.path.clone(),
            message: format!("failed to serialize: {}", e),
        })?;

        self.write_atomic(content.as_bytes())?;
        debug!("Saved daemon state to {:?}", self.path);
        Ok(())
    }

    /// Write to a temporary file in the same directory, then rename over the target.
    fn write_atomic(&self, content: &[u8]) -> Result<()> {
        let state_err = |message: String| DaemonError::State {
            path: self.path.clone(),
            message,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .map_err(|e| state_err(format!("failed to create directory: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| state_err(format!("failed to create temp file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| state_err(format!("failed to set permissions: {}", e)))?;
        }

        tmp.write_all(content)
            .map_err(|e| state_err(format!("failed to write temp file: {}", e)))?;

        tmp.persist(&self.path)
            .map_err(|e| state_err(format!("failed to persist: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests;
