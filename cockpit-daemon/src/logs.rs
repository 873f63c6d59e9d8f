//! Per-service log sink
//!
//! This module provides:
//! - `LogStore` - One append-only file per service plus tail queries
//! - `LogWriter` - File writer with size-based truncation
//! - `tail_file` / `parse_log_line` - Stateless readers

mod reader;
mod writer;

pub use reader::{parse_log_line, tail_file};
pub use writer::LogWriter;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::LogConfig;

/// Validate that a path is not a symlink
#[cfg(unix)]
pub(crate) fn validate_not_symlink(path: &Path) -> std::io::Result<()> {
    if let Ok(meta) = std::fs::symlink_metadata(path)
        && meta.file_type().is_symlink()
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Log path is a symlink: {:?}", path),
        ));
    }
    Ok(())
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Log sink shared by the process capture tasks and the orchestrator.
///
/// Files live at `{dir}/{service}.log`. Writers are opened lazily and kept
/// for the lifetime of the store.
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    max_size: Option<u64>,
    filter_patterns: Vec<String>,
    writers: Mutex<HashMap<String, LogWriter>>,
}

impl LogStore {
    pub fn new(config: &LogConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            max_size: config.max_size,
            filter_patterns: config.filter_patterns.clone(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a service's log file
    pub fn log_path(&self, service: &str) -> PathBuf {
        let safe_name = service.replace(['/', '\\', ':'], "_");
        self.dir.join(format!("{}.log", safe_name))
    }

    /// Append one line to a service's log
    pub fn append(&self, service: &str, line: &str) {
        let mut writers = self.writers.lock();
        let writer = writers
            .entry(service.to_string())
            .or_insert_with(|| LogWriter::new(self.log_path(service), self.max_size));
        writer.write(line);
    }

    /// Whether a line matches one of the configured filter patterns
    pub fn is_filtered(&self, line: &str) -> bool {
        self.filter_patterns.iter().any(|p| line.contains(p.as_str()))
    }

    /// Last `count` entries for a service, oldest first.
    ///
    /// With `filtered`, lines matching a filter pattern are dropped before
    /// the last `count` are taken.
    pub fn tail(&self, service: &str, count: usize, filtered: bool) -> Vec<LogLine> {
        let path = self.log_path(service);
        if filtered {
            tail_file(&path, count, |line| !self.is_filtered(line))
        } else {
            tail_file(&path, count, |_| true)
        }
    }
}
