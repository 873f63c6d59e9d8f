//! Append-only log file writer with optional truncation

use chrono::Utc;
use std::fmt::Write as FmtWrite;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use super::validate_not_symlink;

/// Writer for one service log file.
///
/// Every line is written straight through (no buffering) so tails see output
/// as soon as the process prints it. When `max_log_size` is set and the file
/// has grown past it, the file is truncated and writing starts fresh.
pub struct LogWriter {
    log_file: PathBuf,
    file: Option<File>,
    /// Maximum log file size before truncation. None = unbounded.
    max_log_size: Option<u64>,
    bytes_written: u64,
    format_buffer: String,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("log_file", &self.log_file)
            .field("max_log_size", &self.max_log_size)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl LogWriter {
    pub fn new(log_file: PathBuf, max_log_size: Option<u64>) -> Self {
        if let Some(dir) = log_file.parent() {
            let _ = fs::create_dir_all(dir);
        }

        // Continue counting from the existing file size
        let bytes_written = fs::metadata(&log_file).map(|m| m.len()).unwrap_or(0);

        Self {
            log_file,
            file: None,
            max_log_size,
            bytes_written,
            format_buffer: String::with_capacity(256),
        }
    }

    /// Write a log line (adds timestamp automatically)
    pub fn write(&mut self, line: &str) {
        let timestamp = Utc::now().timestamp_millis();

        // Format: {timestamp_ms}\t{message}\n
        self.format_buffer.clear();
        let _ = writeln!(self.format_buffer, "{}\t{}", timestamp, line);

        if let Some(max_size) = self.max_log_size
            && self.bytes_written >= max_size
        {
            self.truncate_log_file();
        }

        if self.file.is_none() {
            self.file = self.open_log_file();
        }

        if let Some(ref mut file) = self.file {
            let data = self.format_buffer.as_bytes();
            if let Err(e) = file.write_all(data) {
                tracing::warn!("Failed to write log entry: {}", e);
                self.file = None;
            } else {
                self.bytes_written += data.len() as u64;
            }
        }
    }

    fn open_log_file(&self) -> Option<File> {
        #[cfg(unix)]
        if let Err(e) = validate_not_symlink(&self.log_file) {
            tracing::warn!("Refusing to open log file: {}", e);
            return None;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
        {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!("Failed to open log file {:?}: {}", self.log_file, e);
                None
            }
        }
    }

    /// Truncate the log file and start fresh.
    fn truncate_log_file(&mut self) {
        tracing::debug!("Truncating log file {:?}", self.log_file);

        self.file = None;

        match OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.log_file)
        {
            Ok(_) => self.bytes_written = 0,
            Err(e) => tracing::warn!("Failed to truncate log file {:?}: {}", self.log_file, e),
        }
    }
}
