//! Reading entries back out of service log files

use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::LogLine;

/// Parse one `{timestamp_ms}\t{line}` entry.
pub fn parse_log_line(raw: &str) -> Option<LogLine> {
    let (ts, line) = raw.split_once('\t')?;
    let millis: i64 = ts.parse().ok()?;
    let timestamp: DateTime<Utc> = Utc.timestamp_millis_opt(millis).single()?;
    Some(LogLine {
        timestamp,
        line: line.to_string(),
    })
}

/// Last `count` entries of a log file, oldest first.
///
/// Entries rejected by `keep` are skipped before counting. A missing file
/// yields no entries.
pub fn tail_file(path: &Path, count: usize, keep: impl Fn(&str) -> bool) -> Vec<LogLine> {
    if count == 0 {
        return Vec::new();
    }

    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let mut window: VecDeque<LogLine> = VecDeque::with_capacity(count.min(1024));
    for raw in BufReader::new(file).lines() {
        let Ok(raw) = raw else {
            // Non-UTF-8 or truncated mid-read; skip the entry
            continue;
        };
        let Some(entry) = parse_log_line(&raw) else {
            continue;
        };
        if !keep(&entry.line) {
            continue;
        }
        if window.len() == count {
            window.pop_front();
        }
        window.push_back(entry);
    }

    window.into()
}
