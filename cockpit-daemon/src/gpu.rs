//! GPU utilization via `nvidia-smi`
//!
//! Queried on demand; every field is `None` when no GPU or driver tooling is
//! available.

use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Query for the first GPU's name, memory and utilization
pub const NVIDIA_SMI_QUERY: &[&str] = &[
    "nvidia-smi",
    "--query-gpu=name,memory.used,memory.total,utilization.gpu",
    "--format=csv,noheader,nounits",
];

pub const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub name: Option<String>,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub utilization_percent: Option<u32>,
}

impl GpuInfo {
    /// Parse `--format=csv,noheader,nounits` output; only the first GPU is reported.
    ///
    /// Values the driver reports as `[N/A]` come back as `None`.
    pub fn parse_csv(output: &str) -> Option<Self> {
        let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [name, used, total, utilization, ..] = fields.as_slice() else {
            return None;
        };
        if name.is_empty() {
            return None;
        }

        Some(Self {
            name: Some(name.to_string()),
            memory_used_mb: used.parse().ok(),
            memory_total_mb: total.parse().ok(),
            utilization_percent: utilization.parse().ok(),
        })
    }
}

/// Query the local GPU with `nvidia-smi`.
pub async fn query_gpu_info() -> GpuInfo {
    query_gpu_info_with(NVIDIA_SMI_QUERY, GPU_QUERY_TIMEOUT).await
}

/// Run `command` (program and args) and parse its CSV output, giving up after `timeout`.
pub async fn query_gpu_info_with(command: &[&str], timeout: Duration) -> GpuInfo {
    let Some((program, args)) = command.split_first() else {
        return GpuInfo::default();
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, no GPU metrics", program);
            return GpuInfo::default();
        }
        Ok(Err(e)) => {
            warn!("Failed to run {}: {}", program, e);
            return GpuInfo::default();
        }
        Err(_) => {
            warn!("{} did not answer within {:?}", program, timeout);
            return GpuInfo::default();
        }
    };

    if !output.status.success() {
        debug!("{} exited with {}", program, output.status);
        return GpuInfo::default();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    GpuInfo::parse_csv(&stdout).unwrap_or_else(|| {
        warn!("Unexpected {} output: {:?}", program, stdout.trim());
        GpuInfo::default()
    })
}
