//! System and process resource readings for admission control.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::EngineError;

/// One reading. `None` means the probe cannot measure that dimension here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub process_memory_bytes: Option<u64>,
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self) -> Result<ResourceSnapshot, EngineError>;
}

/// Returns the same snapshot every time.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub ResourceSnapshot);

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn snapshot(&self) -> Result<ResourceSnapshot, EngineError> {
        Ok(self.0)
    }
}

/// Reads `/proc` on Linux.
///
/// CPU is the one-minute load average over available cores, memory comes from
/// `MemTotal`/`MemAvailable`, process memory from `VmRSS`. Disk usage is the
/// `Capacity` column of `df -P` for the configured mount (default `/`); it is
/// `None` when `df` is missing or fails.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    root: PathBuf,
    disk_path: PathBuf,
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            disk_path: PathBuf::from("/"),
        }
    }
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    async fn disk(&self) -> Option<f64> {
        let output = match tokio::process::Command::new("df")
            .arg("-P")
            .arg(&self.disk_path)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!(error = %e, "df unavailable");
                return None;
            }
        };
        if !output.status.success() {
            debug!(
                path = %self.disk_path.display(),
                status = %output.status,
                "df failed"
            );
            return None;
        }
        disk_percent(&String::from_utf8_lossy(&output.stdout))
    }

    async fn read(&self, name: &str) -> Result<Option<String>, EngineError> {
        let path = self.root.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "resource source unavailable");
                Ok(None)
            }
            Err(e) => Err(EngineError::System(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl ResourceProbe for ProcfsProbe {
    async fn snapshot(&self) -> Result<ResourceSnapshot, EngineError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let loadavg = self.read("loadavg").await?;
        let meminfo = self.read("meminfo").await?;
        let status = self.read("self/status").await?;

        Ok(ResourceSnapshot {
            cpu_percent: loadavg.as_deref().and_then(|raw| cpu_percent(raw, cores)),
            memory_percent: meminfo.as_deref().and_then(memory_percent),
            disk_percent: self.disk().await,
            process_memory_bytes: status.as_deref().and_then(resident_bytes),
        })
    }
}

fn cpu_percent(loadavg: &str, cores: usize) -> Option<f64> {
    let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    Some((one_minute / cores.max(1) as f64 * 100.0).min(100.0))
}

fn kib_field(raw: &str, name: &str) -> Option<u64> {
    raw.lines()
        .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

fn memory_percent(meminfo: &str) -> Option<f64> {
    let total = kib_field(meminfo, "MemTotal")?;
    let available = kib_field(meminfo, "MemAvailable")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64 * 100.0)
}

fn resident_bytes(status: &str) -> Option<u64> {
    kib_field(status, "VmRSS").map(|kib| kib * 1024)
}

/// Capacity column of POSIX `df -P` output, header line first.
fn disk_percent(df: &str) -> Option<f64> {
    let row = df.lines().nth(1)?;
    let capacity = row.split_whitespace().nth(4)?.strip_suffix('%')?;
    capacity.parse().ok()
}
