//! Engine configuration.
//!
//! Every field has a default, so an empty (or absent) TOML file yields a
//! working engine:
//!
//! ```toml
//! [circuit]
//! failure_threshold = 5
//! recovery_timeout_secs = 300
//!
//! [quota]
//! max_concurrent_per_user = 5
//! memory_limit_bytes = 536870912
//!
//! [execution]
//! max_execution_secs = 3600
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures (net of gradual healing) before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before allowing a probe.
    pub recovery_timeout_secs: u64,
    /// Lifetime of stored circuit state; expired state resets to Closed.
    pub state_ttl_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 300,
            state_ttl_secs: 3600,
        }
    }
}

impl CircuitConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_concurrent_per_user: u64,
    pub max_hourly_per_user: u64,
    pub max_daily_per_user: u64,
    /// System-wide usage ceilings, in percent.
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
    /// Share of `memory_limit_bytes` this process may use, in percent.
    pub max_process_memory_percent: f64,
    pub memory_limit_bytes: u64,
    /// How long a system resource snapshot is reused.
    pub resource_snapshot_ttl_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_user: 5,
            max_hourly_per_user: 100,
            max_daily_per_user: 1000,
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
            max_disk_percent: 90.0,
            max_process_memory_percent: 80.0,
            memory_limit_bytes: 512 * 1024 * 1024,
            resource_snapshot_ttl_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Global ceiling no workflow timeout may exceed.
    pub max_execution_secs: u64,
    /// Timeout assumed when neither the caller nor the workflow sets one.
    pub default_timeout_secs: u64,
    /// Retries for retryable executor failures, unless the run overrides it.
    pub node_max_retries: u32,
    /// Ceiling for a run's `max_retries` override.
    pub max_node_retries: u32,
    /// Base delay for exponential back-off between node retries.
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: 3600,
            default_timeout_secs: 300,
            node_max_retries: 2,
            max_node_retries: 5,
            retry_base_delay_ms: 100,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry budget for one run: the caller's override, capped at
    /// `max_node_retries`, else `node_max_retries`.
    pub fn retry_budget(&self, requested: Option<i64>) -> u32 {
        match requested {
            Some(n) => u32::try_from(n.max(0))
                .unwrap_or(u32::MAX)
                .min(self.max_node_retries),
            None => self.node_max_retries,
        }
    }
}
