//! Admission control.
//!
//! Every check runs on each call and the results are ANDed. A check that
//! cannot be evaluated counts as a refusal.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::{ExecutionConfig, QuotaConfig};
use crate::models::{RunOptions, WorkflowRecord};
use crate::probe::{ResourceProbe, ResourceSnapshot};
use crate::store::{remember, ExecutionStore, KeyedCache};
use crate::EngineError;

const SNAPSHOT_KEY: &str = "quota:resource_snapshot";

/// Outcome of one limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaCheck {
    pub name: &'static str,
    pub allowed: bool,
    pub reason: Option<String>,
    pub current: f64,
    pub max: f64,
}

impl QuotaCheck {
    fn within(name: &'static str, current: f64, max: f64, reason: impl FnOnce() -> String) -> Self {
        let allowed = current < max;
        Self {
            name,
            allowed,
            reason: (!allowed).then(reason),
            current,
            max,
        }
    }

    fn unavailable(name: &'static str, max: f64, err: impl Display) -> Self {
        Self {
            name,
            allowed: false,
            reason: Some(format!("Unable to evaluate {name}: {err}")),
            current: 0.0,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Every failing check's reason, in check order.
    pub reasons: Vec<String>,
    pub checks: Vec<QuotaCheck>,
}

impl AdmissionDecision {
    fn from_checks(checks: Vec<QuotaCheck>) -> Self {
        let reasons: Vec<String> = checks.iter().filter_map(|c| c.reason.clone()).collect();
        Self {
            allowed: checks.iter().all(|c| c.allowed),
            reasons,
            checks,
        }
    }
}

pub struct QuotaGovernor {
    quota: QuotaConfig,
    execution: ExecutionConfig,
    executions: Arc<dyn ExecutionStore>,
    cache: Arc<dyn KeyedCache>,
    probe: Arc<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
}

impl QuotaGovernor {
    pub fn new(
        quota: QuotaConfig,
        execution: ExecutionConfig,
        executions: Arc<dyn ExecutionStore>,
        cache: Arc<dyn KeyedCache>,
        probe: Arc<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            quota,
            execution,
            executions,
            cache,
            probe,
            clock,
        }
    }

    /// Evaluate every limit for a prospective run of `workflow`.
    #[instrument(skip(self, workflow, options), fields(workflow_id = %workflow.id, user_id = ?options.user_id))]
    pub async fn check_admission(
        &self,
        workflow: &WorkflowRecord,
        options: &RunOptions,
    ) -> AdmissionDecision {
        let user_id = options.user_id;
        let now = self.clock.now();

        let (running, hourly, daily, snapshot) = tokio::join!(
            self.executions.count_running(user_id),
            self.executions
                .count_started_since(user_id, now - chrono::Duration::hours(1)),
            self.executions
                .count_started_since(user_id, now - chrono::Duration::days(1)),
            self.resource_snapshot(),
        );

        let q = &self.quota;
        let mut checks = vec![
            count_check(
                "concurrent_executions",
                running,
                q.max_concurrent_per_user,
                "Maximum concurrent executions reached",
            ),
            count_check(
                "hourly_executions",
                hourly,
                q.max_hourly_per_user,
                "Maximum hourly executions reached",
            ),
            count_check(
                "daily_executions",
                daily,
                q.max_daily_per_user,
                "Maximum daily executions reached",
            ),
        ];

        match snapshot {
            Ok(snapshot) => {
                checks.extend(self.resource_checks(&snapshot));
            }
            Err(e) => {
                checks.push(QuotaCheck::unavailable("system_resources", q.max_cpu_percent, e));
            }
        }

        checks.push(self.timeout_check(workflow, options));

        let decision = AdmissionDecision::from_checks(checks);
        if !decision.allowed {
            warn!(reasons = ?decision.reasons, "admission denied");
        }
        decision
    }

    async fn resource_snapshot(&self) -> Result<ResourceSnapshot, EngineError> {
        let ttl = Duration::from_secs(self.quota.resource_snapshot_ttl_secs);
        remember(self.cache.as_ref(), SNAPSHOT_KEY, ttl, || self.probe.snapshot()).await
    }

    fn resource_checks(&self, snapshot: &ResourceSnapshot) -> Vec<QuotaCheck> {
        let q = &self.quota;
        let mut checks = Vec::new();

        let system = [
            ("system_cpu", "CPU", snapshot.cpu_percent, q.max_cpu_percent),
            ("system_memory", "memory", snapshot.memory_percent, q.max_memory_percent),
            ("system_disk", "disk", snapshot.disk_percent, q.max_disk_percent),
        ];
        for (name, label, reading, max) in system {
            match reading {
                Some(current) => checks.push(QuotaCheck::within(name, current, max, || {
                    format!("System {label} usage too high ({current:.1}%/{max:.1}%)")
                })),
                None => debug!(check = name, "metric not measurable, skipping"),
            }
        }

        match snapshot.process_memory_bytes {
            Some(_) if q.memory_limit_bytes == 0 => {
                checks.push(QuotaCheck::unavailable(
                    "process_memory",
                    q.max_process_memory_percent,
                    "memory limit is zero",
                ));
            }
            Some(bytes) => {
                let current = bytes as f64 / q.memory_limit_bytes as f64 * 100.0;
                let max = q.max_process_memory_percent;
                checks.push(QuotaCheck::within("process_memory", current, max, || {
                    format!("Process memory usage too high ({current:.1}%/{max:.1}%)")
                }));
            }
            None => debug!(check = "process_memory", "metric not measurable, skipping"),
        }

        checks
    }

    fn timeout_check(&self, workflow: &WorkflowRecord, options: &RunOptions) -> QuotaCheck {
        let requested = options
            .timeout
            .and_then(|t| u64::try_from(t).ok())
            .or(workflow.timeout_secs)
            .unwrap_or(self.execution.default_timeout_secs);
        let max = self.execution.max_execution_secs;
        let allowed = requested <= max;

        QuotaCheck {
            name: "execution_timeout",
            allowed,
            reason: (!allowed).then(|| {
                format!(
                    "Workflow timeout ({requested}s) exceeds maximum execution time ({max}s)"
                )
            }),
            current: requested as f64,
            max: max as f64,
        }
    }
}

fn count_check(
    name: &'static str,
    counted: Result<u64, EngineError>,
    max: u64,
    message: &str,
) -> QuotaCheck {
    match counted {
        Ok(current) => QuotaCheck::within(name, current as f64, max as f64, || {
            format!("{message} ({current}/{max})")
        }),
        Err(e) => QuotaCheck::unavailable(name, max as f64, e),
    }
}
