//! Read-only aggregation over execution history.
//!
//! [`MetricsAnalyzer::report`] loads a window of executions for one workflow
//! and hands them to [`summarize`], which does all the arithmetic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::{Execution, ExecutionStatus};
use crate::store::{ExecutionStore, HistoryWindow};
use crate::EngineError;

const COST_PER_SECOND: f64 = 0.01;
const PERFORMANCE_SAMPLE: usize = 10;
const TOP_MESSAGES: usize = 5;

/// Volume change (percent) beyond which the trend is no longer stable.
const VOLUME_THRESHOLD: f64 = 10.0;
/// Timing and cost change (percent) beyond which the trend is no longer stable.
const PERFORMANCE_THRESHOLD: f64 = 5.0;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub counts: ExecutionCounts,
    pub timing: Option<TimingStats>,
    pub daily: Vec<DailyBucket>,
    pub volume_trend: TrendDirection,
    /// Percent change of the second half of `daily` over the first half.
    pub volume_change_percent: Option<f64>,
    pub errors: ErrorBreakdown,
    pub performance: PerformanceTrend,
    pub cost: CostAnalysis,
    pub compliance: Compliance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
    pub cancelled: u64,
    /// Percentages of `total`.
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Share of executions that recorded any node or run error.
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub samples: u64,
    pub mean_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    pub stddev_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    Validation,
    Permission,
    NotFound,
    ServerError,
    Other,
}

impl ErrorCategory {
    /// Keyword-based classification; first matching category wins.
    pub fn classify(message: &str) -> Self {
        const RULES: [(ErrorCategory, &[&str]); 6] = [
            (ErrorCategory::Timeout, &["timeout", "timed out"]),
            (ErrorCategory::Connection, &["connection", "connect", "network", "refused"]),
            (ErrorCategory::Validation, &["validation", "invalid", "required"]),
            (ErrorCategory::Permission, &["permission", "unauthorized", "forbidden", "denied"]),
            (ErrorCategory::NotFound, &["not found", "404"]),
            (ErrorCategory::ServerError, &["500", "server error", "internal"]),
        ];

        let lowered = message.to_lowercase();
        RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
            .map_or(Self::Other, |(category, _)| *category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageCount {
    pub message: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorBreakdown {
    pub total: u64,
    pub categories: BTreeMap<ErrorCategory, u64>,
    pub top_messages: Vec<MessageCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceDirection {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceTrend {
    pub direction: PerformanceDirection,
    pub recent_mean_ms: Option<f64>,
    pub previous_mean_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAnalysis {
    pub total_cost: f64,
    pub cost_per_execution: f64,
    pub trend: CostTrend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Passed,
    Warning,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compliance {
    pub score: f64,
    pub security_level: SecurityLevel,
    pub audit_status: AuditStatus,
}

impl Compliance {
    fn from_rates(failure_rate: f64, error_rate: f64) -> Self {
        let score = (100.0 - failure_rate * 0.5 - error_rate * 0.3).clamp(0.0, 100.0);
        let security_level = match score {
            s if s >= 90.0 => SecurityLevel::High,
            s if s >= 70.0 => SecurityLevel::Medium,
            _ => SecurityLevel::Low,
        };
        let audit_status = match score {
            s if s >= 80.0 => AuditStatus::Passed,
            s if s >= 60.0 => AuditStatus::Warning,
            _ => AuditStatus::Failed,
        };
        Self {
            score,
            security_level,
            audit_status,
        }
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct MetricsAnalyzer {
    executions: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
}

impl MetricsAnalyzer {
    pub fn new(executions: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { executions, clock }
    }

    /// Report on the last `days` days of one workflow's executions.
    #[instrument(skip(self))]
    pub async fn report(&self, workflow_id: Uuid, days: u32) -> Result<AnalysisReport, EngineError> {
        let until = self.clock.now();
        let since = until - Duration::days(i64::from(days));
        let history = self
            .executions
            .get_by_workflow_id(workflow_id, HistoryWindow::between(since, until))
            .await?;
        Ok(summarize(&history, since, until))
    }
}

/// Aggregate `executions` (any order) over the window `[since, until]`.
pub fn summarize(executions: &[Execution], since: DateTime<Utc>, until: DateTime<Utc>) -> AnalysisReport {
    let mut newest_first: Vec<&Execution> = executions.iter().collect();
    newest_first.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let counts = counts(executions);
    let daily = daily_buckets(executions, since, until);
    let (volume_trend, volume_change_percent) = volume_trend(&daily);
    let durations: Vec<i64> = newest_first.iter().filter_map(|e| e.execution_time_ms).collect();
    let compliance = Compliance::from_rates(counts.failure_rate, counts.error_rate);

    AnalysisReport {
        since,
        until,
        timing: timing(&durations),
        daily,
        volume_trend,
        volume_change_percent,
        errors: error_breakdown(executions),
        performance: performance(&durations),
        cost: cost(&durations),
        compliance,
        counts,
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn counts(executions: &[Execution]) -> ExecutionCounts {
    let total = executions.len() as u64;
    let with = |status: ExecutionStatus| executions.iter().filter(|e| e.status == status).count() as u64;
    let completed = with(ExecutionStatus::Completed);
    let failed = with(ExecutionStatus::Failed);
    let errored = executions.iter().filter(|e| e.has_errors()).count() as u64;

    ExecutionCounts {
        total,
        completed,
        failed,
        running: with(ExecutionStatus::Running),
        cancelled: with(ExecutionStatus::Cancelled),
        success_rate: percent(completed, total),
        failure_rate: percent(failed, total),
        error_rate: percent(errored, total),
    }
}

fn mean(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64)
}

fn timing(durations: &[i64]) -> Option<TimingStats> {
    let mean_ms = mean(durations)?;
    let variance = durations
        .iter()
        .map(|&v| (v as f64 - mean_ms).powi(2))
        .sum::<f64>()
        / durations.len() as f64;

    Some(TimingStats {
        samples: durations.len() as u64,
        mean_ms,
        min_ms: durations.iter().copied().min()?,
        max_ms: durations.iter().copied().max()?,
        stddev_ms: variance.sqrt(),
    })
}

/// One bucket per UTC day in the window, zero-filled.
fn daily_buckets(executions: &[Execution], since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DailyBucket> {
    let mut by_day: HashMap<NaiveDate, DailyBucket> = HashMap::new();
    for execution in executions {
        let date = execution.started_at.date_naive();
        let bucket = by_day.entry(date).or_insert_with(|| DailyBucket {
            date,
            total: 0,
            completed: 0,
            failed: 0,
        });
        bucket.total += 1;
        match execution.status {
            ExecutionStatus::Completed => bucket.completed += 1,
            ExecutionStatus::Failed => bucket.failed += 1,
            _ => {}
        }
    }

    let last = until.date_naive();
    since
        .date_naive()
        .iter_days()
        .take_while(|date| *date <= last)
        .map(|date| {
            by_day.remove(&date).unwrap_or(DailyBucket {
                date,
                total: 0,
                completed: 0,
                failed: 0,
            })
        })
        .collect()
}

/// Percent change of `current` over `previous`.
fn change(previous: f64, current: f64) -> Option<f64> {
    (previous != 0.0).then(|| (current - previous) / previous * 100.0)
}

fn volume_trend(daily: &[DailyBucket]) -> (TrendDirection, Option<f64>) {
    let (first, second) = daily.split_at(daily.len() / 2);
    let previous: u64 = first.iter().map(|b| b.total).sum();
    let current: u64 = second.iter().map(|b| b.total).sum();

    match change(previous as f64, current as f64) {
        Some(pct) if pct > VOLUME_THRESHOLD => (TrendDirection::Increasing, Some(pct)),
        Some(pct) if pct < -VOLUME_THRESHOLD => (TrendDirection::Decreasing, Some(pct)),
        Some(pct) => (TrendDirection::Stable, Some(pct)),
        None if current > 0 => (TrendDirection::Increasing, None),
        None => (TrendDirection::Stable, None),
    }
}

fn error_breakdown(executions: &[Execution]) -> ErrorBreakdown {
    let messages = executions
        .iter()
        .flat_map(|e| e.errors.values().chain(e.error.iter()));

    let mut breakdown = ErrorBreakdown::default();
    let mut by_message: HashMap<&str, u64> = HashMap::new();
    for message in messages {
        breakdown.total += 1;
        *breakdown
            .categories
            .entry(ErrorCategory::classify(message))
            .or_insert(0) += 1;
        *by_message.entry(message.as_str()).or_insert(0) += 1;
    }

    let mut top: Vec<MessageCount> = by_message
        .into_iter()
        .map(|(message, count)| MessageCount {
            message: message.to_string(),
            count,
        })
        .collect();
    top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    top.truncate(TOP_MESSAGES);
    breakdown.top_messages = top;
    breakdown
}

/// Means of the newest sample and the one before it.
fn recent_and_previous(newest_first: &[i64]) -> (Option<f64>, Option<f64>) {
    let recent = &newest_first[..newest_first.len().min(PERFORMANCE_SAMPLE)];
    let previous = newest_first
        .get(PERFORMANCE_SAMPLE..)
        .map(|rest| &rest[..rest.len().min(PERFORMANCE_SAMPLE)])
        .unwrap_or_default();
    (mean(recent), mean(previous))
}

fn performance(newest_first: &[i64]) -> PerformanceTrend {
    let (recent_mean_ms, previous_mean_ms) = recent_and_previous(newest_first);
    let direction = match recent_mean_ms.zip(previous_mean_ms).and_then(|(r, p)| change(p, r)) {
        Some(pct) if pct < -PERFORMANCE_THRESHOLD => PerformanceDirection::Improving,
        Some(pct) if pct > PERFORMANCE_THRESHOLD => PerformanceDirection::Degrading,
        _ => PerformanceDirection::Stable,
    };
    PerformanceTrend {
        direction,
        recent_mean_ms,
        previous_mean_ms,
    }
}

fn cost(newest_first: &[i64]) -> CostAnalysis {
    let cost_of = |ms: f64| ms / 1000.0 * COST_PER_SECOND;
    let total_cost: f64 = newest_first.iter().map(|&ms| cost_of(ms as f64)).sum();
    let cost_per_execution = if newest_first.is_empty() {
        0.0
    } else {
        total_cost / newest_first.len() as f64
    };

    let (recent, previous) = recent_and_previous(newest_first);
    let trend = match recent.zip(previous).and_then(|(r, p)| change(cost_of(p), cost_of(r))) {
        Some(pct) if pct > PERFORMANCE_THRESHOLD => CostTrend::Increasing,
        Some(pct) if pct < -PERFORMANCE_THRESHOLD => CostTrend::Decreasing,
        _ => CostTrend::Stable,
    };

    CostAnalysis {
        total_cost,
        cost_per_execution,
        trend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryExecutionStore;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).single().unwrap()
    }

    fn execution(status: ExecutionStatus, started_at: DateTime<Utc>, time_ms: Option<i64>) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::nil(),
            user_id: None,
            status,
            payload: Default::default(),
            started_at,
            completed_at: None,
            execution_time_ms: time_ms,
            processed_nodes: Vec::new(),
            results: Default::default(),
            errors: Default::default(),
            error: None,
        }
    }

    fn failed_with(message: &str, started_at: DateTime<Utc>) -> Execution {
        let mut e = execution(ExecutionStatus::Failed, started_at, Some(100));
        e.errors.insert("node".into(), message.into());
        e
    }

    #[test]
    fn classifies_by_first_matching_keyword() {
        assert_eq!(ErrorCategory::classify("Request TIMED OUT"), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify("connection refused"), ErrorCategory::Connection);
        assert_eq!(ErrorCategory::classify("field 'to' is required"), ErrorCategory::Validation);
        assert_eq!(ErrorCategory::classify("403 Forbidden"), ErrorCategory::Permission);
        assert_eq!(ErrorCategory::classify("page not found"), ErrorCategory::NotFound);
        assert_eq!(ErrorCategory::classify("HTTP 500"), ErrorCategory::ServerError);
        assert_eq!(ErrorCategory::classify("something odd"), ErrorCategory::Other);
        // Timeout is checked before connection.
        assert_eq!(ErrorCategory::classify("connection timeout"), ErrorCategory::Timeout);
    }

    #[test]
    fn counts_rates_and_timing() {
        let executions = vec![
            execution(ExecutionStatus::Completed, at(1, 1), Some(100)),
            execution(ExecutionStatus::Completed, at(1, 2), Some(300)),
            failed_with("boom", at(1, 3)),
            execution(ExecutionStatus::Running, at(1, 4), None),
        ];
        let report = summarize(&executions, at(1, 0), at(1, 23));

        assert_eq!(report.counts.total, 4);
        assert_eq!(report.counts.success_rate, 50.0);
        assert_eq!(report.counts.failure_rate, 25.0);
        assert_eq!(report.counts.error_rate, 25.0);
        assert_eq!(report.counts.running, 1);

        let timing = report.timing.expect("timed executions");
        assert_eq!(timing.samples, 3);
        assert_eq!(timing.min_ms, 100);
        assert_eq!(timing.max_ms, 300);
        assert!((timing.mean_ms - 500.0 / 3.0).abs() < 1e-9);
        assert!((timing.stddev_ms - (80_000.0f64 / 9.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn empty_history_is_quiet() {
        let report = summarize(&[], at(1, 0), at(3, 0));
        assert_eq!(report.counts, ExecutionCounts::default());
        assert!(report.timing.is_none());
        assert_eq!(report.daily.len(), 3);
        assert_eq!(report.volume_trend, TrendDirection::Stable);
        assert_eq!(report.compliance.score, 100.0);
        assert_eq!(report.compliance.audit_status, AuditStatus::Passed);
    }

    #[test]
    fn daily_series_is_zero_filled_and_drives_volume_trend() {
        let executions = vec![
            execution(ExecutionStatus::Completed, at(1, 5), Some(10)),
            execution(ExecutionStatus::Completed, at(3, 5), Some(10)),
            execution(ExecutionStatus::Completed, at(4, 5), Some(10)),
            execution(ExecutionStatus::Failed, at(4, 6), Some(10)),
        ];
        let report = summarize(&executions, at(1, 0), at(4, 12));

        let totals: Vec<u64> = report.daily.iter().map(|b| b.total).collect();
        assert_eq!(totals, vec![1, 0, 1, 2]);
        assert_eq!(report.daily[3].failed, 1);
        assert_eq!(report.volume_trend, TrendDirection::Increasing);
        assert_eq!(report.volume_change_percent, Some(200.0));
    }

    #[test]
    fn volume_from_nothing_is_increasing() {
        let executions = vec![execution(ExecutionStatus::Completed, at(2, 5), None)];
        let report = summarize(&executions, at(1, 0), at(2, 12));
        assert_eq!(report.volume_trend, TrendDirection::Increasing);
        assert_eq!(report.volume_change_percent, None);
    }

    #[test]
    fn performance_and_cost_compare_recent_ten_to_previous_ten() {
        // Newest ten took 1s each, the ten before took 2s each.
        let executions: Vec<Execution> = (0..20)
            .map(|i| {
                let ms = if i < 10 { 2_000 } else { 1_000 };
                execution(ExecutionStatus::Completed, at(1, 0) + Duration::minutes(i), Some(ms))
            })
            .collect();
        let report = summarize(&executions, at(1, 0), at(1, 23));

        assert_eq!(report.performance.direction, PerformanceDirection::Improving);
        assert_eq!(report.performance.recent_mean_ms, Some(1_000.0));
        assert_eq!(report.performance.previous_mean_ms, Some(2_000.0));
        assert_eq!(report.cost.trend, CostTrend::Decreasing);
        assert!((report.cost.total_cost - 0.30).abs() < 1e-9);
        assert!((report.cost.cost_per_execution - 0.015).abs() < 1e-9);
    }

    #[test]
    fn error_breakdown_groups_and_ranks_messages() {
        let executions = vec![
            failed_with("connection refused", at(1, 1)),
            failed_with("connection refused", at(1, 2)),
            failed_with("timeout after 30s", at(1, 3)),
        ];
        let report = summarize(&executions, at(1, 0), at(1, 23));

        assert_eq!(report.errors.total, 3);
        assert_eq!(report.errors.categories.get(&ErrorCategory::Connection), Some(&2));
        assert_eq!(report.errors.categories.get(&ErrorCategory::Timeout), Some(&1));
        assert_eq!(
            report.errors.top_messages[0],
            MessageCount {
                message: "connection refused".into(),
                count: 2
            }
        );
    }

    #[test]
    fn compliance_bands() {
        let c = Compliance::from_rates(0.0, 0.0);
        assert_eq!((c.security_level, c.audit_status), (SecurityLevel::High, AuditStatus::Passed));

        let c = Compliance::from_rates(40.0, 40.0); // 68
        assert_eq!((c.security_level, c.audit_status), (SecurityLevel::Low, AuditStatus::Warning));

        let c = Compliance::from_rates(100.0, 100.0); // 20
        assert_eq!(c.audit_status, AuditStatus::Failed);
        assert_eq!(c.score, 20.0);
    }

    #[tokio::test]
    async fn report_reads_the_window_from_the_store() {
        let clock = Arc::new(ManualClock::new(at(10, 12)));
        let store = Arc::new(MemoryExecutionStore::with_clock(clock.clone()));
        let workflow_id = Uuid::new_v4();

        let mut old = execution(ExecutionStatus::Completed, at(1, 0), Some(10));
        old.workflow_id = workflow_id;
        let mut recent = execution(ExecutionStatus::Failed, at(9, 0), Some(10));
        recent.workflow_id = workflow_id;
        store.insert(old);
        store.insert(recent);

        let analyzer = MetricsAnalyzer::new(store, clock);
        let report = analyzer.report(workflow_id, 7).await.unwrap();

        assert_eq!(report.counts.total, 1);
        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.daily.len(), 8);
    }
}
