//! Circuit breaker for node types and downstream services.
//!
//! ## States
//!
//! - **Closed**: calls pass through. Success heals one failure; failure adds
//!   one, and reaching `failure_threshold` opens the circuit.
//! - **Open**: calls fail immediately without invoking the operation, until
//!   `recovery_timeout` has passed since the last failure.
//! - **HalfOpen**: one probe call is let through. Success closes the circuit
//!   and clears the failure count; failure re-opens it.
//!
//! State lives in the shared [`KeyedCache`] under `circuit_breaker:<service>`
//! with a fixed TTL; expired state comes back as a fresh Closed circuit.
//! Every transition is a compare-and-swap, so concurrent callers on the same
//! service never lose each other's updates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::CircuitConfig;
use crate::store::KeyedCache;
use crate::EngineError;

/// Failure count written by [`CircuitBreaker::force_open`].
pub const FORCED_OPEN_FAILURES: u32 = 999_999;

const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted per-service state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Set while a half-open probe is in flight.
    #[serde(default)]
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            total_requests: 0,
            successful_requests: 0,
            last_failure_at: None,
            last_success_at: None,
            probe_started_at: None,
        }
    }
}

impl CircuitState {
    /// Percentage of successful calls; a circuit with no traffic counts as 100.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    pub fn is_healthy(&self) -> bool {
        self.status == CircuitStatus::Closed && self.success_rate() > 90.0
    }

    fn recovery_due(&self, now: DateTime<Utc>, recovery: Duration) -> bool {
        waited(self.last_failure_at, now, recovery)
    }

    fn probe_stale(&self, now: DateTime<Utc>, recovery: Duration) -> bool {
        waited(self.probe_started_at, now, recovery)
    }
}

/// Has `wait` elapsed since `since`? An unset `since` counts as elapsed.
fn waited(since: Option<DateTime<Utc>>, now: DateTime<Utc>, wait: Duration) -> bool {
    let Some(at) = since else {
        return true;
    };
    chrono::Duration::from_std(wait)
        .ok()
        .and_then(|wait| at.checked_add_signed(wait))
        .is_some_and(|due| now >= due)
}

/// Per-call thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitThresholds {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&CircuitConfig> for CircuitThresholds {
    fn from(config: &CircuitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
        }
    }
}

/// Read-only view of a circuit for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub service: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub is_healthy: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Why [`CircuitBreaker::execute`] did not return the operation's value.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker is open for '{service}'")]
    Open { service: String },

    #[error("circuit breaker state unavailable: {0}")]
    State(EngineError),

    #[error("{0}")]
    Inner(E),
}

enum Admission {
    Allowed,
    Probe,
    Rejected,
}

pub struct CircuitBreaker {
    cache: Arc<dyn KeyedCache>,
    clock: Arc<dyn Clock>,
    state_ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(cache: Arc<dyn KeyedCache>, clock: Arc<dyn Clock>, state_ttl: Duration) -> Self {
        Self {
            cache,
            clock,
            state_ttl,
        }
    }

    fn key(service: &str) -> String {
        format!("circuit_breaker:{service}")
    }

    /// Run `operation` under the circuit for `service`.
    ///
    /// # Errors
    /// - [`CircuitError::Open`] without invoking `operation` while the circuit
    ///   is open (or a half-open probe is already in flight).
    /// - [`CircuitError::Inner`] when `operation` fails; the failure is counted.
    pub async fn execute<T, E, F, Fut>(
        &self,
        service: &str,
        thresholds: CircuitThresholds,
        operation: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_unless(service, thresholds, operation, |_| false)
            .await
    }

    /// [`execute`](Self::execute), except an `Ok` value matching `neutral` is
    /// counted as neither success nor failure. A half-open probe slot it held
    /// is handed back.
    pub async fn execute_unless<T, E, F, Fut, N>(
        &self,
        service: &str,
        thresholds: CircuitThresholds,
        operation: F,
        neutral: N,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: Fn(&T) -> bool,
    {
        match self.admit(service, thresholds).await.map_err(CircuitError::State)? {
            Admission::Rejected => {
                debug!(service, "circuit open, failing fast");
                return Err(CircuitError::Open {
                    service: service.to_string(),
                });
            }
            Admission::Probe => info!(service, "circuit half-open, sending probe"),
            Admission::Allowed => {}
        }

        match operation().await {
            Ok(value) => {
                if neutral(&value) {
                    if let Err(e) = self.release_probe(service).await {
                        warn!(service, error = %e, "failed to release circuit probe");
                    }
                } else if let Err(e) = self.record_success(service).await {
                    warn!(service, error = %e, "failed to record circuit success");
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.record_failure(service, thresholds).await {
                    warn!(service, error = %e, "failed to record circuit failure");
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Would a call to `service` be let through right now? Does not change state.
    pub async fn is_available(
        &self,
        service: &str,
        thresholds: CircuitThresholds,
    ) -> Result<bool, EngineError> {
        let (_, state) = self.load(service).await?;
        let now = self.clock.now();
        Ok(match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => state.recovery_due(now, thresholds.recovery_timeout),
            CircuitStatus::HalfOpen => state.probe_stale(now, thresholds.recovery_timeout),
        })
    }

    pub async fn state(&self, service: &str) -> Result<CircuitState, EngineError> {
        Ok(self.load(service).await?.1)
    }

    pub async fn stats(&self, service: &str) -> Result<CircuitStats, EngineError> {
        let state = self.state(service).await?;
        Ok(CircuitStats {
            service: service.to_string(),
            status: state.status,
            failure_count: state.failure_count,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            success_rate: state.success_rate(),
            is_healthy: state.is_healthy(),
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
        })
    }

    pub async fn record_success(&self, service: &str) -> Result<CircuitState, EngineError> {
        let now = self.clock.now();
        self.mutate(service, |state| {
            state.total_requests += 1;
            state.successful_requests += 1;
            state.last_success_at = Some(now);
            match state.status {
                CircuitStatus::HalfOpen => {
                    state.status = CircuitStatus::Closed;
                    state.failure_count = 0;
                    state.probe_started_at = None;
                }
                CircuitStatus::Closed => {
                    state.failure_count = state.failure_count.saturating_sub(1);
                }
                CircuitStatus::Open => {}
            }
        })
        .await
        .map(|(state, ())| state)
    }

    pub async fn record_failure(
        &self,
        service: &str,
        thresholds: CircuitThresholds,
    ) -> Result<CircuitState, EngineError> {
        let now = self.clock.now();
        let (state, opened) = self
            .mutate(service, |state| {
                let was = state.status;
                state.total_requests += 1;
                state.failure_count = state.failure_count.saturating_add(1);
                state.last_failure_at = Some(now);
                state.probe_started_at = None;

                if was == CircuitStatus::HalfOpen
                    || state.failure_count >= thresholds.failure_threshold
                {
                    state.status = CircuitStatus::Open;
                }
                was != CircuitStatus::Open && state.status == CircuitStatus::Open
            })
            .await?;

        if opened {
            warn!(
                service,
                failure_count = state.failure_count,
                threshold = thresholds.failure_threshold,
                "circuit breaker opened"
            );
        }
        Ok(state)
    }

    /// Drop stored state; the next call sees a fresh Closed circuit.
    pub async fn reset(&self, service: &str) -> Result<(), EngineError> {
        info!(service, "circuit breaker reset");
        self.cache.forget(&Self::key(service)).await
    }

    pub async fn force_open(&self, service: &str) -> Result<CircuitState, EngineError> {
        let now = self.clock.now();
        info!(service, "circuit breaker forced open");
        self.mutate(service, |state| {
            state.status = CircuitStatus::Open;
            state.failure_count = FORCED_OPEN_FAILURES;
            state.last_failure_at = Some(now);
            state.probe_started_at = None;
        })
        .await
        .map(|(state, ())| state)
    }

    pub async fn force_close(&self, service: &str) -> Result<CircuitState, EngineError> {
        info!(service, "circuit breaker forced closed");
        self.mutate(service, |state| {
            state.status = CircuitStatus::Closed;
            state.failure_count = 0;
            state.probe_started_at = None;
        })
        .await
        .map(|(state, ())| state)
    }

    // -----------------------------------------------------------------------
    // Internal: state access.
    // -----------------------------------------------------------------------

    async fn release_probe(&self, service: &str) -> Result<(), EngineError> {
        self.mutate(service, |state| {
            if state.status == CircuitStatus::HalfOpen {
                state.probe_started_at = None;
            }
        })
        .await
        .map(|_| ())
    }

    async fn admit(
        &self,
        service: &str,
        thresholds: CircuitThresholds,
    ) -> Result<Admission, EngineError> {
        let now = self.clock.now();
        let (_, admission) = self
            .mutate(service, |state| match state.status {
                CircuitStatus::Closed => Admission::Allowed,
                CircuitStatus::Open if state.recovery_due(now, thresholds.recovery_timeout) => {
                    state.status = CircuitStatus::HalfOpen;
                    state.probe_started_at = Some(now);
                    Admission::Probe
                }
                CircuitStatus::Open => Admission::Rejected,
                CircuitStatus::HalfOpen if state.probe_stale(now, thresholds.recovery_timeout) => {
                    state.probe_started_at = Some(now);
                    Admission::Probe
                }
                CircuitStatus::HalfOpen => Admission::Rejected,
            })
            .await?;
        Ok(admission)
    }

    async fn load(&self, service: &str) -> Result<(Option<Value>, CircuitState), EngineError> {
        let raw = self.cache.get(&Self::key(service)).await?;
        let state = match &raw {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!(service, error = %e, "corrupt circuit state, resetting");
                CircuitState::default()
            }),
            None => CircuitState::default(),
        };
        Ok((raw, state))
    }

    /// Read-modify-write with compare-and-swap, retried on contention.
    /// An unchanged state is not written back.
    async fn mutate<R>(
        &self,
        service: &str,
        mut apply: impl FnMut(&mut CircuitState) -> R,
    ) -> Result<(CircuitState, R), EngineError> {
        let key = Self::key(service);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, mut state) = self.load(service).await?;
            let before = state.clone();
            let outcome = apply(&mut state);

            if state == before {
                return Ok((state, outcome));
            }

            let encoded =
                serde_json::to_value(&state).map_err(|e| EngineError::Store(e.to_string()))?;
            if self
                .cache
                .compare_and_swap(&key, raw.as_ref(), encoded, self.state_ttl)
                .await?
            {
                return Ok((state, outcome));
            }
            debug!(service, "circuit state changed underneath us, retrying");
        }

        Err(EngineError::Store(format!(
            "circuit state for '{service}' too contended to update"
        )))
    }
}
