//! Circuit breaker for external adapter endpoints (§5, §7).
//!
//! Generalized from this codebase's OAuth-provider-keyed breaker: keyed by
//! endpoint name (`"text"`, `"image"`, `"audio"`) instead of
//! `OAuthProviderType`, and `execute` returns the same
//! `AppError::TransientExternalFailure` a blocked call would have produced
//! anyway, since this system has no separate "provider unavailable" error
//! kind (§7).
//!
//! ## State machine
//! - **Closed**: normal operation, all requests pass through
//! - **Open**: endpoint unavailable, requests fail immediately
//! - **HalfOpen**: testing recovery, allows one request per test interval
//!
//! ## Transitions
//! - Closed -> Open: after `failure_threshold` failures within `failure_window`
//! - Open -> HalfOpen: after `open_timeout` elapses
//! - HalfOpen -> Closed: after `half_open_success_threshold` successes
//! - HalfOpen -> Open: on any failure

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{IntGaugeVec, Opts, Registry};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub open_timeout: Duration,
    pub half_open_success_threshold: u32,
    pub half_open_test_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
            half_open_success_threshold: 3,
            half_open_test_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_timestamps: Vec<Instant>,
    opened_at: Option<Instant>,
    last_half_open_test: Option<Instant>,
    half_open_successes: u32,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_timestamps: Vec::new(),
            opened_at: None,
            last_half_open_test: None,
            half_open_successes: 0,
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerMetrics {
    state_gauge: IntGaugeVec,
}

impl CircuitBreakerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let state_gauge = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Current state of circuit breaker (0=closed, 1=open, 2=half_open)",
            )
            .namespace("infinitune")
            .subsystem("circuit_breaker"),
            &["endpoint"],
        )?;
        registry.register(Box::new(state_gauge.clone()))?;
        Ok(Self { state_gauge })
    }

    fn set_state(&self, endpoint: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.state_gauge.with_label_values(&[endpoint]).set(value);
    }
}

/// One breaker instance guards every endpoint it's asked about, keyed by name.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Arc<RwLock<HashMap<String, Circuit>>>,
    metrics: Option<CircuitBreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            config: CircuitBreakerConfig::default(),
            circuits: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, registry: &Registry) -> Result<Self, prometheus::Error> {
        self.metrics = Some(CircuitBreakerMetrics::new(registry)?);
        Ok(self)
    }

    pub async fn state(&self, endpoint: &str) -> CircuitState {
        let circuits = self.circuits.read().await;
        circuits.get(endpoint).map(|c| c.state).unwrap_or(CircuitState::Closed)
    }

    async fn can_proceed(&self, endpoint: &str) -> bool {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(endpoint.to_string()).or_default();
        let now = Instant::now();

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if let Some(opened_at) = circuit.opened_at {
                    if now.duration_since(opened_at) >= self.config.open_timeout {
                        info!(endpoint, "circuit breaker open -> half_open");
                        circuit.state = CircuitState::HalfOpen;
                        circuit.half_open_successes = 0;
                        circuit.last_half_open_test = Some(now);
                        if let Some(metrics) = &self.metrics {
                            metrics.set_state(endpoint, CircuitState::HalfOpen);
                        }
                        return true;
                    }
                }
                false
            }
            CircuitState::HalfOpen => {
                let should_allow = circuit
                    .last_half_open_test
                    .map_or(true, |last| now.duration_since(last) >= self.config.half_open_test_interval);
                if should_allow {
                    circuit.last_half_open_test = Some(now);
                }
                should_allow
            }
        }
    }

    async fn record_success(&self, endpoint: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(endpoint.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => circuit.failure_timestamps.clear(),
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.half_open_success_threshold {
                    info!(endpoint, "circuit breaker half_open -> closed");
                    circuit.state = CircuitState::Closed;
                    circuit.failure_timestamps.clear();
                    circuit.opened_at = None;
                    circuit.last_half_open_test = None;
                    circuit.half_open_successes = 0;
                    if let Some(metrics) = &self.metrics {
                        metrics.set_state(endpoint, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {
                circuit.state = CircuitState::Closed;
                circuit.failure_timestamps.clear();
                circuit.opened_at = None;
                if let Some(metrics) = &self.metrics {
                    metrics.set_state(endpoint, CircuitState::Closed);
                }
            }
        }
    }

    async fn record_failure(&self, endpoint: &str) {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.entry(endpoint.to_string()).or_default();
        let now = Instant::now();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_timestamps.push(now);
                let window = self.config.failure_window;
                circuit.failure_timestamps.retain(|&ts| now.duration_since(ts) < window);

                if circuit.failure_timestamps.len() >= self.config.failure_threshold as usize {
                    warn!(endpoint, failures = circuit.failure_timestamps.len(), "circuit breaker tripping open");
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(now);
                    if let Some(metrics) = &self.metrics {
                        metrics.set_state(endpoint, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                warn!(endpoint, "circuit breaker half_open -> open (test request failed)");
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(now);
                circuit.half_open_successes = 0;
                if let Some(metrics) = &self.metrics {
                    metrics.set_state(endpoint, CircuitState::Open);
                }
            }
            CircuitState::Open => {
                circuit.opened_at = Some(now);
            }
        }
    }

    /// Run `operation` guarded by `endpoint`'s circuit. A
    /// `PermanentExternalFailure` never counts against the circuit (it isn't
    /// a sign the endpoint is unreachable); only
    /// `TransientExternalFailure` does.
    pub async fn execute<F, Fut, T>(&self, endpoint: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.can_proceed(endpoint).await {
            return Err(AppError::TransientExternalFailure {
                endpoint: endpoint.to_string(),
                message: "circuit breaker open".to_string(),
            });
        }

        match operation().await {
            Ok(result) => {
                self.record_success(endpoint).await;
                Ok(result)
            }
            Err(err) => {
                if matches!(err, AppError::TransientExternalFailure { .. }) {
                    self.record_failure(endpoint).await;
                }
                Err(err)
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        });

        for _ in 0..2 {
            let result: Result<(), AppError> = breaker
                .execute("text", || async {
                    Err(AppError::TransientExternalFailure {
                        endpoint: "text".into(),
                        message: "timeout".into(),
                    })
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state("text").await, CircuitState::Open);

        let blocked: Result<(), AppError> = breaker.execute("text", || async { Ok(()) }).await;
        assert!(matches!(blocked, Err(AppError::TransientExternalFailure { .. })));
    }

    #[tokio::test]
    async fn permanent_failures_do_not_trip_the_circuit() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });

        let result: Result<(), AppError> = breaker
            .execute("image", || async {
                Err(AppError::PermanentExternalFailure {
                    endpoint: "image".into(),
                    message: "invalid prompt".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state("image").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(0),
            half_open_success_threshold: 2,
            half_open_test_interval: Duration::from_millis(0),
            ..CircuitBreakerConfig::default()
        });

        let _ = breaker
            .execute("audio", || async {
                Err::<(), AppError>(AppError::TransientExternalFailure {
                    endpoint: "audio".into(),
                    message: "down".into(),
                })
            })
            .await;
        assert_eq!(breaker.state("audio").await, CircuitState::Open);

        for _ in 0..2 {
            let result = breaker.execute("audio", || async { Ok::<(), AppError>(()) }).await;
            assert!(result.is_ok());
        }

        assert_eq!(breaker.state("audio").await, CircuitState::Closed);
    }
}
