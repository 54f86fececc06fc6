//! Circuit breaker guarding retry attempts.
//!
//! Opens after a run of consecutive failures. Once the cooldown since the
//! last failure has elapsed the breaker moves to half-open and admits exactly
//! one probe; the probe's outcome closes or reopens it. A success from any
//! operation closes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::domain::models::CircuitBreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts flow normally.
    Closed,
    /// Attempts are blocked.
    Open,
    /// One probe attempt is testing recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker bookkeeping.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Monotonic time of the last failure, drives the cooldown.
    pub last_failure: Option<Instant>,
    /// Wall-clock time of the last failure, for reporting.
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    /// Whether the single half-open probe slot is taken.
    pub probe_in_flight: bool,
    /// Total times the breaker opened.
    pub open_count: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            opened_at: None,
            state_changed_at: Utc::now(),
            probe_in_flight: false,
            open_count: 0,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, config: &CircuitBreakerConfig) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());

        match self.state {
            // A failed probe reopens immediately
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.open();
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Record a successful attempt from any operation.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state != CircuitState::Closed {
            self.close();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.state_changed_at = Utc::now();
        self.probe_in_flight = false;
        self.open_count += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.state_changed_at = Utc::now();
        self.probe_in_flight = false;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.state_changed_at = Utc::now();
    }

    fn cooldown_elapsed(&self, config: &CircuitBreakerConfig) -> bool {
        self.last_failure
            .is_none_or(|at| at.elapsed() >= config.cooldown())
    }

    /// When the breaker is expected to admit a probe.
    pub fn retry_after(&self, config: &CircuitBreakerConfig) -> DateTime<Utc> {
        let cooldown = chrono::Duration::from_std(config.cooldown()).unwrap_or_default();
        self.last_failure_at.unwrap_or_else(Utc::now) + cooldown
    }

    /// Check whether an attempt may proceed, claiming the probe slot when
    /// the cooldown has elapsed.
    pub fn check(&mut self, config: &CircuitBreakerConfig) -> CircuitCheckResult {
        match self.state {
            CircuitState::Closed => CircuitCheckResult::Allowed,
            CircuitState::Open if self.cooldown_elapsed(config) => {
                self.half_open();
                self.probe_in_flight = true;
                CircuitCheckResult::Testing
            }
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                CircuitCheckResult::Testing
            }
            CircuitState::Open | CircuitState::HalfOpen => CircuitCheckResult::Blocked {
                opened_at: self.opened_at.unwrap_or_else(Utc::now),
                retry_after: self.retry_after(config),
            },
        }
    }

    /// Manually reset the breaker.
    pub fn reset(&mut self) {
        self.close();
        self.consecutive_failures = 0;
        self.open_count = 0;
    }
}

/// Result of a circuit breaker check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitCheckResult {
    /// Attempt is allowed.
    Allowed,
    /// Attempt is blocked by an open breaker.
    Blocked {
        opened_at: DateTime<Utc>,
        retry_after: DateTime<Utc>,
    },
    /// Attempt is the half-open probe.
    Testing,
}

impl CircuitCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed | Self::Testing)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
}

/// Shared breaker used by every retry operation.
pub struct CircuitBreakerService {
    config: CircuitBreakerConfig,
    circuit: RwLock<CircuitBreaker>,
}

impl CircuitBreakerService {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuit: RwLock::new(CircuitBreaker::new()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Check if an attempt is allowed.
    pub async fn check(&self) -> CircuitCheckResult {
        if !self.config.enabled {
            return CircuitCheckResult::Allowed;
        }
        let result = self.circuit.write().await.check(&self.config);
        if result == CircuitCheckResult::Testing {
            tracing::info!("Circuit breaker half-open, admitting probe");
        }
        result
    }

    pub async fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut circuit = self.circuit.write().await;
        let was_open = circuit.state == CircuitState::Open;
        circuit.record_failure(&self.config);
        if !was_open && circuit.state == CircuitState::Open {
            tracing::warn!(
                consecutive_failures = circuit.consecutive_failures,
                open_count = circuit.open_count,
                "Circuit breaker opened"
            );
        }
    }

    pub async fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut circuit = self.circuit.write().await;
        if circuit.state != CircuitState::Closed {
            tracing::info!(from = %circuit.state, "Circuit breaker closed");
        }
        circuit.record_success();
    }

    /// Give back an unused probe slot (the probe was cancelled).
    pub async fn release_probe(&self) {
        let mut circuit = self.circuit.write().await;
        if circuit.state == CircuitState::HalfOpen {
            circuit.probe_in_flight = false;
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.circuit.read().await.state
    }

    /// Whether new operations should use the circuit-breaker strategy.
    pub async fn is_open(&self) -> bool {
        self.config.enabled && self.state().await != CircuitState::Closed
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.circuit.read().await.consecutive_failures
    }

    pub async fn stats(&self) -> CircuitStats {
        let c = self.circuit.read().await;
        CircuitStats {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            open_count: c.open_count,
            opened_at: c.opened_at,
            state_changed_at: c.state_changed_at,
        }
    }

    pub async fn reset(&self) {
        self.circuit.write().await.reset();
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
