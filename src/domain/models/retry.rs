//! Retry strategy and operation types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::call_state::CallToken;
use super::config::RetryConfig;

/// Backoff strategy used to space retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    ExponentialBackoff,
    LinearBackoff,
    FixedInterval,
    Adaptive,
    /// Forced while the breaker is open: fails fast or probes with a long delay.
    CircuitBreaker,
}

impl RetryStrategy {
    /// Strategies eligible for adaptive selection, in tie-break order.
    pub const SELECTABLE: [Self; 5] = [
        Self::ExponentialBackoff,
        Self::Immediate,
        Self::LinearBackoff,
        Self::FixedInterval,
        Self::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::ExponentialBackoff => "exponential_backoff",
            Self::LinearBackoff => "linear_backoff",
            Self::FixedInterval => "fixed_interval",
            Self::Adaptive => "adaptive",
            Self::CircuitBreaker => "circuit_breaker",
        }
    }

    /// Delay before attempt `attempt` (1-indexed), before the max-delay cap
    /// and jitter are applied.
    pub fn base_delay(&self, attempt: u32, config: &RetryConfiguration) -> Duration {
        let initial = config.initial_delay.as_secs_f64();
        let n = f64::from(attempt.max(1));
        let secs = match self {
            Self::Immediate => 0.0,
            Self::ExponentialBackoff => initial * config.backoff_multiplier.powf(n - 1.0),
            Self::LinearBackoff => initial * n,
            Self::FixedInterval => initial,
            Self::Adaptive => {
                (initial * 1.2_f64.powf(n - 1.0)).min(config.max_delay.as_secs_f64())
            }
            Self::CircuitBreaker => initial * 2.0,
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Base delay capped at `max_delay` and scaled by `jitter`.
    pub fn delay(&self, attempt: u32, config: &RetryConfiguration, jitter: f64) -> Duration {
        let capped = self.base_delay(attempt, config).min(config.max_delay);
        capped.mul_f64(jitter.max(0.0))
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable parameters of one retry operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfiguration {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Inclusive multiplier range applied to every computed delay.
    pub jitter_range: (f64, f64),
    pub per_attempt_timeout: Duration,
    pub adaptive_enabled: bool,
}

impl RetryConfiguration {
    /// Same parameters without jitter, for deterministic schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_range = (1.0, 1.0);
        self
    }
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryConfiguration {
    fn from(settings: &RetryConfig) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter_range: (settings.jitter_min, settings.jitter_max),
            per_attempt_timeout: Duration::from_millis(settings.per_attempt_timeout_ms),
            adaptive_enabled: settings.adaptive_enabled,
        }
    }
}

/// Live retry bookkeeping for one call.
#[derive(Debug, Clone, Serialize)]
pub struct RetryOperation {
    pub call_token: CallToken,
    pub configuration: RetryConfiguration,
    pub start_time: DateTime<Utc>,
    pub current_attempt: u32,
    pub current_strategy: RetryStrategy,
    pub last_error: Option<String>,
    pub completed: bool,
}

impl RetryOperation {
    pub fn new(
        call_token: CallToken,
        configuration: RetryConfiguration,
        strategy: RetryStrategy,
    ) -> Self {
        Self {
            call_token,
            configuration,
            start_time: Utc::now(),
            current_attempt: 0,
            current_strategy: strategy,
            last_error: None,
            completed: false,
        }
    }
}

/// Recorded outcome of a finished retry operation.
#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub call_token: CallToken,
    pub success: bool,
    pub attempts: u32,
    pub strategy: RetryStrategy,
    pub total_duration: Duration,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// One success/failure sample for a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StrategyOutcome {
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Messages published by the retry orchestrator.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// An attempt is about to sleep its backoff delay.
    WillBegin {
        call_token: CallToken,
        attempt: u32,
        strategy: RetryStrategy,
        delay: Duration,
    },
    /// A single attempt failed; more may follow.
    AttemptFailed {
        call_token: CallToken,
        attempt: u32,
        error: String,
    },
    /// The re-detection succeeded.
    Completed(RetryResult),
    /// The budget or the breaker ended the operation.
    Exhausted(RetryResult),
}

impl RetryEvent {
    pub fn call_token(&self) -> &CallToken {
        match self {
            Self::WillBegin { call_token, .. } | Self::AttemptFailed { call_token, .. } => {
                call_token
            }
            Self::Completed(result) | Self::Exhausted(result) => &result.call_token,
        }
    }
}
