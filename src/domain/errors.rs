//! Domain errors for the callsync engines.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{CallToken, CallUIState, SyncSource};

/// Errors reported by the detection engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("Invalid call UUID: token is empty")]
    InvalidCallUuid,

    #[error("Concurrent detection limit reached ({limit} calls already monitored)")]
    ConcurrentDetectionLimit { limit: usize },

    #[error("Call {0} is already being monitored")]
    AlreadyMonitoring(CallToken),

    #[error("Detection for call {call_token} timed out after {elapsed:?}")]
    DetectionTimeout {
        call_token: CallToken,
        elapsed: Duration,
    },

    #[error("Detection refused under memory pressure")]
    MemoryPressure,
}

/// Errors reported by the retry orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("Retry already active for call {0}")]
    AlreadyActive(CallToken),

    #[error("Concurrent retry limit reached ({limit} operations active)")]
    ConcurrentRetryLimit { limit: usize },

    #[error("Resource exhaustion: {reason}")]
    ResourceExhausted { reason: String },

    #[error("Exceeded maximum retry attempts ({attempts})")]
    MaxAttemptsExceeded { attempts: u32 },

    #[error("Circuit breaker open, retry after {retry_after}")]
    CircuitBreakerOpen { retry_after: DateTime<Utc> },

    #[error("Retry attempt timed out after {timeout:?}")]
    AttemptTimeout { timeout: Duration },

    #[error("Retry attempt failed: {0}")]
    AttemptFailed(String),

    #[error("Retry cancelled")]
    Cancelled,
}

impl RetryError {
    /// Whether the error ends the current cycle for good ("give up for now").
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::MaxAttemptsExceeded { .. } | Self::CircuitBreakerOpen { .. }
        )
    }

    /// Errors rejected before any worker loop started.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AlreadyActive(_) | Self::ConcurrentRetryLimit { .. } | Self::ResourceExhausted { .. }
        )
    }
}

/// Errors reported by the state synchronizer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Invalid call token: token is empty")]
    InvalidCallToken,

    #[error("No recent event from {sync_source} for call {call_token}")]
    NoEventFromSource {
        call_token: CallToken,
        sync_source: SyncSource,
    },
}

/// Errors reported by the call UI state machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: CallUIState,
        to: CallUIState,
        reason: String,
    },

    #[error("Call not found: {0}")]
    UnknownCall(CallToken),

    #[error("Call {0} is already active")]
    CallAlreadyActive(CallToken),

    #[error("Invalid call token: token is empty")]
    InvalidCallToken,
}
