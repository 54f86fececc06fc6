//! Call UI state model.
//!
//! Defines the authoritative per-call state, the closed set of transition
//! triggers, and the static allow-list that decides which transitions are
//! legal.
//!
//! ```text
//! idle → initializing → detecting → detectionSucceeded → backgrounding → backgrounded → callKitActive
//!                                 ↘ detectionFailed → retrying → detecting | retryExhausted
//! callKitFailed → retrying | fallbackUIRequired → fallbackUIActive → fallbackUITransitioning → callKitActive
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::detection::AppForegroundState;

/// Opaque identifier for one call, shared by every engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallToken(String);

impl CallToken {
    /// Wrap an existing identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the token carries no identifier at all.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Case-insensitive comparison against a system call identifier.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Uuid> for CallToken {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Presentation state of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallUIState {
    Idle,
    Initializing,
    Detecting,
    DetectionSucceeded,
    DetectionFailed,
    Backgrounding,
    Backgrounded,
    BackgroundingFailed,
    #[serde(rename = "callkit_active")]
    CallKitActive,
    #[serde(rename = "callkit_pending")]
    CallKitPending,
    #[serde(rename = "callkit_failed")]
    CallKitFailed,
    #[serde(rename = "fallback_ui_required")]
    FallbackUIRequired,
    #[serde(rename = "fallback_ui_active")]
    FallbackUIActive,
    #[serde(rename = "fallback_ui_transitioning")]
    FallbackUITransitioning,
    Retrying,
    RetryExhausted,
    Completed,
    Terminated,
    Error,
}

impl CallUIState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 19] = [
        Self::Idle,
        Self::Initializing,
        Self::Detecting,
        Self::DetectionSucceeded,
        Self::DetectionFailed,
        Self::Backgrounding,
        Self::Backgrounded,
        Self::BackgroundingFailed,
        Self::CallKitActive,
        Self::CallKitPending,
        Self::CallKitFailed,
        Self::FallbackUIRequired,
        Self::FallbackUIActive,
        Self::FallbackUITransitioning,
        Self::Retrying,
        Self::RetryExhausted,
        Self::Completed,
        Self::Terminated,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Detecting => "detecting",
            Self::DetectionSucceeded => "detection_succeeded",
            Self::DetectionFailed => "detection_failed",
            Self::Backgrounding => "backgrounding",
            Self::Backgrounded => "backgrounded",
            Self::BackgroundingFailed => "backgrounding_failed",
            Self::CallKitActive => "callkit_active",
            Self::CallKitPending => "callkit_pending",
            Self::CallKitFailed => "callkit_failed",
            Self::FallbackUIRequired => "fallback_ui_required",
            Self::FallbackUIActive => "fallback_ui_active",
            Self::FallbackUITransitioning => "fallback_ui_transitioning",
            Self::Retrying => "retrying",
            Self::RetryExhausted => "retry_exhausted",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    /// False only for idle and the final lifecycle states.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            Self::Idle | Self::Completed | Self::Terminated | Self::Error
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Terminated | Self::Error | Self::RetryExhausted
        )
    }

    /// States in which the in-app call screen must be on screen.
    pub fn requires_ui(&self) -> bool {
        matches!(
            self,
            Self::FallbackUIRequired | Self::FallbackUIActive | Self::FallbackUITransitioning
        )
    }

    /// Whether entering this state counts as a failure for health scoring.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::DetectionFailed
                | Self::BackgroundingFailed
                | Self::CallKitFailed
                | Self::RetryExhausted
                | Self::Error
        )
    }

    /// Health-scoring weight: error is 10, idle is 1.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Error => 10,
            Self::RetryExhausted => 9,
            Self::CallKitFailed | Self::BackgroundingFailed => 8,
            Self::DetectionFailed | Self::FallbackUIRequired => 7,
            Self::Retrying | Self::FallbackUITransitioning => 6,
            Self::FallbackUIActive | Self::CallKitPending => 5,
            Self::Detecting | Self::Backgrounding => 4,
            Self::CallKitActive
            | Self::Backgrounded
            | Self::DetectionSucceeded
            | Self::Terminated => 3,
            Self::Initializing | Self::Completed => 2,
            Self::Idle => 1,
        }
    }

    /// Targets reachable from this state through the allow-list.
    pub fn valid_transitions(&self) -> Vec<Self> {
        if self.is_terminal() {
            return vec![Self::Idle];
        }
        match self {
            Self::Idle => vec![Self::Initializing],
            Self::Initializing => vec![Self::Detecting],
            Self::Detecting => vec![Self::DetectionSucceeded, Self::DetectionFailed],
            Self::DetectionSucceeded => vec![Self::Backgrounding],
            Self::Backgrounding => vec![Self::Backgrounded, Self::BackgroundingFailed],
            Self::Backgrounded => vec![Self::CallKitActive],
            Self::DetectionFailed | Self::BackgroundingFailed => vec![Self::Retrying],
            Self::CallKitFailed => vec![Self::Retrying, Self::FallbackUIRequired],
            Self::Retrying => vec![Self::Detecting, Self::RetryExhausted],
            Self::FallbackUIRequired => vec![Self::FallbackUIActive],
            Self::FallbackUIActive => vec![Self::FallbackUITransitioning],
            Self::FallbackUITransitioning => vec![Self::CallKitActive],
            _ => vec![],
        }
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for CallUIState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    UserAction,
    SystemEvent,
    DetectionResult,
    BackgroundingResult,
    RetryResult,
    #[serde(rename = "callkit_event")]
    CallKitEvent,
    TimeoutExpired,
    ErrorOccurred,
    ExternalCommand,
    HealthCheckResult,
}

impl TransitionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserAction => "user_action",
            Self::SystemEvent => "system_event",
            Self::DetectionResult => "detection_result",
            Self::BackgroundingResult => "backgrounding_result",
            Self::RetryResult => "retry_result",
            Self::CallKitEvent => "callkit_event",
            Self::TimeoutExpired => "timeout_expired",
            Self::ErrorOccurred => "error_occurred",
            Self::ExternalCommand => "external_command",
            Self::HealthCheckResult => "health_check_result",
        }
    }
}

impl fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking a transition against the allow-list and heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionValidation {
    pub is_valid: bool,
    /// Why the transition was rejected, when it was.
    pub reason: Option<String>,
    /// Non-fatal observations (no-op transitions, priority regressions).
    pub warnings: Vec<String>,
}

impl TransitionValidation {
    /// Validate `from → to`.
    pub fn evaluate(from: CallUIState, to: CallUIState) -> Self {
        let mut warnings = Vec::new();
        if from == to {
            warnings.push(format!("no-op transition: already in {from}"));
        }
        if to.priority() < from.priority() && !to.is_terminal() && to != CallUIState::Idle {
            warnings.push(format!(
                "priority regression: {from} ({}) to {to} ({})",
                from.priority(),
                to.priority()
            ));
        }

        if from.can_transition_to(to) {
            Self {
                is_valid: true,
                reason: None,
                warnings,
            }
        } else {
            Self {
                is_valid: false,
                reason: Some(format!("{from} cannot transition to {to}")),
                warnings,
            }
        }
    }

    /// Validation record for lifecycle exits that bypass the allow-list.
    pub fn lifecycle_exit() -> Self {
        Self {
            is_valid: true,
            reason: None,
            warnings: vec![],
        }
    }
}

/// One recorded transition, applied or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CallUIState,
    pub to: CallUIState,
    pub call_token: CallToken,
    pub timestamp: DateTime<Utc>,
    pub trigger: TransitionTrigger,
    pub validation: TransitionValidation,
}

impl StateTransition {
    pub fn new(
        call_token: CallToken,
        from: CallUIState,
        to: CallUIState,
        trigger: TransitionTrigger,
    ) -> Self {
        Self {
            from,
            to,
            call_token,
            timestamp: Utc::now(),
            trigger,
            validation: TransitionValidation::evaluate(from, to),
        }
    }
}

/// Platform state captured alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemContext {
    pub app_state: AppForegroundState,
    pub active_system_calls: usize,
}

/// Engine-level load captured alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceContext {
    pub active_calls: usize,
    pub resident_memory_bytes: Option<u64>,
}

/// State of one call at the moment a transition was applied.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: CallUIState,
    pub trigger: TransitionTrigger,
    pub timestamp: DateTime<Utc>,
    /// Monotonic capture time, used for stuck-state detection.
    #[serde(skip)]
    pub captured_at: tokio::time::Instant,
    pub system: SystemContext,
    pub performance: PerformanceContext,
}
