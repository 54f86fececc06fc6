//! Native call UI detection types.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::call_state::CallToken;

/// Classification of native call UI presentation for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKitUIState {
    /// Not enough signal yet, keep polling.
    Unknown,
    /// The native UI owns the call.
    #[serde(rename = "callkit_active")]
    CallKitActive,
    /// The in-app UI owns the call.
    #[serde(rename = "app_ui_active")]
    AppUIActive,
    /// Presentation is still settling.
    Transitioning,
    /// The native UI did not take over.
    Failed,
    /// More than one system call is live.
    SystemBusy,
}

impl CallKitUIState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::CallKitActive => "callkit_active",
            Self::AppUIActive => "app_ui_active",
            Self::Transitioning => "transitioning",
            Self::Failed => "failed",
            Self::SystemBusy => "system_busy",
        }
    }

    /// Stable results end a detection session.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::CallKitActive | Self::AppUIActive | Self::Failed)
    }
}

/// Whether the app is currently on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppForegroundState {
    Active,
    Inactive,
    Background,
}

impl AppForegroundState {
    pub fn is_backgrounded(&self) -> bool {
        matches!(self, Self::Background)
    }
}

/// One system-level call as reported by the observation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCall {
    pub uuid: String,
    pub is_connected: bool,
    pub has_ended: bool,
    pub is_outgoing: bool,
}

impl SystemCall {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            is_connected: false,
            has_ended: false,
            is_outgoing: false,
        }
    }

    pub fn connected(mut self) -> Self {
        self.is_connected = true;
        self
    }

    pub fn outgoing(mut self) -> Self {
        self.is_outgoing = true;
        self
    }

    pub fn ended(mut self) -> Self {
        self.has_ended = true;
        self
    }
}

/// A single sample from the call-observation source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallObservation {
    pub app_state: AppForegroundState,
    pub calls: Vec<SystemCall>,
}

impl CallObservation {
    pub fn new(app_state: AppForegroundState, calls: Vec<SystemCall>) -> Self {
        Self { app_state, calls }
    }

    /// Calls that have not ended.
    pub fn live_calls(&self) -> impl Iterator<Item = &SystemCall> {
        self.calls.iter().filter(|c| !c.has_ended)
    }

    /// The live system call matching `token`, if any.
    pub fn find(&self, token: &CallToken) -> Option<&SystemCall> {
        self.live_calls().find(|c| token.matches(&c.uuid))
    }
}

/// Result of a detection tick or a finalized session.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub call_token: CallToken,
    pub final_state: CallKitUIState,
    pub duration: Duration,
    pub attempt_count: u32,
    pub system_call_count: usize,
    pub app_foreground_state: AppForegroundState,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl DetectionResult {
    pub fn is_stable(&self) -> bool {
        self.final_state.is_stable()
    }

    /// Whether the native UI was confirmed to own the call.
    pub fn is_success(&self) -> bool {
        self.final_state == CallKitUIState::CallKitActive
    }
}

/// Why a session stopped producing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionEnd {
    /// A stable classification was reached.
    Stable,
    /// The duration bound elapsed.
    TimedOut,
    /// The attempt bound was reached.
    AttemptsExhausted,
    /// Shed under memory pressure.
    Shed,
}

/// Messages published by the detection engine.
#[derive(Debug, Clone)]
pub enum DetectionEvent {
    /// Result of one polling tick.
    Tick(DetectionResult),
    /// The session is finished and its bookkeeping is gone.
    Finalized {
        result: DetectionResult,
        reason: DetectionEnd,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_states() {
        assert!(CallKitUIState::CallKitActive.is_stable());
        assert!(CallKitUIState::AppUIActive.is_stable());
        assert!(CallKitUIState::Failed.is_stable());
        assert!(!CallKitUIState::Unknown.is_stable());
        assert!(!CallKitUIState::Transitioning.is_stable());
        assert!(!CallKitUIState::SystemBusy.is_stable());
    }

    #[test]
    fn test_observation_find_skips_ended_calls() {
        let token = CallToken::new("call-1");
        let obs = CallObservation::new(
            AppForegroundState::Background,
            vec![SystemCall::new("CALL-1").ended(), SystemCall::new("call-2")],
        );
        assert!(obs.find(&token).is_none());
        assert_eq!(obs.live_calls().count(), 1);
    }
}
