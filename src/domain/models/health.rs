//! Self-diagnosis output of the call state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::call_state::{CallToken, CallUIState};

/// Urgency of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// What a recommendation is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationCategory {
    ErrorRate,
    StuckState,
    TransitionLoop,
    Capacity,
    OverallHealth,
}

/// An actionable suggestion produced by health analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub priority: RecommendationPriority,
    pub category: RecommendationCategory,
    pub message: String,
    pub call_token: Option<CallToken>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Recommendation {
    pub fn new(
        priority: RecommendationPriority,
        category: RecommendationCategory,
        message: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            id: Uuid::new_v4(),
            priority,
            category,
            message: message.into(),
            call_token: None,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn for_call(mut self, token: CallToken) -> Self {
        self.call_token = Some(token);
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// A non-terminal call whose latest snapshot is older than the stuck timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckCall {
    pub call_token: CallToken,
    pub state: CallUIState,
    pub stuck_for: Duration,
}

/// A state that keeps recurring in a call's recent snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLoop {
    pub call_token: CallToken,
    pub state: CallUIState,
    pub occurrences: usize,
}

/// Result of one health analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: f64,
    pub active_calls: usize,
    pub error_rate: f64,
    pub stuck_calls: Vec<StuckCall>,
    pub loops: Vec<TransitionLoop>,
    pub recommendations: Vec<Recommendation>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.score >= 0.8 && self.stuck_calls.is_empty() && self.loops.is_empty()
    }
}
