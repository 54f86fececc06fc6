//! Multi-source state synchronization types.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::call_state::{CallToken, CallUIState};

/// Origin of a reported state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    /// The native call UI.
    #[serde(rename = "callkit")]
    CallKit,
    /// The in-app call UI (and the state machine acting for it).
    AppUi,
    Backend,
    System,
    External,
}

impl SyncSource {
    pub const ALL: [Self; 5] = [
        Self::CallKit,
        Self::AppUi,
        Self::Backend,
        Self::System,
        Self::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallKit => "callkit",
            Self::AppUi => "app_ui",
            Self::Backend => "backend",
            Self::System => "system",
            Self::External => "external",
        }
    }

    /// Fixed default priority; higher wins a conflict.
    pub fn default_priority(&self) -> u32 {
        match self {
            Self::CallKit => 100,
            Self::AppUi => 80,
            Self::Backend => 60,
            Self::System => 40,
            Self::External => 20,
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide ordering key for sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One reported state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncEvent {
    pub id: Uuid,
    pub source: SyncSource,
    /// Priority of `source` at the time the event was recorded.
    pub priority: u32,
    pub call_token: CallToken,
    pub from_state: Option<CallUIState>,
    pub to_state: CallUIState,
    pub timestamp: DateTime<Utc>,
    pub sequence: SequenceNumber,
    pub metadata: HashMap<String, String>,
}

impl StateSyncEvent {
    /// Whether `other` contradicts this event inside `window`.
    pub fn conflicts_with(&self, other: &Self, window: chrono::Duration) -> bool {
        self.call_token == other.call_token
            && self.source != other.source
            && self.to_state != other.to_state
            && (self.timestamp - other.timestamp).abs() <= window
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    PriorityBased,
    Temporal,
    Merge,
    Rollback,
    UserChoice,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriorityBased => "priority_based",
            Self::Temporal => "temporal",
            Self::Merge => "merge",
            Self::Rollback => "rollback",
            Self::UserChoice => "user_choice",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two contradictory events and the decision taken between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// The incoming event that triggered detection.
    pub primary_event: StateSyncEvent,
    /// The earlier recorded event it contradicts.
    pub conflicting_event: StateSyncEvent,
    pub detected_at: DateTime<Utc>,
    pub resolution: ConflictResolution,
    pub winner: SyncSource,
    pub reason: String,
}

impl SyncConflict {
    pub fn call_token(&self) -> &CallToken {
        &self.primary_event.call_token
    }

    /// The event whose target state was applied.
    pub fn winning_event(&self) -> &StateSyncEvent {
        if self.primary_event.source == self.winner {
            &self.primary_event
        } else {
            &self.conflicting_event
        }
    }
}

/// Published whenever the synchronizer applies a state to a call.
#[derive(Debug, Clone)]
pub struct SyncApplied {
    /// The event whose target state is now authoritative.
    pub event: StateSyncEvent,
    /// Set when the state was decided by resolving a conflict.
    pub conflict: Option<SyncConflict>,
}

/// Overall direction of synchronizer health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTrend {
    Stable,
    Degrading,
    Critical,
}

impl HealthTrend {
    /// Classify from the two component rates.
    pub fn classify(success_rate: f64, conflict_resolution_rate: f64) -> Self {
        if success_rate >= 0.95 && conflict_resolution_rate >= 0.9 {
            Self::Stable
        } else if success_rate >= 0.8 && conflict_resolution_rate >= 0.7 {
            Self::Degrading
        } else {
            Self::Critical
        }
    }
}

/// Running synchronizer health aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHealthMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    /// Exponential running average, milliseconds.
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for SyncHealthMetrics {
    fn default() -> Self {
        Self {
            total_syncs: 0,
            successful_syncs: 0,
            failed_syncs: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            average_latency_ms: 0.0,
            max_latency_ms: 0.0,
            last_updated: Utc::now(),
        }
    }
}

impl SyncHealthMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            1.0
        } else {
            self.successful_syncs as f64 / self.total_syncs as f64
        }
    }

    pub fn conflict_resolution_rate(&self) -> f64 {
        if self.conflicts_detected == 0 {
            1.0
        } else {
            (self.conflicts_resolved as f64 / self.conflicts_detected as f64).min(1.0)
        }
    }

    /// `0.7 * success + 0.3 * conflict resolution`.
    pub fn health_score(&self) -> f64 {
        0.7 * self.success_rate() + 0.3 * self.conflict_resolution_rate()
    }

    pub fn trend(&self) -> HealthTrend {
        HealthTrend::classify(self.success_rate(), self.conflict_resolution_rate())
    }

    /// Fold one latency sample into the running average.
    pub fn record_latency(&mut self, latency_ms: f64, smoothing: f64) {
        if self.total_syncs <= 1 {
            self.average_latency_ms = latency_ms;
        } else {
            self.average_latency_ms =
                smoothing.mul_add(latency_ms, (1.0 - smoothing) * self.average_latency_ms);
        }
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }
}
