//! Conflict-resolving state synchronizer.
//!
//! Ingests state reports from every source, stamps them with a process-wide
//! sequence number, and keeps one authoritative state per call. A report
//! that contradicts a recent report from another source is a conflict,
//! settled by source priority and then by recency.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::errors::SyncError;
use crate::domain::models::{
    CallToken, CallUIState, ConflictResolution, HealthTrend, SequenceNumber, StateSyncEvent,
    SyncApplied, SyncConfig, SyncConflict, SyncHealthMetrics, SyncSource,
};
use crate::domain::ports::{CallNotification, CallStateObserver};
use crate::services::notification_hub::{NotificationHub, ObserverId};

/// Decide between two contradictory events.
///
/// Different priorities: the higher one wins. Equal priorities: the later
/// timestamp wins, falling back to the later sequence number.
pub fn resolve_conflict(primary: &StateSyncEvent, conflicting: &StateSyncEvent) -> SyncConflict {
    let (resolution, winner, loser) = if primary.priority != conflicting.priority {
        if primary.priority > conflicting.priority {
            (ConflictResolution::PriorityBased, primary, conflicting)
        } else {
            (ConflictResolution::PriorityBased, conflicting, primary)
        }
    } else if (primary.timestamp, primary.sequence) >= (conflicting.timestamp, conflicting.sequence)
    {
        (ConflictResolution::Temporal, primary, conflicting)
    } else {
        (ConflictResolution::Temporal, conflicting, primary)
    };

    let reason = match resolution {
        ConflictResolution::PriorityBased => format!(
            "{resolution}: {} (priority {}) outranks {} (priority {}), applying {}",
            winner.source,
            winner.priority,
            loser.source,
            loser.priority,
            winner.to_state
        ),
        _ => format!(
            "{resolution}: {} reported {} after {} reported {}",
            winner.source, winner.to_state, loser.source, loser.to_state
        ),
    };

    SyncConflict {
        primary_event: primary.clone(),
        conflicting_event: conflicting.clone(),
        detected_at: Utc::now(),
        resolution,
        winner: winner.source,
        reason,
    }
}

/// What each presentation layer was last told about a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PresentationMirror {
    /// View pushed to the native call UI.
    pub native: Option<CallUIState>,
    /// View pushed to the in-app call UI.
    pub in_app: Option<CallUIState>,
}

impl PresentationMirror {
    /// Propagate a state to the layer(s) opposite its source.
    fn apply(&mut self, source: SyncSource, state: CallUIState) {
        match source {
            SyncSource::CallKit => self.in_app = Some(state),
            SyncSource::AppUi => self.native = Some(state),
            SyncSource::Backend | SyncSource::System | SyncSource::External => {
                self.native = Some(state);
                self.in_app = Some(state);
            }
        }
    }
}

#[derive(Default)]
struct SyncState {
    current: HashMap<CallToken, CallUIState>,
    mirrors: HashMap<CallToken, PresentationMirror>,
    recent: VecDeque<StateSyncEvent>,
    active_conflicts: HashMap<CallToken, SyncConflict>,
    conflict_history: VecDeque<SyncConflict>,
    metrics: SyncHealthMetrics,
    last_trend: Option<HealthTrend>,
    below_critical: bool,
}

impl SyncState {
    fn apply(&mut self, event: &StateSyncEvent) {
        self.current.insert(event.call_token.clone(), event.to_state);
        self.mirrors
            .entry(event.call_token.clone())
            .or_default()
            .apply(event.source, event.to_state);
    }

    fn record_conflict(&mut self, conflict: SyncConflict, capacity: usize) {
        self.active_conflicts
            .insert(conflict.call_token().clone(), conflict.clone());
        self.conflict_history.push_back(conflict);
        while self.conflict_history.len() > capacity {
            self.conflict_history.pop_front();
        }
    }

    /// Notifications owed after the metrics changed.
    fn health_changes(&mut self, critical_score: f64) -> Vec<CallNotification> {
        let mut out = Vec::new();
        let trend = self.metrics.trend();
        if self.last_trend.is_some_and(|last| last != trend) {
            out.push(CallNotification::HealthDidChange {
                metrics: self.metrics.clone(),
                trend,
            });
        }
        self.last_trend = Some(trend);

        let score = self.metrics.health_score();
        if score < critical_score && !self.below_critical {
            self.below_critical = true;
            out.push(CallNotification::DidEncounterCriticalError {
                message: format!(
                    "synchronizer health score {score:.2} below {critical_score:.2}"
                ),
            });
        } else if score >= critical_score {
            self.below_critical = false;
        }
        out
    }
}

/// Authoritative multi-source call state.
pub struct StateSynchronizer {
    config: SyncConfig,
    hub: Arc<NotificationHub>,
    state: Mutex<SyncState>,
    sequence: AtomicU64,
    applied: broadcast::Sender<SyncApplied>,
}

impl StateSynchronizer {
    pub fn new(config: SyncConfig, hub: Arc<NotificationHub>) -> Self {
        let (applied, _) = broadcast::channel(256);
        Self {
            config,
            hub,
            state: Mutex::new(SyncState::default()),
            sequence: AtomicU64::new(1),
            applied,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to applied states.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncApplied> {
        self.applied.subscribe()
    }

    /// Register an observer on the shared notification hub.
    pub async fn add_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: CallStateObserver + 'static,
    {
        self.hub.add_observer(observer).await
    }

    pub async fn remove_observer(&self, id: ObserverId) -> bool {
        self.hub.remove_observer(id).await
    }

    /// Ingest a state report.
    pub async fn sync_state(
        &self,
        source: SyncSource,
        call_token: &CallToken,
        from_state: Option<CallUIState>,
        to_state: CallUIState,
        metadata: HashMap<String, String>,
    ) -> Result<StateSyncEvent, SyncError> {
        self.ingest(source, call_token, from_state, to_state, metadata, true)
            .await
    }

    /// Record a state its source has already applied.
    ///
    /// The event becomes authoritative and joins the recent window, so later
    /// reports from other sources are still checked against it, but it is
    /// never itself a conflict candidate.
    pub async fn record_applied(
        &self,
        source: SyncSource,
        call_token: &CallToken,
        from_state: Option<CallUIState>,
        to_state: CallUIState,
        metadata: HashMap<String, String>,
    ) -> Result<StateSyncEvent, SyncError> {
        self.ingest(source, call_token, from_state, to_state, metadata, false)
            .await
    }

    async fn ingest(
        &self,
        source: SyncSource,
        call_token: &CallToken,
        from_state: Option<CallUIState>,
        to_state: CallUIState,
        metadata: HashMap<String, String>,
        detect_conflicts: bool,
    ) -> Result<StateSyncEvent, SyncError> {
        let started = Instant::now();

        if call_token.is_empty() {
            let health = {
                let mut state = self.state.lock().await;
                state.metrics.total_syncs += 1;
                state.metrics.failed_syncs += 1;
                state.metrics.last_updated = Utc::now();
                state.health_changes(self.config.critical_health_score)
            };
            tracing::warn!(source = %source, "Rejected sync with empty call token");
            for notification in health {
                self.hub.publish(notification);
            }
            return Err(SyncError::InvalidCallToken);
        }

        let event = StateSyncEvent {
            id: Uuid::new_v4(),
            source,
            priority: self.config.priority_of(source),
            call_token: call_token.clone(),
            from_state,
            to_state,
            timestamp: Utc::now(),
            sequence: SequenceNumber(self.sequence.fetch_add(1, Ordering::SeqCst)),
            metadata,
        };

        let (conflict, winning, health) = {
            let mut state = self.state.lock().await;

            let window = self.config.conflict_window();
            let conflicting = if detect_conflicts {
                state
                    .recent
                    .iter()
                    .rev()
                    .find(|recent| event.conflicts_with(recent, window))
                    .cloned()
            } else {
                None
            };

            state.recent.push_back(event.clone());
            while state.recent.len() > self.config.recent_event_capacity {
                state.recent.pop_front();
            }

            let conflict = conflicting.map(|other| resolve_conflict(&event, &other));
            let winning = match &conflict {
                Some(conflict) => {
                    state.metrics.conflicts_detected += 1;
                    let winning = conflict.winning_event().clone();
                    state.apply(&winning);
                    state.metrics.conflicts_resolved += 1;
                    state.record_conflict(conflict.clone(), self.config.conflict_history_capacity);
                    winning
                }
                None => {
                    state.apply(&event);
                    state.active_conflicts.remove(call_token);
                    event.clone()
                }
            };

            state.metrics.total_syncs += 1;
            state.metrics.successful_syncs += 1;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            state
                .metrics
                .record_latency(latency_ms, self.config.latency_smoothing);
            state.metrics.last_updated = Utc::now();

            let health = state.health_changes(self.config.critical_health_score);
            (conflict, winning, health)
        };

        tracing::debug!(
            call_token = %call_token,
            source = %source,
            to_state = %to_state,
            sequence = %event.sequence,
            conflict = conflict.is_some(),
            "State synced"
        );

        self.hub.publish(CallNotification::DidSync(event.clone()));
        if let Some(conflict) = &conflict {
            tracing::info!(
                call_token = %call_token,
                resolution = %conflict.resolution,
                winner = %conflict.winner,
                reason = %conflict.reason,
                "Sync conflict resolved"
            );
            self.hub
                .publish(CallNotification::DidDetectConflict(conflict.clone()));
            self.hub
                .publish(CallNotification::DidResolveConflict(conflict.clone()));
        }
        for notification in health {
            self.hub.publish(notification);
        }
        let _ = self.applied.send(SyncApplied {
            event: winning,
            conflict,
        });

        Ok(event)
    }

    /// Authoritative state of a call.
    pub async fn get_current_state(&self, call_token: &CallToken) -> Option<CallUIState> {
        self.state.lock().await.current.get(call_token).copied()
    }

    pub async fn get_presentation(&self, call_token: &CallToken) -> Option<PresentationMirror> {
        self.state.lock().await.mirrors.get(call_token).copied()
    }

    /// Up to `limit` most recent events, oldest first.
    pub async fn get_recent_events(&self, limit: usize) -> Vec<StateSyncEvent> {
        let state = self.state.lock().await;
        let skip = state.recent.len().saturating_sub(limit);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Conflicts not yet superseded by a clean report or a forced resolution.
    pub async fn get_current_conflicts(&self) -> Vec<SyncConflict> {
        let mut conflicts: Vec<SyncConflict> = self
            .state
            .lock()
            .await
            .active_conflicts
            .values()
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.primary_event.sequence);
        conflicts
    }

    /// Up to `limit` most recent conflicts, newest first.
    pub async fn conflict_history(&self, limit: usize) -> Vec<SyncConflict> {
        self.state
            .lock()
            .await
            .conflict_history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Override the automatic pick for a call, declaring `winning_source`'s
    /// latest report authoritative.
    pub async fn force_conflict_resolution(
        &self,
        call_token: &CallToken,
        winning_source: SyncSource,
    ) -> Result<SyncConflict, SyncError> {
        let conflict = {
            let mut state = self.state.lock().await;
            let winner = state
                .recent
                .iter()
                .rev()
                .find(|e| &e.call_token == call_token && e.source == winning_source)
                .cloned()
                .ok_or_else(|| SyncError::NoEventFromSource {
                    call_token: call_token.clone(),
                    sync_source: winning_source,
                })?;

            let loser = match state.active_conflicts.remove(call_token) {
                Some(active) if active.primary_event.source == winning_source => {
                    active.conflicting_event
                }
                Some(active) => active.primary_event,
                None => state
                    .recent
                    .iter()
                    .rev()
                    .find(|e| &e.call_token == call_token && e.source != winning_source)
                    .cloned()
                    .unwrap_or_else(|| winner.clone()),
            };

            let conflict = SyncConflict {
                reason: format!(
                    "{}: {} forced as winner, applying {}",
                    ConflictResolution::UserChoice,
                    winning_source,
                    winner.to_state
                ),
                primary_event: winner.clone(),
                conflicting_event: loser,
                detected_at: Utc::now(),
                resolution: ConflictResolution::UserChoice,
                winner: winning_source,
            };

            state.apply(&winner);
            state.conflict_history.push_back(conflict.clone());
            while state.conflict_history.len() > self.config.conflict_history_capacity {
                state.conflict_history.pop_front();
            }
            conflict
        };

        tracing::info!(
            call_token = %call_token,
            winner = %winning_source,
            state = %conflict.primary_event.to_state,
            "Forced conflict resolution"
        );
        self.hub
            .publish(CallNotification::DidResolveConflict(conflict.clone()));
        let _ = self.applied.send(SyncApplied {
            event: conflict.primary_event.clone(),
            conflict: Some(conflict.clone()),
        });
        Ok(conflict)
    }

    pub async fn metrics(&self) -> SyncHealthMetrics {
        self.state.lock().await.metrics.clone()
    }

    pub async fn health_score(&self) -> f64 {
        self.state.lock().await.metrics.health_score()
    }

    /// Forget a finished call. Recorded events and conflict history stay.
    pub async fn clear_call(&self, call_token: &CallToken) {
        let mut state = self.state.lock().await;
        state.current.remove(call_token);
        state.mirrors.remove(call_token);
        state.active_conflicts.remove(call_token);
    }

    /// Spawn the periodic metrics report.
    pub fn start_metrics_task(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let synchronizer = Arc::clone(self);
        let period = Duration::from_secs(self.config.metrics_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Skip first tick (fires immediately)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let metrics = synchronizer.metrics().await;
                        let trend = metrics.trend();
                        tracing::debug!(
                            total = metrics.total_syncs,
                            conflicts = metrics.conflicts_detected,
                            score = metrics.health_score(),
                            trend = ?trend,
                            "Synchronizer metrics"
                        );
                        synchronizer
                            .hub
                            .publish(CallNotification::HealthDidChange { metrics, trend });
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Synchronizer metrics task stopped");
                        break;
                    }
                }
            }
        })
    }
}
