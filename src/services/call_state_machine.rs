//! Call UI state machine.
//!
//! Owns the authoritative per-call [`CallUIState`], validates every
//! transition against the allow-list, records snapshots and a global
//! transition log, and drives the other engines: entering `detecting` starts
//! detection, entering `retrying` starts a retry, and their results come back
//! as transitions.
//!
//! All transitions run under one lock, so two transitions for the same call
//! are never applied concurrently. Platform context is read before the lock is
//! taken and side effects run after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{DetectionError, StateMachineError};
use crate::domain::models::{
    AppForegroundState, CallToken, CallUIState, DetectionEvent, HealthReport,
    PerformanceContext, RecommendationCategory, RetryEvent, StateMachineConfig, StateSnapshot,
    StateTransition, SyncApplied, SyncSource, SystemContext, TransitionTrigger,
    TransitionValidation,
};
use crate::domain::ports::{CallNotification, CallObservationSource, MemoryProbe};
use crate::services::detection_engine::DetectionEngine;
use crate::services::notification_hub::NotificationHub;
use crate::services::retry_orchestrator::RetryOrchestrator;
use crate::services::state_health::{self, HealthInputs};
use crate::services::state_synchronizer::StateSynchronizer;

type Metadata = HashMap<String, String>;

/// How a transition is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Must be on the allow-list.
    Checked,
    /// Completion or failure: allowed from any non-terminal state.
    LifecycleExit,
    /// Allow-listed or a lifecycle exit. Anything else is skipped without
    /// being recorded as rejected.
    IfReachable,
}

fn is_lifecycle_exit(state: CallUIState) -> bool {
    matches!(
        state,
        CallUIState::Completed | CallUIState::Terminated | CallUIState::Error
    )
}

/// Platform context read for a snapshot.
struct Captured {
    system: SystemContext,
    resident_memory_bytes: Option<u64>,
}

impl Captured {
    fn snapshot(&self, state: CallUIState, trigger: TransitionTrigger, active_calls: usize) -> StateSnapshot {
        StateSnapshot {
            state,
            trigger,
            timestamp: Utc::now(),
            captured_at: Instant::now(),
            system: self.system.clone(),
            performance: PerformanceContext {
                active_calls,
                resident_memory_bytes: self.resident_memory_bytes,
            },
        }
    }
}

#[derive(Default)]
struct MachineState {
    active: HashMap<CallToken, CallUIState>,
    snapshots: HashMap<CallToken, VecDeque<StateSnapshot>>,
    log: VecDeque<StateTransition>,
    rejected: VecDeque<StateTransition>,
}

impl MachineState {
    /// Current state, including finished calls still holding history.
    fn current(&self, call_token: &CallToken) -> Option<CallUIState> {
        self.active.get(call_token).copied().or_else(|| {
            self.snapshots
                .get(call_token)
                .and_then(|history| history.back())
                .map(|snapshot| snapshot.state)
        })
    }
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    queue.push_back(item);
    while queue.len() > capacity {
        queue.pop_front();
    }
}

/// Authoritative call UI state and orchestration hub.
pub struct CallUiStateMachine {
    config: StateMachineConfig,
    hub: Arc<NotificationHub>,
    synchronizer: Arc<StateSynchronizer>,
    detection: Option<Arc<DetectionEngine>>,
    retry: Option<Arc<RetryOrchestrator>>,
    source: Option<Arc<dyn CallObservationSource>>,
    memory: Arc<dyn MemoryProbe>,
    state: Mutex<MachineState>,
    /// Expiry of the last emitted recommendation per (category, call).
    emitted: Mutex<HashMap<(RecommendationCategory, Option<CallToken>), DateTime<Utc>>>,
    /// Calls that entered `backgrounding`, drained by the deadline task.
    backgrounding_tx: mpsc::UnboundedSender<CallToken>,
    backgrounding_rx: Mutex<Option<mpsc::UnboundedReceiver<CallToken>>>,
}

impl CallUiStateMachine {
    pub fn new(
        config: StateMachineConfig,
        hub: Arc<NotificationHub>,
        synchronizer: Arc<StateSynchronizer>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let (backgrounding_tx, backgrounding_rx) = mpsc::unbounded_channel();
        Self {
            config,
            hub,
            synchronizer,
            detection: None,
            retry: None,
            source: None,
            memory,
            state: Mutex::new(MachineState::default()),
            emitted: Mutex::new(HashMap::new()),
            backgrounding_tx,
            backgrounding_rx: Mutex::new(Some(backgrounding_rx)),
        }
    }

    /// Start detection when calls enter `detecting`.
    pub fn with_detection(mut self, detection: Arc<DetectionEngine>) -> Self {
        self.detection = Some(detection);
        self
    }

    /// Start retries when calls enter `retrying`.
    pub fn with_retry(mut self, retry: Arc<RetryOrchestrator>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Capture platform context in snapshots and complete backgrounding.
    pub fn with_observation_source(mut self, source: Arc<dyn CallObservationSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Read the observation source and process memory. Never called with
    /// the state lock held.
    fn capture(&self) -> Captured {
        let system = match &self.source {
            Some(source) => {
                let observation = source.observe();
                SystemContext {
                    app_state: observation.app_state,
                    active_system_calls: observation.live_calls().count(),
                }
            }
            None => SystemContext {
                app_state: AppForegroundState::Active,
                active_system_calls: 0,
            },
        };
        Captured {
            system,
            resident_memory_bytes: self.memory.resident_memory_bytes(),
        }
    }

    /// Record an applied transition. Caller holds the lock.
    fn apply_locked(&self, state: &mut MachineState, transition: &StateTransition, captured: &Captured) {
        if transition.to.is_terminal() {
            state.active.remove(&transition.call_token);
        } else {
            state
                .active
                .insert(transition.call_token.clone(), transition.to);
        }
        let snapshot = captured.snapshot(transition.to, transition.trigger, state.active.len());
        push_capped(
            state
                .snapshots
                .entry(transition.call_token.clone())
                .or_default(),
            snapshot,
            self.config.snapshot_history_capacity,
        );
        push_capped(
            &mut state.log,
            transition.clone(),
            self.config.transition_log_capacity,
        );
    }

    fn reject_locked(
        &self,
        state: &mut MachineState,
        mut transition: StateTransition,
        reason: String,
    ) -> StateMachineError {
        transition.validation.is_valid = false;
        transition.validation.reason = Some(reason.clone());
        warn!(
            call_token = %transition.call_token,
            from = %transition.from,
            to = %transition.to,
            trigger = %transition.trigger,
            reason = %reason,
            "Rejected state transition"
        );
        let err = StateMachineError::InvalidTransition {
            from: transition.from,
            to: transition.to,
            reason,
        };
        push_capped(
            &mut state.rejected,
            transition,
            self.config.transition_log_capacity,
        );
        err
    }

    async fn commit(
        &self,
        call_token: &CallToken,
        to: CallUIState,
        trigger: TransitionTrigger,
        mode: Mode,
    ) -> Result<StateTransition, StateMachineError> {
        let captured = self.capture();
        let mut state = self.state.lock().await;
        let from = state
            .current(call_token)
            .ok_or_else(|| StateMachineError::UnknownCall(call_token.clone()))?;

        let mut transition = StateTransition::new(call_token.clone(), from, to, trigger);
        match mode {
            Mode::Checked => {
                if !transition.validation.is_valid {
                    let reason = transition
                        .validation
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{from} cannot transition to {to}"));
                    return Err(self.reject_locked(&mut state, transition, reason));
                }
            }
            Mode::LifecycleExit => {
                if from.is_terminal() {
                    let reason = format!("call already finished in {from}");
                    return Err(self.reject_locked(&mut state, transition, reason));
                }
                transition.validation = TransitionValidation::lifecycle_exit();
            }
            Mode::IfReachable => {
                if is_lifecycle_exit(to) && !from.is_terminal() {
                    transition.validation = TransitionValidation::lifecycle_exit();
                } else if !transition.validation.is_valid {
                    return Err(StateMachineError::InvalidTransition {
                        from,
                        to,
                        reason: format!("{to} is not reachable from {from}"),
                    });
                }
            }
        }

        for warning in &transition.validation.warnings {
            debug!(call_token = %call_token, warning = %warning, "Transition warning");
        }
        self.apply_locked(&mut state, &transition, &captured);
        Ok(transition)
    }

    /// Notify, sync, and start whatever the new state asks for. Returns the
    /// transition to chain next, if any.
    async fn after_transition(
        &self,
        transition: &StateTransition,
        metadata: &Metadata,
    ) -> Option<(CallUIState, TransitionTrigger)> {
        let call_token = &transition.call_token;
        info!(
            call_token = %call_token,
            from = %transition.from,
            to = %transition.to,
            trigger = %transition.trigger,
            "State transition"
        );

        self.hub.publish(CallNotification::DidTransition {
            call_token: call_token.clone(),
            from: transition.from,
            to: transition.to,
            trigger: transition.trigger,
        });

        if let Err(e) = self
            .synchronizer
            .record_applied(
                SyncSource::AppUi,
                call_token,
                Some(transition.from),
                transition.to,
                metadata.clone(),
            )
            .await
        {
            warn!(call_token = %call_token, error = %e, "Failed to sync transition");
        }

        match transition.to {
            CallUIState::Detecting => {
                let detection = self.detection.as_ref()?;
                match detection.start_detection(call_token, metadata.clone()).await {
                    Ok(()) | Err(DetectionError::AlreadyMonitoring(_)) => None,
                    Err(e) => {
                        warn!(call_token = %call_token, error = %e, "Detection could not start");
                        Some((CallUIState::DetectionFailed, TransitionTrigger::ErrorOccurred))
                    }
                }
            }
            CallUIState::DetectionFailed | CallUIState::BackgroundingFailed => {
                Some((CallUIState::Retrying, TransitionTrigger::SystemEvent))
            }
            CallUIState::Retrying => {
                let retry = self.retry.as_ref()?;
                match retry.start_retry(call_token, None, None).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(call_token = %call_token, error = %e, "Retry could not start");
                        Some((CallUIState::RetryExhausted, TransitionTrigger::RetryResult))
                    }
                }
            }
            CallUIState::DetectionSucceeded => {
                Some((CallUIState::Backgrounding, TransitionTrigger::BackgroundingResult))
            }
            CallUIState::Backgrounding => {
                let backgrounded = self
                    .source
                    .as_ref()
                    .is_some_and(|source| source.observe().app_state.is_backgrounded());
                if backgrounded {
                    return Some((CallUIState::Backgrounded, TransitionTrigger::BackgroundingResult));
                }
                let _ = self.backgrounding_tx.send(call_token.clone());
                None
            }
            CallUIState::Backgrounded => {
                Some((CallUIState::CallKitActive, TransitionTrigger::BackgroundingResult))
            }
            CallUIState::RetryExhausted => {
                self.hub.publish(CallNotification::FallbackUIRequired {
                    call_token: call_token.clone(),
                });
                self.stop_workers(call_token).await;
                None
            }
            CallUIState::Completed | CallUIState::Terminated | CallUIState::Error => {
                self.stop_workers(call_token).await;
                None
            }
            _ => None,
        }
    }

    async fn stop_workers(&self, call_token: &CallToken) {
        if let Some(detection) = &self.detection {
            detection.stop_detection(call_token).await;
        }
        if let Some(retry) = &self.retry {
            retry.stop_retry(call_token).await;
        }
    }

    /// Commit, run side effects, and follow any chained transitions.
    async fn drive(
        &self,
        call_token: &CallToken,
        to: CallUIState,
        trigger: TransitionTrigger,
        metadata: &Metadata,
        mode: Mode,
    ) -> Result<StateTransition, StateMachineError> {
        let first = self.commit(call_token, to, trigger, mode).await?;
        let mut next = self.after_transition(&first, metadata).await;

        while let Some((to, trigger)) = next {
            next = match self.commit(call_token, to, trigger, Mode::Checked).await {
                Ok(transition) => self.after_transition(&transition, metadata).await,
                Err(e) => {
                    warn!(call_token = %call_token, error = %e, "Chained transition failed");
                    None
                }
            };
        }
        Ok(first)
    }

    /// Register a call in `idle` and move it to `initializing`.
    ///
    /// A finished call may be initialized again; it passes back through `idle`.
    #[instrument(skip(self, metadata), fields(call_token = %call_token))]
    pub async fn initialize_call(
        &self,
        call_token: &CallToken,
        metadata: Metadata,
    ) -> Result<StateTransition, StateMachineError> {
        if call_token.is_empty() {
            return Err(StateMachineError::InvalidCallToken);
        }

        let captured = self.capture();
        let reuse = {
            let mut state = self.state.lock().await;
            if state.active.contains_key(call_token) {
                return Err(StateMachineError::CallAlreadyActive(call_token.clone()));
            }
            match state.current(call_token) {
                Some(previous) => {
                    let transition = StateTransition::new(
                        call_token.clone(),
                        previous,
                        CallUIState::Idle,
                        TransitionTrigger::SystemEvent,
                    );
                    self.apply_locked(&mut state, &transition, &captured);
                    Some(transition)
                }
                None => {
                    state.active.insert(call_token.clone(), CallUIState::Idle);
                    let snapshot = captured.snapshot(
                        CallUIState::Idle,
                        TransitionTrigger::SystemEvent,
                        state.active.len(),
                    );
                    push_capped(
                        state.snapshots.entry(call_token.clone()).or_default(),
                        snapshot,
                        self.config.snapshot_history_capacity,
                    );
                    None
                }
            }
        };
        if let Some(transition) = reuse {
            self.after_transition(&transition, &metadata).await;
        }

        self.drive(
            call_token,
            CallUIState::Initializing,
            TransitionTrigger::SystemEvent,
            &metadata,
            Mode::Checked,
        )
        .await
    }

    /// Apply an allow-listed transition.
    #[instrument(skip(self, metadata), fields(call_token = %call_token, to = %to))]
    pub async fn transition_state(
        &self,
        call_token: &CallToken,
        to: CallUIState,
        trigger: TransitionTrigger,
        metadata: Metadata,
    ) -> Result<StateTransition, StateMachineError> {
        self.drive(call_token, to, trigger, &metadata, Mode::Checked)
            .await
    }

    /// End a call as `completed` (success) or `terminated`.
    #[instrument(skip(self), fields(call_token = %call_token))]
    pub async fn complete_call(
        &self,
        call_token: &CallToken,
        success: bool,
    ) -> Result<StateTransition, StateMachineError> {
        let to = if success {
            CallUIState::Completed
        } else {
            CallUIState::Terminated
        };
        self.drive(
            call_token,
            to,
            TransitionTrigger::SystemEvent,
            &Metadata::new(),
            Mode::LifecycleExit,
        )
        .await
    }

    /// End a call in `error`.
    #[instrument(skip(self), fields(call_token = %call_token))]
    pub async fn fail_call(
        &self,
        call_token: &CallToken,
        reason: &str,
    ) -> Result<StateTransition, StateMachineError> {
        let metadata = Metadata::from([("error".to_string(), reason.to_string())]);
        self.drive(
            call_token,
            CallUIState::Error,
            TransitionTrigger::ErrorOccurred,
            &metadata,
            Mode::LifecycleExit,
        )
        .await
    }

    /// Outcome of the app moving to the background for a call in `backgrounding`.
    pub async fn report_backgrounding_result(
        &self,
        call_token: &CallToken,
        success: bool,
    ) -> Result<StateTransition, StateMachineError> {
        let to = if success {
            CallUIState::Backgrounded
        } else {
            CallUIState::BackgroundingFailed
        };
        self.transition_state(
            call_token,
            to,
            TransitionTrigger::BackgroundingResult,
            Metadata::new(),
        )
        .await
    }

    /// Complete backgrounding for every call waiting on it.
    pub async fn handle_did_enter_background(&self) -> usize {
        let waiting: Vec<CallToken> = self
            .state
            .lock()
            .await
            .active
            .iter()
            .filter(|(_, state)| **state == CallUIState::Backgrounding)
            .map(|(token, _)| token.clone())
            .collect();

        let mut completed = 0;
        for token in waiting {
            if self.report_backgrounding_result(&token, true).await.is_ok() {
                completed += 1;
            }
        }
        completed
    }

    /// Forget a call entirely and stop its workers.
    pub async fn cleanup_call(&self, call_token: &CallToken) -> bool {
        let known = {
            let mut state = self.state.lock().await;
            let active = state.active.remove(call_token).is_some();
            let history = state.snapshots.remove(call_token).is_some();
            active || history
        };
        self.stop_workers(call_token).await;
        self.synchronizer.clear_call(call_token).await;
        if known {
            debug!(call_token = %call_token, "Call cleaned up");
        }
        known
    }

    pub async fn get_current_state(&self, call_token: &CallToken) -> Option<CallUIState> {
        self.state.lock().await.current(call_token)
    }

    /// Every call not in a terminal state.
    pub async fn get_all_active_states(&self) -> HashMap<CallToken, CallUIState> {
        self.state.lock().await.active.clone()
    }

    /// Up to `limit` most recent snapshots for a call, oldest first.
    pub async fn get_state_history(&self, call_token: &CallToken, limit: usize) -> Vec<StateSnapshot> {
        let state = self.state.lock().await;
        state
            .snapshots
            .get(call_token)
            .map(|history| {
                let skip = history.len().saturating_sub(limit);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Up to `limit` most recent applied transitions, oldest first.
    pub async fn transition_log(&self, limit: usize) -> Vec<StateTransition> {
        let state = self.state.lock().await;
        let skip = state.log.len().saturating_sub(limit);
        state.log.iter().skip(skip).cloned().collect()
    }

    /// Up to `limit` most recent rejected transitions, oldest first.
    pub async fn rejected_transitions(&self, limit: usize) -> Vec<StateTransition> {
        let state = self.state.lock().await;
        let skip = state.rejected.len().saturating_sub(limit);
        state.rejected.iter().skip(skip).cloned().collect()
    }

    /// Analyse health and emit recommendations not already outstanding.
    pub async fn analyze_health(&self) -> HealthReport {
        let report = {
            let state = self.state.lock().await;
            let inputs = HealthInputs {
                active: &state.active,
                snapshots: &state.snapshots,
                applied: &state.log,
                rejected: &state.rejected,
            };
            state_health::analyze(&self.config, &inputs, Instant::now())
        };

        let fresh: Vec<_> = {
            let mut emitted = self.emitted.lock().await;
            let now = Utc::now();
            emitted.retain(|_, expires_at| *expires_at > now);
            report
                .recommendations
                .iter()
                .filter(|rec| {
                    let key = (rec.category, rec.call_token.clone());
                    if emitted.contains_key(&key) {
                        false
                    } else {
                        emitted.insert(key, rec.expires_at);
                        true
                    }
                })
                .cloned()
                .collect()
        };

        debug!(
            score = report.score,
            error_rate = report.error_rate,
            active_calls = report.active_calls,
            recommendations = fresh.len(),
            "Call state health analysed"
        );
        for recommendation in fresh {
            self.hub
                .publish(CallNotification::DidReceiveRecommendation(recommendation));
        }
        report
    }

    async fn on_detection_event(&self, event: DetectionEvent) {
        let DetectionEvent::Finalized { result, reason } = event else {
            return;
        };
        let call_token = &result.call_token;
        if self.get_current_state(call_token).await != Some(CallUIState::Detecting) {
            debug!(call_token = %call_token, reason = ?reason, "Ignoring detection result");
            return;
        }
        let to = if result.is_success() {
            CallUIState::DetectionSucceeded
        } else {
            CallUIState::DetectionFailed
        };
        if let Err(e) = self
            .transition_state(
                call_token,
                to,
                TransitionTrigger::DetectionResult,
                result.metadata.clone(),
            )
            .await
        {
            warn!(call_token = %call_token, error = %e, "Detection result not applied");
        }
    }

    async fn on_retry_event(&self, event: RetryEvent) {
        match event {
            RetryEvent::WillBegin {
                call_token,
                attempt,
                strategy,
                ..
            } => {
                self.hub.publish(CallNotification::RetryWillBegin {
                    call_token,
                    attempt,
                    strategy,
                });
            }
            RetryEvent::AttemptFailed { .. } => {}
            RetryEvent::Completed(result) => {
                let call_token = result.call_token.clone();
                self.hub
                    .publish(CallNotification::RetryDidComplete(result));
                if self.get_current_state(&call_token).await == Some(CallUIState::Retrying) {
                    if let Err(e) = self
                        .transition_state(
                            &call_token,
                            CallUIState::Detecting,
                            TransitionTrigger::RetryResult,
                            Metadata::new(),
                        )
                        .await
                    {
                        warn!(call_token = %call_token, error = %e, "Retry result not applied");
                    }
                }
            }
            RetryEvent::Exhausted(result) => {
                let call_token = result.call_token.clone();
                self.hub
                    .publish(CallNotification::RetryDidExceedMaxAttempts(result));
                if self.get_current_state(&call_token).await == Some(CallUIState::Retrying) {
                    if let Err(e) = self
                        .transition_state(
                            &call_token,
                            CallUIState::RetryExhausted,
                            TransitionTrigger::RetryResult,
                            Metadata::new(),
                        )
                        .await
                    {
                        warn!(call_token = %call_token, error = %e, "Retry exhaustion not applied");
                    }
                }
            }
        }
    }

    /// Follow a state applied by the synchronizer from another source.
    ///
    /// Only states reachable from the current one are followed. The machine
    /// stays authoritative for everything else.
    async fn on_sync_applied(&self, applied: SyncApplied) {
        let event = applied.event;
        if event.source == SyncSource::AppUi {
            return;
        }

        let trigger = if event.source == SyncSource::CallKit {
            TransitionTrigger::CallKitEvent
        } else {
            TransitionTrigger::ExternalCommand
        };
        let mut metadata = event.metadata.clone();
        if event.to_state == CallUIState::Error {
            metadata
                .entry("error".to_string())
                .or_insert_with(|| format!("reported by {}", event.source));
        }
        if let Err(e) = self
            .drive(&event.call_token, event.to_state, trigger, &metadata, Mode::IfReachable)
            .await
        {
            debug!(
                call_token = %event.call_token,
                source = %event.source,
                error = %e,
                "Synced state not followed"
            );
        }
    }

    /// Fail backgrounding for a call that has sat in `backgrounding` past the
    /// deadline. A call that left and re-entered since is measured from its
    /// latest entry.
    async fn expire_backgrounding(&self, call_token: &CallToken) {
        let timeout = self.config.backgrounding_timeout();
        let overdue = {
            let state = self.state.lock().await;
            state.active.get(call_token) == Some(&CallUIState::Backgrounding)
                && state
                    .snapshots
                    .get(call_token)
                    .and_then(|history| history.back())
                    .is_some_and(|snapshot| snapshot.captured_at.elapsed() >= timeout)
        };
        if !overdue {
            return;
        }

        warn!(
            call_token = %call_token,
            timeout_ms = self.config.backgrounding_timeout_ms,
            "Backgrounding timed out"
        );
        if let Err(e) = self
            .drive(
                call_token,
                CallUIState::BackgroundingFailed,
                TransitionTrigger::TimeoutExpired,
                &Metadata::new(),
                Mode::IfReachable,
            )
            .await
        {
            debug!(call_token = %call_token, error = %e, "Backgrounding deadline not applied");
        }
    }

    /// Spawn the engine listeners, the backgrounding deadlines, and the
    /// periodic health check.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(detection) = &self.detection {
            let machine = Arc::clone(self);
            let mut events = detection.subscribe();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => machine.on_detection_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Detection listener lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        if let Some(retry) = &self.retry {
            let machine = Arc::clone(self);
            let mut events = retry.subscribe();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(event) => machine.on_retry_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Retry listener lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        {
            let machine = Arc::clone(self);
            let mut events = self.synchronizer.subscribe();
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(applied) => machine.on_sync_applied(applied).await,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Sync listener lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        let backgrounding = self
            .backgrounding_rx
            .try_lock()
            .ok()
            .and_then(|mut rx| rx.take());
        if let Some(mut entered) = backgrounding {
            let machine = Arc::clone(self);
            let mut shutdown_rx = shutdown.subscribe();
            let timeout = self.config.backgrounding_timeout();
            handles.push(tokio::spawn(async move {
                let mut deadlines = JoinSet::new();
                loop {
                    tokio::select! {
                        Some(call_token) = entered.recv() => {
                            let machine = Arc::clone(&machine);
                            deadlines.spawn(async move {
                                tokio::time::sleep(timeout).await;
                                machine.expire_backgrounding(&call_token).await;
                            });
                        }
                        Some(_) = deadlines.join_next(), if !deadlines.is_empty() => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
                deadlines.abort_all();
            }));
        } else {
            warn!("Backgrounding deadlines already running");
        }

        {
            let machine = Arc::clone(self);
            let mut shutdown_rx = shutdown.subscribe();
            let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // Skip first tick (fires immediately)
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            machine.analyze_health().await;
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    use super::*;
    use crate::domain::models::SyncConfig;
    use crate::domain::ports::NullMemoryProbe;

    /// Counts memory reads taken while the machine's state lock was held.
    #[derive(Default)]
    struct LockAwareMemory {
        machine: OnceLock<Weak<CallUiStateMachine>>,
        reads: AtomicUsize,
        under_lock: AtomicUsize,
    }

    impl MemoryProbe for LockAwareMemory {
        fn resident_memory_bytes(&self) -> Option<u64> {
            let machine = self.machine.get().and_then(Weak::upgrade)?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            if machine.state.try_lock().is_err() {
                self.under_lock.fetch_add(1, Ordering::SeqCst);
            }
            Some(1024)
        }
    }

    /// Put a call directly into `state`, including transient ones.
    async fn seed(sm: &CallUiStateMachine, token: &CallToken, state: CallUIState) {
        let captured = sm.capture();
        let mut machine = sm.state.lock().await;
        if state.is_terminal() {
            machine.active.remove(token);
        } else {
            machine.active.insert(token.clone(), state);
        }
        let snapshot = captured.snapshot(state, TransitionTrigger::SystemEvent, machine.active.len());
        push_capped(
            machine.snapshots.entry(token.clone()).or_default(),
            snapshot,
            sm.config.snapshot_history_capacity,
        );
    }

    fn machine() -> CallUiStateMachine {
        let hub = NotificationHub::with_defaults();
        let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default(), Arc::clone(&hub)));
        CallUiStateMachine::new(
            StateMachineConfig::default(),
            hub,
            synchronizer,
            Arc::new(NullMemoryProbe),
        )
    }

    async fn walk(sm: &CallUiStateMachine, token: &CallToken, states: &[CallUIState]) {
        for state in states {
            sm.transition_state(token, *state, TransitionTrigger::SystemEvent, Metadata::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_enters_initializing() {
        let sm = machine();
        let token = CallToken::new("call-1");

        let transition = sm.initialize_call(&token, Metadata::new()).await.unwrap();
        assert_eq!(transition.from, CallUIState::Idle);
        assert_eq!(transition.to, CallUIState::Initializing);
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Initializing));

        assert_eq!(
            sm.initialize_call(&token, Metadata::new()).await,
            Err(StateMachineError::CallAlreadyActive(token.clone()))
        );
        assert_eq!(
            sm.initialize_call(&CallToken::new(""), Metadata::new()).await,
            Err(StateMachineError::InvalidCallToken)
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected_and_recorded() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();

        let err = sm
            .transition_state(&token, CallUIState::CallKitActive, TransitionTrigger::UserAction, Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Initializing));

        let rejected = sm.rejected_transitions(10).await;
        assert_eq!(rejected.len(), 1);
        assert!(!rejected[0].validation.is_valid);
    }

    #[tokio::test]
    async fn test_every_unlisted_transition_is_rejected() {
        let sm = machine();
        let mut rejected = 0;
        for from in CallUIState::ALL {
            let allowed = from.valid_transitions();
            for to in CallUIState::ALL.into_iter().filter(|to| !allowed.contains(to)) {
                let token = CallToken::new(format!("{from}-{to}"));
                seed(&sm, &token, from).await;
                let history = sm.get_state_history(&token, usize::MAX).await.len();

                let err = sm
                    .transition_state(&token, to, TransitionTrigger::UserAction, Metadata::new())
                    .await
                    .unwrap_err();
                assert!(
                    matches!(err, StateMachineError::InvalidTransition { .. }),
                    "{from} -> {to} was applied"
                );
                assert_eq!(sm.get_current_state(&token).await, Some(from), "{from} -> {to}");
                assert_eq!(sm.get_state_history(&token, usize::MAX).await.len(), history);
                rejected += 1;
            }
        }
        assert!(sm.transition_log(usize::MAX).await.is_empty());
        assert_eq!(
            sm.rejected_transitions(usize::MAX).await.len(),
            rejected.min(sm.config.transition_log_capacity)
        );
    }

    #[tokio::test]
    async fn test_platform_context_read_outside_lock() {
        let memory = Arc::new(LockAwareMemory::default());
        let hub = NotificationHub::with_defaults();
        let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default(), Arc::clone(&hub)));
        let sm = Arc::new(CallUiStateMachine::new(
            StateMachineConfig::default(),
            hub,
            synchronizer,
            Arc::clone(&memory) as Arc<dyn MemoryProbe>,
        ));
        let _ = memory.machine.set(Arc::downgrade(&sm));
        let token = CallToken::new("call-1");

        sm.initialize_call(&token, Metadata::new()).await.unwrap();
        walk(&sm, &token, &[CallUIState::Detecting]).await;
        sm.complete_call(&token, true).await.unwrap();

        assert!(memory.reads.load(Ordering::SeqCst) >= 4);
        assert_eq!(memory.under_lock.load(Ordering::SeqCst), 0);
        let history = sm.get_state_history(&token, usize::MAX).await;
        assert!(history
            .iter()
            .all(|snapshot| snapshot.performance.resident_memory_bytes == Some(1024)));
    }

    #[tokio::test]
    async fn test_synced_state_followed_only_when_reachable() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();
        walk(&sm, &token, &[CallUIState::Detecting]).await;

        let report = |to| SyncApplied {
            event: crate::domain::models::StateSyncEvent {
                id: uuid::Uuid::new_v4(),
                source: SyncSource::CallKit,
                priority: 100,
                call_token: token.clone(),
                from_state: None,
                to_state: to,
                timestamp: Utc::now(),
                sequence: crate::domain::models::SequenceNumber(1),
                metadata: Metadata::new(),
            },
            conflict: None,
        };

        sm.on_sync_applied(report(CallUIState::CallKitActive)).await;
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Detecting));
        assert!(sm.rejected_transitions(10).await.is_empty());

        sm.on_sync_applied(report(CallUIState::DetectionFailed)).await;
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Retrying));

        sm.on_sync_applied(report(CallUIState::Terminated)).await;
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Terminated));
        let last = sm.transition_log(1).await;
        assert_eq!(last[0].trigger, TransitionTrigger::CallKitEvent);
        assert!(sm.rejected_transitions(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_call() {
        let sm = machine();
        assert!(matches!(
            sm.transition_state(&CallToken::new("nope"), CallUIState::Initializing, TransitionTrigger::UserAction, Metadata::new())
                .await,
            Err(StateMachineError::UnknownCall(_))
        ));
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();

        walk(&sm, &token, &[CallUIState::Detecting]).await;

        let history = sm.get_state_history(&token, 2).await;
        let states: Vec<_> = history.iter().map(|s| s.state).collect();
        assert_eq!(states, vec![CallUIState::Initializing, CallUIState::Detecting]);
        assert_eq!(sm.get_state_history(&token, 10).await.len(), 3);
        assert_eq!(sm.transition_log(10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_detection_failure_chains_into_retrying() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();
        walk(&sm, &token, &[CallUIState::Detecting, CallUIState::DetectionFailed]).await;

        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Retrying));
    }

    #[tokio::test]
    async fn test_complete_call_bypasses_allow_list() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();

        let transition = sm.complete_call(&token, true).await.unwrap();
        assert_eq!(transition.to, CallUIState::Completed);
        assert!(sm.get_all_active_states().await.is_empty());
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Completed));

        assert!(sm.complete_call(&token, false).await.is_err());

        // Finished calls can be reused
        let again = sm.initialize_call(&token, Metadata::new()).await.unwrap();
        assert_eq!(again.to, CallUIState::Initializing);
    }

    #[tokio::test]
    async fn test_fail_call_enters_error() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();

        let transition = sm.fail_call(&token, "backend lost").await.unwrap();
        assert_eq!(transition.to, CallUIState::Error);
        assert_eq!(transition.trigger, TransitionTrigger::ErrorOccurred);
        assert!(sm.cleanup_call(&token).await);
        assert!(sm.get_current_state(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_backgrounding_waits_for_signal() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();
        walk(&sm, &token, &[CallUIState::Detecting, CallUIState::DetectionSucceeded]).await;
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::Backgrounding));

        assert_eq!(sm.handle_did_enter_background().await, 1);
        assert_eq!(sm.get_current_state(&token).await, Some(CallUIState::CallKitActive));
    }

    #[tokio::test]
    async fn test_transitions_are_synced() {
        let sm = machine();
        let token = CallToken::new("call-1");
        sm.initialize_call(&token, Metadata::new()).await.unwrap();
        assert_eq!(
            sm.synchronizer.get_current_state(&token).await,
            Some(CallUIState::Initializing)
        );
    }
}
