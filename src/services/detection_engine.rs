//! Detection engine.
//!
//! Polls the call-observation source on a fixed interval and classifies
//! whether the native call UI has taken over a call. Every tick is published
//! as a [`DetectionEvent::Tick`]; the session finalizes exactly once, when the
//! classification is stable or a bound (duration, attempts) fires.
//!
//! Retrying a failed detection is the retry orchestrator's job, not ours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::errors::DetectionError;
use crate::domain::models::{
    AppForegroundState, CallKitUIState, CallObservation, CallToken, DetectionConfig,
    DetectionEnd, DetectionEvent, DetectionResult,
};
use crate::domain::ports::CallObservationSource;

/// Classify one observation for `call_token`.
///
/// `presentation_lag_defect` selects the secondary heuristic used when the
/// app is still in the foreground while the system knows about the call.
pub fn classify(
    call_token: &CallToken,
    observation: &CallObservation,
    presentation_lag_defect: bool,
) -> CallKitUIState {
    let matching = observation.find(call_token);

    if matching.is_some() && observation.app_state.is_backgrounded() {
        return CallKitUIState::CallKitActive;
    }
    if observation.live_calls().count() > 1 {
        return CallKitUIState::SystemBusy;
    }
    let Some(call) = matching else {
        return CallKitUIState::Failed;
    };

    match observation.app_state {
        AppForegroundState::Active if presentation_lag_defect => {
            // Connected while on screen, or an incoming call that never
            // pushed the app back: the native UI did not take over.
            if call.is_connected || !call.is_outgoing {
                CallKitUIState::Failed
            } else {
                CallKitUIState::Transitioning
            }
        }
        AppForegroundState::Active => CallKitUIState::Failed,
        AppForegroundState::Inactive | AppForegroundState::Background => CallKitUIState::Unknown,
    }
}

struct DetectionSession {
    generation: u64,
    started_at: Instant,
    attempt_count: u32,
    metadata: HashMap<String, String>,
    last_state: Option<CallKitUIState>,
    handle: Option<JoinHandle<()>>,
}

type SessionMap = HashMap<CallToken, DetectionSession>;

/// State shared between the engine handle and its polling tasks.
struct Shared {
    config: DetectionConfig,
    source: Arc<dyn CallObservationSource>,
    sessions: Mutex<SessionMap>,
    events: broadcast::Sender<DetectionEvent>,
}

impl Shared {
    fn build_result(
        &self,
        call_token: &CallToken,
        state: CallKitUIState,
        attempt_count: u32,
        duration: Duration,
        observation: &CallObservation,
        metadata: HashMap<String, String>,
    ) -> DetectionResult {
        DetectionResult {
            call_token: call_token.clone(),
            final_state: state,
            duration,
            attempt_count,
            system_call_count: observation.live_calls().count(),
            app_foreground_state: observation.app_state,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Run one polling tick. Returns `false` once the session is gone.
    async fn tick(&self, call_token: &CallToken, generation: u64) -> bool {
        let (attempt, elapsed, mut metadata) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions
                .get_mut(call_token)
                .filter(|s| s.generation == generation)
            else {
                return false;
            };
            session.attempt_count += 1;
            (
                session.attempt_count,
                session.started_at.elapsed(),
                session.metadata.clone(),
            )
        };

        let observation = self.source.observe();

        let end = if elapsed > self.config.max_detection_duration() {
            let err = DetectionError::DetectionTimeout {
                call_token: call_token.clone(),
                elapsed,
            };
            metadata.insert("error".to_string(), err.to_string());
            Some(DetectionEnd::TimedOut)
        } else if attempt > self.config.max_detection_attempts {
            metadata.insert(
                "error".to_string(),
                format!("exceeded {} detection attempts", self.config.max_detection_attempts),
            );
            Some(DetectionEnd::AttemptsExhausted)
        } else {
            None
        };

        if let Some(reason) = end {
            tracing::warn!(
                call_token = %call_token,
                attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                reason = ?reason,
                "Detection gave up"
            );
            let result = self.build_result(
                call_token,
                CallKitUIState::Failed,
                attempt,
                elapsed,
                &observation,
                metadata,
            );
            self.finalize(call_token, generation, result, reason).await;
            return false;
        }

        let state = classify(call_token, &observation, self.config.presentation_lag_defect);
        let result = self.build_result(call_token, state, attempt, elapsed, &observation, metadata);

        {
            let mut sessions = self.sessions.lock().await;
            match sessions
                .get_mut(call_token)
                .filter(|s| s.generation == generation)
            {
                Some(session) => session.last_state = Some(state),
                None => return false,
            }
        }

        tracing::debug!(
            call_token = %call_token,
            attempt,
            state = state.as_str(),
            "Detection tick"
        );
        let _ = self.events.send(DetectionEvent::Tick(result.clone()));

        if state.is_stable() {
            self.finalize(call_token, generation, result, DetectionEnd::Stable)
                .await;
            return false;
        }
        true
    }

    /// Remove the session if it still belongs to `generation` and publish the
    /// final result. Returns the removed session.
    async fn finalize(
        &self,
        call_token: &CallToken,
        generation: u64,
        result: DetectionResult,
        reason: DetectionEnd,
    ) -> Option<DetectionSession> {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            if sessions
                .get(call_token)
                .is_some_and(|s| s.generation == generation)
            {
                sessions.remove(call_token)
            } else {
                None
            }
        };

        if removed.is_some() {
            tracing::info!(
                call_token = %call_token,
                final_state = result.final_state.as_str(),
                attempts = result.attempt_count,
                reason = ?reason,
                "Detection finalized"
            );
            let _ = self.events.send(DetectionEvent::Finalized { result, reason });
        }
        removed
    }
}

/// Polling detector of native call UI presentation.
pub struct DetectionEngine {
    shared: Arc<Shared>,
    next_generation: AtomicU64,
    pressure_until: Mutex<Option<Instant>>,
}

impl DetectionEngine {
    pub fn new(config: DetectionConfig, source: Arc<dyn CallObservationSource>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
            next_generation: AtomicU64::new(1),
            pressure_until: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.shared.config
    }

    /// Subscribe to tick and finalization events.
    pub fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.shared.events.subscribe()
    }

    /// Begin monitoring `call_token`.
    pub async fn start_detection(
        &self,
        call_token: &CallToken,
        metadata: HashMap<String, String>,
    ) -> Result<(), DetectionError> {
        if call_token.is_empty() {
            return Err(DetectionError::InvalidCallUuid);
        }
        if self
            .pressure_until
            .lock()
            .await
            .is_some_and(|until| Instant::now() < until)
        {
            tracing::warn!(call_token = %call_token, "Detection refused under memory pressure");
            return Err(DetectionError::MemoryPressure);
        }

        let mut sessions = self.shared.sessions.lock().await;
        if sessions.contains_key(call_token) {
            return Err(DetectionError::AlreadyMonitoring(call_token.clone()));
        }
        let limit = self.shared.config.max_concurrent_detections;
        if sessions.len() >= limit {
            return Err(DetectionError::ConcurrentDetectionLimit { limit });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let poll_interval = self.shared.config.effective_poll_interval();
        let shared = Arc::clone(&self.shared);
        let token = call_token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            // Skip first tick (fires immediately)
            interval.tick().await;
            loop {
                interval.tick().await;
                if !shared.tick(&token, generation).await {
                    break;
                }
            }
        });

        sessions.insert(
            call_token.clone(),
            DetectionSession {
                generation,
                started_at: Instant::now(),
                attempt_count: 0,
                metadata,
                last_state: None,
                handle: Some(handle),
            },
        );

        tracing::info!(
            call_token = %call_token,
            poll_interval_ms = poll_interval.as_millis() as u64,
            monitored = sessions.len(),
            "Detection started"
        );
        Ok(())
    }

    /// Stop monitoring `call_token`. Stopping an unknown call is a no-op.
    pub async fn stop_detection(&self, call_token: &CallToken) -> bool {
        let removed = self.shared.sessions.lock().await.remove(call_token);
        match removed {
            Some(session) => {
                if let Some(handle) = session.handle {
                    handle.abort();
                }
                tracing::debug!(call_token = %call_token, "Detection stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        let drained: Vec<DetectionSession> = self
            .shared
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in drained {
            if let Some(handle) = session.handle {
                handle.abort();
            }
        }
    }

    /// Latest classification of a monitored call, `None` when not monitored.
    pub async fn get_current_state(&self, call_token: &CallToken) -> Option<CallKitUIState> {
        self.shared
            .sessions
            .lock()
            .await
            .get(call_token)
            .map(|s| s.last_state.unwrap_or(CallKitUIState::Unknown))
    }

    pub async fn is_monitoring(&self, call_token: &CallToken) -> bool {
        self.shared.sessions.lock().await.contains_key(call_token)
    }

    pub async fn monitored_count(&self) -> usize {
        self.shared.sessions.lock().await.len()
    }

    /// Sample a monitored call right now, outside the polling schedule.
    ///
    /// A stable result finalizes the session just like a tick would.
    pub async fn perform_immediate_detection(
        &self,
        call_token: &CallToken,
    ) -> Option<DetectionResult> {
        let (generation, attempt, elapsed, metadata) = {
            let sessions = self.shared.sessions.lock().await;
            let session = sessions.get(call_token)?;
            (
                session.generation,
                session.attempt_count,
                session.started_at.elapsed(),
                session.metadata.clone(),
            )
        };

        let observation = self.shared.source.observe();
        let state = classify(
            call_token,
            &observation,
            self.shared.config.presentation_lag_defect,
        );
        let result = self.shared.build_result(
            call_token,
            state,
            attempt,
            elapsed,
            &observation,
            metadata,
        );

        {
            let mut sessions = self.shared.sessions.lock().await;
            let session = sessions
                .get_mut(call_token)
                .filter(|s| s.generation == generation)?;
            session.last_state = Some(state);
        }
        let _ = self.shared.events.send(DetectionEvent::Tick(result.clone()));

        if state.is_stable() {
            if let Some(handle) = self
                .shared
                .finalize(call_token, generation, result.clone(), DetectionEnd::Stable)
                .await
                .and_then(|session| session.handle)
            {
                handle.abort();
            }
        }
        Some(result)
    }

    /// One-shot classification without a session.
    pub fn probe_once(&self, call_token: &CallToken) -> Result<DetectionResult, DetectionError> {
        if call_token.is_empty() {
            return Err(DetectionError::InvalidCallUuid);
        }
        let observation = self.shared.source.observe();
        let state = classify(
            call_token,
            &observation,
            self.shared.config.presentation_lag_defect,
        );
        Ok(self.shared.build_result(
            call_token,
            state,
            1,
            Duration::ZERO,
            &observation,
            HashMap::new(),
        ))
    }

    /// Shed sessions that are already stable and refuse new ones for the
    /// pressure window. Returns the number of shed sessions.
    pub async fn handle_memory_pressure(&self) -> usize {
        *self.pressure_until.lock().await =
            Some(Instant::now() + self.shared.config.memory_pressure_window());

        let shed: Vec<(CallToken, DetectionSession)> = {
            let mut sessions = self.shared.sessions.lock().await;
            let stable: Vec<CallToken> = sessions
                .iter()
                .filter(|(_, s)| s.last_state.is_some_and(|state| state.is_stable()))
                .map(|(token, _)| token.clone())
                .collect();
            stable
                .into_iter()
                .filter_map(|token| sessions.remove(&token).map(|s| (token, s)))
                .collect()
        };

        for (token, session) in &shed {
            if let Some(handle) = &session.handle {
                handle.abort();
            }
            let result = DetectionResult {
                call_token: token.clone(),
                final_state: session.last_state.unwrap_or(CallKitUIState::Unknown),
                duration: session.started_at.elapsed(),
                attempt_count: session.attempt_count,
                system_call_count: 0,
                app_foreground_state: AppForegroundState::Inactive,
                timestamp: Utc::now(),
                metadata: session.metadata.clone(),
            };
            let _ = self.shared.events.send(DetectionEvent::Finalized {
                result,
                reason: DetectionEnd::Shed,
            });
        }

        tracing::warn!(shed = shed.len(), "Memory pressure: shed stable detection sessions");
        shed.len()
    }
}
