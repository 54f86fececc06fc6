//! Common test utilities for integration tests
//!
//! Provides shared fixtures used across multiple integration test files.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use callsync::domain::models::{
    AppForegroundState, CallObservation, CallToken, CallUIState, Config, HealthTrend,
    Recommendation, RetryResult, RetryStrategy, StateSyncEvent, SyncConflict, SyncHealthMetrics,
    SystemCall, TransitionTrigger,
};
use callsync::domain::ports::{CallObservationSource, CallStateObserver, MemoryProbe, RedetectionAction};

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Config with timings short enough for real-time tests.
#[allow(dead_code)]
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.detection.poll_interval_ms = 10;
    config.detection.lag_poll_interval_ms = 10;
    config.detection.max_detection_duration_ms = 200;
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.retry.per_attempt_timeout_ms = 100;
    config
}

/// Observation source whose answer tests can change mid-flight.
pub struct FakeObservationSource {
    current: Mutex<CallObservation>,
}

#[allow(dead_code)]
impl FakeObservationSource {
    pub fn new(observation: CallObservation) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(observation),
        })
    }

    /// App backgrounded with `call` live.
    pub fn backgrounded_with(call: &str) -> Arc<Self> {
        Self::new(CallObservation::new(
            AppForegroundState::Background,
            vec![SystemCall::new(call).connected()],
        ))
    }

    /// App in the foreground with no system calls.
    pub fn foreground_idle() -> Arc<Self> {
        Self::new(CallObservation::new(AppForegroundState::Active, vec![]))
    }

    pub fn set(&self, observation: CallObservation) {
        *self.current.lock().unwrap() = observation;
    }
}

impl CallObservationSource for FakeObservationSource {
    fn observe(&self) -> CallObservation {
        self.current.lock().unwrap().clone()
    }
}

/// Re-detection that always fails.
#[allow(dead_code)]
pub struct FailingAction;

#[async_trait]
impl RedetectionAction for FailingAction {
    async fn attempt(&self, _call_token: &CallToken, attempt: u32) -> Result<(), String> {
        Err(format!("attempt {attempt} failed"))
    }
}

/// Re-detection that replays scripted outcomes, then fails.
#[allow(dead_code)]
pub struct ScriptedAction {
    outcomes: Mutex<VecDeque<Result<(), String>>>,
    pub delay: Duration,
}

#[allow(dead_code)]
impl ScriptedAction {
    pub fn new(outcomes: impl IntoIterator<Item = Result<(), String>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl RedetectionAction for ScriptedAction {
    async fn attempt(&self, _call_token: &CallToken, _attempt: u32) -> Result<(), String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
    }
}

/// Memory probe reporting a fixed value.
#[allow(dead_code)]
pub struct FixedMemory(pub Option<u64>);

impl MemoryProbe for FixedMemory {
    fn resident_memory_bytes(&self) -> Option<u64> {
        self.0
    }
}

/// Observer recording every callback by name.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
    pub transitions: Mutex<Vec<(CallUIState, CallUIState)>>,
    pub recommendations: Mutex<Vec<Recommendation>>,
}

#[allow(dead_code)]
impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }

    fn record(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

impl CallStateObserver for RecordingObserver {
    fn did_transition(
        &self,
        _call_token: &CallToken,
        from: CallUIState,
        to: CallUIState,
        _trigger: TransitionTrigger,
    ) {
        self.transitions.lock().unwrap().push((from, to));
        self.record("did_transition");
    }

    fn did_sync(&self, _event: &StateSyncEvent) {
        self.record("did_sync");
    }

    fn did_detect_conflict(&self, _conflict: &SyncConflict) {
        self.record("did_detect_conflict");
    }

    fn did_resolve_conflict(&self, _conflict: &SyncConflict) {
        self.record("did_resolve_conflict");
    }

    fn health_did_change(&self, _metrics: &SyncHealthMetrics, _trend: HealthTrend) {
        self.record("health_did_change");
    }

    fn did_encounter_critical_error(&self, _message: &str) {
        self.record("did_encounter_critical_error");
    }

    fn did_receive_recommendation(&self, recommendation: &Recommendation) {
        self.recommendations
            .lock()
            .unwrap()
            .push(recommendation.clone());
        self.record("did_receive_recommendation");
    }

    fn retry_will_begin(&self, _call_token: &CallToken, _attempt: u32, _strategy: RetryStrategy) {
        self.record("retry_will_begin");
    }

    fn retry_did_complete(&self, _result: &RetryResult) {
        self.record("retry_did_complete");
    }

    fn retry_did_exceed_max_attempts(&self, _result: &RetryResult) {
        self.record("retry_did_exceed_max_attempts");
    }

    fn fallback_ui_required(&self, _call_token: &CallToken) {
        self.record("fallback_ui_required");
    }
}

/// Poll `check` every 10ms until it returns true or `timeout_ms` elapses.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(mut check: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
