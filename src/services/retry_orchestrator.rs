//! Retry orchestrator.
//!
//! Drives bounded retry cycles for calls whose native UI did not come up.
//! Each operation runs as its own task: pick a strategy, sleep the backoff
//! delay, run the re-detection action under a per-attempt timeout, and feed
//! the outcome to the shared circuit breaker and the strategy history.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::errors::RetryError;
use crate::domain::models::{
    CallToken, RetryConfig, RetryConfiguration, RetryEvent, RetryOperation, RetryResult,
    RetryStrategy, StrategyOutcome,
};
use crate::domain::ports::{MemoryProbe, RedetectionAction};
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitCheckResult};

/// Retained retry results.
pub const RESULT_HISTORY_CAPACITY: usize = 500;
/// Retained outcomes per strategy.
pub const STRATEGY_HISTORY_CAPACITY: usize = 50;
/// Outcomes per strategy considered by adaptive selection.
pub const ADAPTIVE_WINDOW: usize = 20;

/// Jitter multiplier drawn uniformly from the inclusive range.
pub fn sample_jitter((low, high): (f64, f64)) -> f64 {
    if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        low
    }
}

/// Pick the strategy with the best recent success rate.
///
/// Only strategies with at least one recorded outcome compete. Ties go to
/// the earlier entry of [`RetryStrategy::SELECTABLE`], so exponential
/// backoff wins by default.
pub fn select_adaptive(history: &HashMap<RetryStrategy, VecDeque<StrategyOutcome>>) -> RetryStrategy {
    let mut best = RetryStrategy::ExponentialBackoff;
    let mut best_rate = f64::NEG_INFINITY;

    for strategy in RetryStrategy::SELECTABLE {
        let Some(outcomes) = history.get(&strategy).filter(|o| !o.is_empty()) else {
            continue;
        };
        let recent = outcomes.iter().rev().take(ADAPTIVE_WINDOW);
        let (total, successes) = recent.fold((0_usize, 0_usize), |(t, s), o| {
            (t + 1, s + usize::from(o.success))
        });
        let rate = successes as f64 / total as f64;
        if rate > best_rate {
            best = strategy;
            best_rate = rate;
        }
    }
    best
}

struct ActiveRetry {
    generation: u64,
    operation: RetryOperation,
    probing: bool,
    handle: Option<JoinHandle<()>>,
}

/// State shared between the orchestrator and its worker tasks.
struct Shared {
    breaker: Arc<CircuitBreakerService>,
    action: Arc<dyn RedetectionAction>,
    operations: Mutex<HashMap<CallToken, ActiveRetry>>,
    results: Mutex<VecDeque<RetryResult>>,
    strategy_history: Mutex<HashMap<RetryStrategy, VecDeque<StrategyOutcome>>>,
    events: broadcast::Sender<RetryEvent>,
}

enum AttemptGate {
    Proceed { probing: bool },
    Stop(RetryError),
    Cancelled,
}

impl Shared {
    async fn record_outcome(&self, strategy: RetryStrategy, success: bool) {
        let mut history = self.strategy_history.lock().await;
        let outcomes = history.entry(strategy).or_default();
        outcomes.push_back(StrategyOutcome {
            success,
            recorded_at: Utc::now(),
        });
        while outcomes.len() > STRATEGY_HISTORY_CAPACITY {
            outcomes.pop_front();
        }
    }

    async fn is_current(&self, call_token: &CallToken, generation: u64) -> bool {
        self.operations
            .lock()
            .await
            .get(call_token)
            .is_some_and(|op| op.generation == generation)
    }

    /// Budget and breaker checks that open every attempt.
    async fn gate(
        &self,
        call_token: &CallToken,
        generation: u64,
        attempt: u32,
        max_retries: u32,
    ) -> AttemptGate {
        if attempt > max_retries {
            return AttemptGate::Stop(RetryError::MaxAttemptsExceeded {
                attempts: max_retries,
            });
        }
        let probing = match self.breaker.check().await {
            CircuitCheckResult::Blocked { retry_after, .. } => {
                return AttemptGate::Stop(RetryError::CircuitBreakerOpen { retry_after });
            }
            CircuitCheckResult::Testing => true,
            CircuitCheckResult::Allowed => false,
        };

        let current = {
            let mut operations = self.operations.lock().await;
            operations
                .get_mut(call_token)
                .filter(|op| op.generation == generation)
                .map(|active| {
                    active.operation.current_attempt = attempt;
                    active.probing = probing;
                })
                .is_some()
        };
        if current {
            return AttemptGate::Proceed { probing };
        }
        if probing {
            self.breaker.release_probe().await;
        }
        AttemptGate::Cancelled
    }

    async fn finish(
        &self,
        call_token: &CallToken,
        generation: u64,
        started: Instant,
        error: Option<RetryError>,
    ) {
        let removed = {
            let mut operations = self.operations.lock().await;
            if operations
                .get(call_token)
                .is_some_and(|op| op.generation == generation)
            {
                operations.remove(call_token)
            } else {
                None
            }
        };
        let Some(active) = removed else {
            return;
        };

        let success = error.is_none();
        let result = RetryResult {
            call_token: call_token.clone(),
            success,
            attempts: active.operation.current_attempt,
            strategy: active.operation.current_strategy,
            total_duration: started.elapsed(),
            error: error.as_ref().map(ToString::to_string),
            completed_at: Utc::now(),
        };

        {
            let mut results = self.results.lock().await;
            results.push_back(result.clone());
            while results.len() > RESULT_HISTORY_CAPACITY {
                results.pop_front();
            }
        }

        if success {
            tracing::info!(
                call_token = %call_token,
                attempts = result.attempts,
                strategy = %result.strategy,
                "Retry succeeded"
            );
            let _ = self.events.send(RetryEvent::Completed(result));
        } else {
            tracing::warn!(
                call_token = %call_token,
                attempts = result.attempts,
                strategy = %result.strategy,
                error = result.error.as_deref().unwrap_or_default(),
                "Retry exhausted"
            );
            let _ = self.events.send(RetryEvent::Exhausted(result));
        }
    }

    async fn run(
        self: Arc<Self>,
        call_token: CallToken,
        generation: u64,
        config: RetryConfiguration,
        strategy: RetryStrategy,
    ) {
        let started = Instant::now();
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            let probing = match self
                .gate(&call_token, generation, attempt, config.max_retries)
                .await
            {
                AttemptGate::Proceed { probing } => probing,
                AttemptGate::Stop(err) => {
                    self.finish(&call_token, generation, started, Some(err)).await;
                    return;
                }
                AttemptGate::Cancelled => return,
            };

            let delay = strategy.delay(attempt, &config, sample_jitter(config.jitter_range));
            tracing::debug!(
                call_token = %call_token,
                attempt,
                strategy = %strategy,
                delay_ms = delay.as_millis() as u64,
                probing,
                "Retry attempt scheduled"
            );
            let _ = self.events.send(RetryEvent::WillBegin {
                call_token: call_token.clone(),
                attempt,
                strategy,
                delay,
            });

            tokio::time::sleep(delay).await;

            let outcome = match tokio::time::timeout(
                config.per_attempt_timeout,
                self.action.attempt(&call_token, attempt),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(RetryError::AttemptFailed(message)),
                Err(_) => Err(RetryError::AttemptTimeout {
                    timeout: config.per_attempt_timeout,
                }),
            };

            if !self.is_current(&call_token, generation).await {
                if probing {
                    self.breaker.release_probe().await;
                }
                return;
            }

            match outcome {
                Ok(()) => {
                    self.breaker.record_success().await;
                    self.record_outcome(strategy, true).await;
                    self.finish(&call_token, generation, started, None).await;
                    return;
                }
                Err(err) => {
                    self.breaker.record_failure().await;
                    self.record_outcome(strategy, false).await;
                    let message = err.to_string();
                    if let Some(active) = self.operations.lock().await.get_mut(&call_token) {
                        active.operation.last_error = Some(message.clone());
                        active.probing = false;
                    }
                    tracing::debug!(
                        call_token = %call_token,
                        attempt,
                        error = %message,
                        "Retry attempt failed"
                    );
                    let _ = self.events.send(RetryEvent::AttemptFailed {
                        call_token: call_token.clone(),
                        attempt,
                        error: message,
                    });
                }
            }
        }
    }
}

/// Strategy-driven retry cycles with a shared circuit breaker.
pub struct RetryOrchestrator {
    settings: RetryConfig,
    memory: Arc<dyn MemoryProbe>,
    shared: Arc<Shared>,
    next_generation: AtomicU64,
    pressure_until: Mutex<Option<Instant>>,
}

impl RetryOrchestrator {
    pub fn new(
        settings: RetryConfig,
        breaker: Arc<CircuitBreakerService>,
        action: Arc<dyn RedetectionAction>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            settings,
            memory,
            shared: Arc::new(Shared {
                breaker,
                action,
                operations: Mutex::new(HashMap::new()),
                results: Mutex::new(VecDeque::new()),
                strategy_history: Mutex::new(HashMap::new()),
                events,
            }),
            next_generation: AtomicU64::new(1),
            pressure_until: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RetryConfig {
        &self.settings
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.shared.breaker
    }

    /// Subscribe to attempt and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.shared.events.subscribe()
    }

    /// Decide the strategy for a new operation.
    pub async fn select_strategy(
        &self,
        preferred: Option<RetryStrategy>,
        configuration: &RetryConfiguration,
    ) -> RetryStrategy {
        if self.shared.breaker.is_open().await {
            return RetryStrategy::CircuitBreaker;
        }
        if let Some(strategy) = preferred {
            return strategy;
        }
        if configuration.adaptive_enabled {
            return select_adaptive(&*self.shared.strategy_history.lock().await);
        }
        RetryStrategy::ExponentialBackoff
    }

    fn check_resources(&self) -> Result<(), RetryError> {
        let limit = self.settings.max_resident_memory_mb.saturating_mul(1024 * 1024);
        match self.memory.resident_memory_bytes() {
            Some(bytes) if bytes > limit => Err(RetryError::ResourceExhausted {
                reason: format!(
                    "resident memory {} MiB above {} MiB",
                    bytes / (1024 * 1024),
                    self.settings.max_resident_memory_mb
                ),
            }),
            _ => Ok(()),
        }
    }

    /// Start a retry operation for `call_token`.
    pub async fn start_retry(
        &self,
        call_token: &CallToken,
        preferred: Option<RetryStrategy>,
        configuration: Option<RetryConfiguration>,
    ) -> Result<(), RetryError> {
        if self
            .pressure_until
            .lock()
            .await
            .is_some_and(|until| Instant::now() < until)
        {
            return Err(RetryError::ResourceExhausted {
                reason: "memory pressure".to_string(),
            });
        }
        self.check_resources()?;

        let configuration =
            configuration.unwrap_or_else(|| RetryConfiguration::from(&self.settings));
        let strategy = self.select_strategy(preferred, &configuration).await;

        let mut operations = self.shared.operations.lock().await;
        if operations.contains_key(call_token) {
            return Err(RetryError::AlreadyActive(call_token.clone()));
        }
        let limit = self.settings.max_concurrent_retries;
        if operations.len() >= limit {
            return Err(RetryError::ConcurrentRetryLimit { limit });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let operation = RetryOperation::new(call_token.clone(), configuration.clone(), strategy);
        let handle = tokio::spawn(Arc::clone(&self.shared).run(
            call_token.clone(),
            generation,
            configuration,
            strategy,
        ));
        operations.insert(
            call_token.clone(),
            ActiveRetry {
                generation,
                operation,
                probing: false,
                handle: Some(handle),
            },
        );

        tracing::info!(
            call_token = %call_token,
            strategy = %strategy,
            active = operations.len(),
            "Retry started"
        );
        Ok(())
    }

    /// Cancel the retry for `call_token`. Cancelling twice is a no-op.
    pub async fn stop_retry(&self, call_token: &CallToken) -> bool {
        let removed = self.shared.operations.lock().await.remove(call_token);
        let Some(active) = removed else {
            return false;
        };
        if let Some(handle) = active.handle {
            handle.abort();
        }
        if active.probing {
            self.shared.breaker.release_probe().await;
        }
        tracing::debug!(call_token = %call_token, "Retry stopped");
        true
    }

    /// Cancel every active retry.
    pub async fn stop_all(&self) {
        let tokens: Vec<CallToken> = self.shared.operations.lock().await.keys().cloned().collect();
        for token in tokens {
            self.stop_retry(&token).await;
        }
    }

    pub async fn is_retry_active(&self, call_token: &CallToken) -> bool {
        self.shared.operations.lock().await.contains_key(call_token)
    }

    /// Current attempt number and strategy of an active retry.
    pub async fn get_retry_status(&self, call_token: &CallToken) -> Option<(u32, RetryStrategy)> {
        self.shared
            .operations
            .lock()
            .await
            .get(call_token)
            .map(|a| (a.operation.current_attempt, a.operation.current_strategy))
    }

    pub async fn get_operation(&self, call_token: &CallToken) -> Option<RetryOperation> {
        self.shared
            .operations
            .lock()
            .await
            .get(call_token)
            .map(|a| a.operation.clone())
    }

    pub async fn active_count(&self) -> usize {
        self.shared.operations.lock().await.len()
    }

    /// Most recent results, newest first.
    pub async fn retry_history(&self, limit: usize) -> Vec<RetryResult> {
        self.shared
            .results
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Success rate of `strategy` over the adaptive window.
    pub async fn strategy_success_rate(&self, strategy: RetryStrategy) -> Option<f64> {
        let history = self.shared.strategy_history.lock().await;
        let outcomes = history.get(&strategy).filter(|o| !o.is_empty())?;
        let recent: Vec<_> = outcomes.iter().rev().take(ADAPTIVE_WINDOW).collect();
        let successes = recent.iter().filter(|o| o.success).count();
        Some(successes as f64 / recent.len() as f64)
    }

    /// Drop results and strategy outcomes recorded before `cutoff`.
    pub async fn sweep_history_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut swept = 0;
        {
            let mut results = self.shared.results.lock().await;
            let before = results.len();
            results.retain(|r| r.completed_at >= cutoff);
            swept += before - results.len();
        }
        {
            let mut history = self.shared.strategy_history.lock().await;
            for outcomes in history.values_mut() {
                let before = outcomes.len();
                outcomes.retain(|o| o.recorded_at >= cutoff);
                swept += before - outcomes.len();
            }
            history.retain(|_, outcomes| !outcomes.is_empty());
        }
        swept
    }

    /// Apply the configured retention.
    pub async fn sweep_history(&self) -> usize {
        let retention = chrono::Duration::days(i64::from(self.settings.history_retention_days));
        let swept = self.sweep_history_before(Utc::now() - retention).await;
        if swept > 0 {
            tracing::debug!(swept, "Swept retry history");
        }
        swept
    }

    /// Refuse new operations for the pressure backoff window.
    pub async fn handle_memory_pressure(&self) {
        let window = Duration::from_millis(self.settings.memory_pressure_backoff_ms);
        *self.pressure_until.lock().await = Some(Instant::now() + window);
        tracing::warn!(
            backoff_ms = self.settings.memory_pressure_backoff_ms,
            "Memory pressure: refusing new retries"
        );
    }

    /// Spawn the periodic history sweep.
    pub fn start_history_sweep(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let period = Duration::from_secs(self.settings.history_sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Skip first tick (fires immediately)
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        orchestrator.sweep_history().await;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Retry history sweep stopped");
                        break;
                    }
                }
            }
        })
    }
}
