use serde::Serialize;

use crate::domain::models::{
    CallToken, CallUIState, HealthTrend, Recommendation, RetryResult, RetryStrategy,
    StateSyncEvent, SyncConflict, SyncHealthMetrics, TransitionTrigger,
};

/// Typed notification delivered to observers.
///
/// Every callback the engines raise is one of these values, so consumers can
/// either implement [`CallStateObserver`] or read the hub's broadcast stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CallNotification {
    DidTransition {
        call_token: CallToken,
        from: CallUIState,
        to: CallUIState,
        trigger: TransitionTrigger,
    },
    DidSync(StateSyncEvent),
    DidDetectConflict(SyncConflict),
    DidResolveConflict(SyncConflict),
    HealthDidChange {
        metrics: SyncHealthMetrics,
        trend: HealthTrend,
    },
    DidEncounterCriticalError {
        message: String,
    },
    DidReceiveRecommendation(Recommendation),
    RetryWillBegin {
        call_token: CallToken,
        attempt: u32,
        strategy: RetryStrategy,
    },
    RetryDidComplete(RetryResult),
    RetryDidExceedMaxAttempts(RetryResult),
    /// The native UI is not coming back; the in-app call screen must be shown.
    FallbackUIRequired {
        call_token: CallToken,
    },
}

impl CallNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DidTransition { .. } => "did_transition",
            Self::DidSync(_) => "did_sync",
            Self::DidDetectConflict(_) => "did_detect_conflict",
            Self::DidResolveConflict(_) => "did_resolve_conflict",
            Self::HealthDidChange { .. } => "health_did_change",
            Self::DidEncounterCriticalError { .. } => "did_encounter_critical_error",
            Self::DidReceiveRecommendation(_) => "did_receive_recommendation",
            Self::RetryWillBegin { .. } => "retry_will_begin",
            Self::RetryDidComplete(_) => "retry_did_complete",
            Self::RetryDidExceedMaxAttempts(_) => "retry_did_exceed_max_attempts",
            Self::FallbackUIRequired { .. } => "fallback_ui_required",
        }
    }

    /// Invoke the matching observer callback.
    pub fn deliver_to(&self, observer: &dyn CallStateObserver) {
        match self {
            Self::DidTransition {
                call_token,
                from,
                to,
                trigger,
            } => observer.did_transition(call_token, *from, *to, *trigger),
            Self::DidSync(event) => observer.did_sync(event),
            Self::DidDetectConflict(conflict) => observer.did_detect_conflict(conflict),
            Self::DidResolveConflict(conflict) => observer.did_resolve_conflict(conflict),
            Self::HealthDidChange { metrics, trend } => observer.health_did_change(metrics, *trend),
            Self::DidEncounterCriticalError { message } => {
                observer.did_encounter_critical_error(message);
            }
            Self::DidReceiveRecommendation(rec) => observer.did_receive_recommendation(rec),
            Self::RetryWillBegin {
                call_token,
                attempt,
                strategy,
            } => observer.retry_will_begin(call_token, *attempt, *strategy),
            Self::RetryDidComplete(result) => observer.retry_did_complete(result),
            Self::RetryDidExceedMaxAttempts(result) => {
                observer.retry_did_exceed_max_attempts(result);
            }
            Self::FallbackUIRequired { call_token } => observer.fallback_ui_required(call_token),
        }
    }
}

/// Notification interface exposed to UI and diagnostics layers.
///
/// All callbacks arrive on the hub's single dispatcher task, never
/// concurrently. Every method defaults to a no-op.
pub trait CallStateObserver: Send + Sync {
    fn did_transition(
        &self,
        _call_token: &CallToken,
        _from: CallUIState,
        _to: CallUIState,
        _trigger: TransitionTrigger,
    ) {
    }

    fn did_sync(&self, _event: &StateSyncEvent) {}

    fn did_detect_conflict(&self, _conflict: &SyncConflict) {}

    fn did_resolve_conflict(&self, _conflict: &SyncConflict) {}

    fn health_did_change(&self, _metrics: &SyncHealthMetrics, _trend: HealthTrend) {}

    fn did_encounter_critical_error(&self, _message: &str) {}

    fn did_receive_recommendation(&self, _recommendation: &Recommendation) {}

    fn retry_will_begin(&self, _call_token: &CallToken, _attempt: u32, _strategy: RetryStrategy) {}

    fn retry_did_complete(&self, _result: &RetryResult) {}

    fn retry_did_exceed_max_attempts(&self, _result: &RetryResult) {}

    fn fallback_ui_required(&self, _call_token: &CallToken) {}
}
