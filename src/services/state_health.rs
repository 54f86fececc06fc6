//! Health analysis over the state machine's records.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::domain::models::{
    CallToken, CallUIState, HealthReport, Recommendation, RecommendationCategory,
    RecommendationPriority, StateMachineConfig, StateSnapshot, StateTransition, StuckCall,
    TransitionLoop,
};

const ERROR_RATE_WEIGHT: f64 = 0.5;
const EXCESS_CALL_PENALTY: f64 = 0.1;
const STUCK_CALL_PENALTY: f64 = 0.15;
const CRITICAL_SCORE: f64 = 0.5;

/// Borrowed view of everything the analysis reads.
pub struct HealthInputs<'a> {
    pub active: &'a HashMap<CallToken, CallUIState>,
    pub snapshots: &'a HashMap<CallToken, VecDeque<StateSnapshot>>,
    pub applied: &'a VecDeque<StateTransition>,
    pub rejected: &'a VecDeque<StateTransition>,
}

/// Share of recorded transitions that were rejected or landed in a failure state.
pub fn error_rate(applied: &VecDeque<StateTransition>, rejected: &VecDeque<StateTransition>) -> f64 {
    let total = applied.len() + rejected.len();
    if total == 0 {
        return 0.0;
    }
    let failures = applied.iter().filter(|t| t.to.is_failure()).count() + rejected.len();
    failures as f64 / total as f64
}

/// Active calls whose latest snapshot is older than the stuck timeout.
pub fn stuck_calls(
    inputs: &HealthInputs<'_>,
    timeout: Duration,
    now: Instant,
) -> Vec<StuckCall> {
    let mut stuck: Vec<StuckCall> = inputs
        .active
        .iter()
        .filter(|(_, state)| !state.is_terminal())
        .filter_map(|(token, state)| {
            let last = inputs.snapshots.get(token)?.back()?;
            let age = now.saturating_duration_since(last.captured_at);
            (age > timeout).then(|| StuckCall {
                call_token: token.clone(),
                state: *state,
                stuck_for: age,
            })
        })
        .collect();
    stuck.sort_by(|a, b| a.call_token.as_str().cmp(b.call_token.as_str()));
    stuck
}

/// States recurring at least `threshold` times in the last `window` snapshots.
pub fn transition_loops(
    snapshots: &HashMap<CallToken, VecDeque<StateSnapshot>>,
    window: usize,
    threshold: usize,
) -> Vec<TransitionLoop> {
    let mut loops = Vec::new();
    for (token, history) in snapshots {
        let mut counts: HashMap<CallUIState, usize> = HashMap::new();
        for snapshot in history.iter().rev().take(window) {
            *counts.entry(snapshot.state).or_default() += 1;
        }
        loops.extend(
            counts
                .into_iter()
                .filter(|(_, n)| *n >= threshold)
                .map(|(state, occurrences)| TransitionLoop {
                    call_token: token.clone(),
                    state,
                    occurrences,
                }),
        );
    }
    loops.sort_by(|a, b| {
        a.call_token
            .as_str()
            .cmp(b.call_token.as_str())
            .then(a.state.priority().cmp(&b.state.priority()))
    });
    loops
}

/// Run one analysis pass.
pub fn analyze(config: &StateMachineConfig, inputs: &HealthInputs<'_>, now: Instant) -> HealthReport {
    let ttl = Duration::from_secs(config.recommendation_ttl_secs);
    let error_rate = error_rate(inputs.applied, inputs.rejected);
    let stuck = stuck_calls(
        inputs,
        Duration::from_secs(config.stuck_state_timeout_secs),
        now,
    );
    let loops = transition_loops(inputs.snapshots, config.loop_window, config.loop_threshold);
    let active_calls = inputs.active.len();
    let excess = active_calls.saturating_sub(config.max_expected_active_calls);

    let score = (1.0
        - error_rate * ERROR_RATE_WEIGHT
        - excess as f64 * EXCESS_CALL_PENALTY
        - stuck.len() as f64 * STUCK_CALL_PENALTY)
        .clamp(0.0, 1.0);

    let mut recommendations = Vec::new();
    if error_rate > config.error_rate_threshold {
        recommendations.push(Recommendation::new(
            RecommendationPriority::High,
            RecommendationCategory::ErrorRate,
            format!(
                "High error rate ({:.0}%) across active calls: review detection and retry configuration",
                error_rate * 100.0
            ),
            ttl,
        ));
    }
    for call in &stuck {
        recommendations.push(
            Recommendation::new(
                RecommendationPriority::Medium,
                RecommendationCategory::StuckState,
                format!(
                    "Call stuck in {} for {}s: terminate or reset it",
                    call.state,
                    call.stuck_for.as_secs()
                ),
                ttl,
            )
            .for_call(call.call_token.clone()),
        );
    }
    for found in &loops {
        recommendations.push(
            Recommendation::new(
                RecommendationPriority::Medium,
                RecommendationCategory::TransitionLoop,
                format!(
                    "Call entered {} {} times recently: check for a retry loop",
                    found.state, found.occurrences
                ),
                ttl,
            )
            .for_call(found.call_token.clone()),
        );
    }
    if excess > 0 {
        recommendations.push(Recommendation::new(
            RecommendationPriority::Low,
            RecommendationCategory::Capacity,
            format!(
                "{active_calls} active calls exceeds the expected {}",
                config.max_expected_active_calls
            ),
            ttl,
        ));
    }
    if score < CRITICAL_SCORE {
        recommendations.push(Recommendation::new(
            RecommendationPriority::Critical,
            RecommendationCategory::OverallHealth,
            format!("Call state health score {score:.2} is critical"),
            ttl,
        ));
    }
    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));

    HealthReport {
        score,
        active_calls,
        error_rate,
        stuck_calls: stuck,
        loops,
        recommendations,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        AppForegroundState, PerformanceContext, SystemContext, TransitionTrigger,
    };

    fn snapshot(state: CallUIState, captured_at: Instant) -> StateSnapshot {
        StateSnapshot {
            state,
            trigger: TransitionTrigger::SystemEvent,
            timestamp: Utc::now(),
            captured_at,
            system: SystemContext {
                app_state: AppForegroundState::Active,
                active_system_calls: 0,
            },
            performance: PerformanceContext {
                active_calls: 1,
                resident_memory_bytes: None,
            },
        }
    }

    fn transition(from: CallUIState, to: CallUIState) -> StateTransition {
        StateTransition::new(CallToken::new("call"), from, to, TransitionTrigger::SystemEvent)
    }

    #[test]
    fn test_error_rate_counts_failures_and_rejections() {
        let applied: VecDeque<_> = vec![
            transition(CallUIState::Idle, CallUIState::Initializing),
            transition(CallUIState::Detecting, CallUIState::DetectionFailed),
            transition(CallUIState::DetectionFailed, CallUIState::Retrying),
        ]
        .into();
        let rejected: VecDeque<_> = vec![transition(CallUIState::Idle, CallUIState::Detecting)].into();
        assert!((error_rate(&applied, &rejected) - 0.5).abs() < f64::EPSILON);
        assert_eq!(error_rate(&VecDeque::new(), &VecDeque::new()), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_and_loops_penalize_score() {
        let token = CallToken::new("call");
        let start = Instant::now();
        let history: VecDeque<_> = [
            CallUIState::Detecting,
            CallUIState::DetectionFailed,
            CallUIState::Retrying,
            CallUIState::Detecting,
            CallUIState::DetectionFailed,
            CallUIState::Retrying,
            CallUIState::Detecting,
        ]
        .into_iter()
        .map(|s| snapshot(s, start))
        .collect();

        let active = HashMap::from([(token.clone(), CallUIState::Detecting)]);
        let snapshots = HashMap::from([(token.clone(), history)]);
        let empty = VecDeque::new();
        let inputs = HealthInputs {
            active: &active,
            snapshots: &snapshots,
            applied: &empty,
            rejected: &empty,
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = analyze(&StateMachineConfig::default(), &inputs, Instant::now());

        assert_eq!(report.stuck_calls.len(), 1);
        assert_eq!(report.loops.len(), 1);
        assert_eq!(report.loops[0].state, CallUIState::Detecting);
        assert!((report.score - 0.85).abs() < 1e-9);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.category == RecommendationCategory::TransitionLoop));
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn test_high_error_rate_recommends_review() {
        let applied: VecDeque<_> = vec![
            transition(CallUIState::Detecting, CallUIState::DetectionFailed),
            transition(CallUIState::Retrying, CallUIState::RetryExhausted),
            transition(CallUIState::Idle, CallUIState::Initializing),
        ]
        .into();
        let empty_map = HashMap::new();
        let empty_snapshots = HashMap::new();
        let rejected = VecDeque::new();
        let inputs = HealthInputs {
            active: &empty_map,
            snapshots: &empty_snapshots,
            applied: &applied,
            rejected: &rejected,
        };

        let report = analyze(&StateMachineConfig::default(), &inputs, Instant::now());
        let first = &report.recommendations[0];
        assert_eq!(first.priority, RecommendationPriority::High);
        assert_eq!(first.category, RecommendationCategory::ErrorRate);
        assert!(first.message.contains("review"));
    }
}
