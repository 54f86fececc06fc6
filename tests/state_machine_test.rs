//! Call UI state machine driven through observers and the synchronizer.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callsync::domain::models::{
    CallToken, CallUIState, RecommendationCategory, StateMachineConfig, SyncConfig, SyncSource,
    TransitionTrigger,
};
use callsync::domain::ports::NullMemoryProbe;
use callsync::services::{CallUiStateMachine, NotificationHub, StateSynchronizer};
use callsync::StateMachineError;
use common::{wait_until, RecordingObserver};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

async fn stop(shutdown_tx: broadcast::Sender<()>, handles: Vec<JoinHandle<()>>) {
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
}

async fn states(machine: &CallUiStateMachine, token: &CallToken) -> Vec<CallUIState> {
    machine
        .get_state_history(token, usize::MAX)
        .await
        .into_iter()
        .map(|snapshot| snapshot.state)
        .collect()
}

fn machine() -> (Arc<CallUiStateMachine>, Arc<NotificationHub>, Arc<StateSynchronizer>) {
    machine_with(StateMachineConfig::default())
}

fn machine_with(
    config: StateMachineConfig,
) -> (Arc<CallUiStateMachine>, Arc<NotificationHub>, Arc<StateSynchronizer>) {
    let hub = NotificationHub::with_defaults();
    let synchronizer = Arc::new(StateSynchronizer::new(SyncConfig::default(), Arc::clone(&hub)));
    let machine = Arc::new(CallUiStateMachine::new(
        config,
        Arc::clone(&hub),
        Arc::clone(&synchronizer),
        Arc::new(NullMemoryProbe),
    ));
    (machine, hub, synchronizer)
}

#[tokio::test]
async fn test_observer_sees_every_transition_in_order() {
    let (machine, hub, _) = machine();
    let observer = RecordingObserver::new();
    hub.add_observer(&observer).await;
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    machine
        .transition_state(&token, CallUIState::Detecting, TransitionTrigger::UserAction, HashMap::new())
        .await
        .unwrap();

    let seen = wait_until(
        || {
            let observer = Arc::clone(&observer);
            async move { observer.transitions.lock().unwrap().len() == 2 }
        },
        1_000,
    )
    .await;
    assert!(seen);
    assert_eq!(
        *observer.transitions.lock().unwrap(),
        vec![
            (CallUIState::Idle, CallUIState::Initializing),
            (CallUIState::Initializing, CallUIState::Detecting),
        ]
    );
    assert_eq!(machine.get_all_active_states().await.len(), 1);
}

#[tokio::test]
async fn test_native_ui_report_ends_call() {
    let (machine, _, synchronizer) = machine();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = machine.start(&shutdown_tx);
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    machine
        .transition_state(&token, CallUIState::Detecting, TransitionTrigger::UserAction, HashMap::new())
        .await
        .unwrap();
    synchronizer
        .sync_state(SyncSource::CallKit, &token, None, CallUIState::Completed, HashMap::new())
        .await
        .unwrap();

    let ended = wait_until(
        || {
            let machine = Arc::clone(&machine);
            let token = token.clone();
            async move { machine.get_current_state(&token).await == Some(CallUIState::Completed) }
        },
        1_000,
    )
    .await;
    assert!(ended);
    assert!(machine.get_all_active_states().await.is_empty());

    stop(shutdown_tx, handles).await;
}

#[tokio::test]
async fn test_recommendations_are_not_repeated_while_valid() {
    let (machine, hub, _) = machine();
    let observer = RecordingObserver::new();
    hub.add_observer(&observer).await;
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    for _ in 0..3 {
        let err = machine
            .transition_state(&token, CallUIState::CallKitActive, TransitionTrigger::UserAction, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }
    assert_eq!(machine.rejected_transitions(10).await.len(), 3);

    let first = machine.analyze_health().await;
    assert!((first.error_rate - 0.75).abs() < 1e-9);
    assert!(first
        .recommendations
        .iter()
        .any(|r| r.category == RecommendationCategory::ErrorRate));
    let second = machine.analyze_health().await;
    assert_eq!(second.recommendations.len(), first.recommendations.len());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let error_rate_notices = observer
        .recommendations
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.category == RecommendationCategory::ErrorRate)
        .count();
    assert_eq!(error_rate_notices, 1);
}

#[tokio::test]
async fn test_concurrent_calls_are_tracked_independently() {
    let (machine, _, _) = machine();
    let tokens: Vec<CallToken> = (0..8).map(|i| CallToken::new(format!("call-{i}"))).collect();

    let results = futures::future::join_all(
        tokens
            .iter()
            .map(|token| machine.initialize_call(token, HashMap::new())),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    let active = machine.get_all_active_states().await;
    assert_eq!(active.len(), 8);
    assert!(active.values().all(|state| *state == CallUIState::Initializing));
    assert_eq!(machine.transition_log(100).await.len(), 8);
}

#[tokio::test]
async fn test_native_ui_report_does_not_fight_own_transitions() {
    let (machine, _, synchronizer) = machine();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = machine.start(&shutdown_tx);
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    machine
        .transition_state(&token, CallUIState::Detecting, TransitionTrigger::UserAction, HashMap::new())
        .await
        .unwrap();
    synchronizer
        .sync_state(SyncSource::CallKit, &token, None, CallUIState::CallKitActive, HashMap::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    machine
        .transition_state(
            &token,
            CallUIState::DetectionSucceeded,
            TransitionTrigger::DetectionResult,
            HashMap::new(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(machine.get_current_state(&token).await, Some(CallUIState::Backgrounding));
    assert!(machine.rejected_transitions(10).await.is_empty());
    assert_eq!(
        synchronizer.get_current_state(&token).await,
        Some(CallUIState::Backgrounding)
    );
    // Only the native UI report disagreed with the machine
    assert_eq!(synchronizer.metrics().await.conflicts_detected, 1);

    let report = machine.analyze_health().await;
    assert_eq!(report.error_rate, 0.0);
    assert!(!report
        .recommendations
        .iter()
        .any(|r| r.category == RecommendationCategory::ErrorRate));

    stop(shutdown_tx, handles).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_writer_per_call() {
    let (machine, _, _) = machine();
    let token = CallToken::new("call-1");
    machine.initialize_call(&token, HashMap::new()).await.unwrap();

    let race = |targets: Vec<CallUIState>| {
        let tasks = targets.into_iter().map(|to| {
            let machine = Arc::clone(&machine);
            let token = token.clone();
            tokio::spawn(async move {
                machine
                    .transition_state(&token, to, TransitionTrigger::UserAction, HashMap::new())
                    .await
            })
        });
        futures::future::join_all(tasks)
    };

    let results = race(vec![CallUIState::Detecting; 8]).await;
    let applied = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(applied, 1);
    assert!(results.iter().all(|r| matches!(
        r,
        Ok(Ok(_)) | Ok(Err(StateMachineError::InvalidTransition { .. }))
    )));

    let outcomes = [CallUIState::DetectionSucceeded, CallUIState::DetectionFailed];
    let results = race(outcomes.iter().copied().cycle().take(8).collect()).await;
    let applied = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(applied, 1);
    assert_eq!(machine.rejected_transitions(100).await.len(), 14);

    let history = states(&machine, &token).await;
    assert_eq!(&history[..3], &[CallUIState::Idle, CallUIState::Initializing, CallUIState::Detecting]);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].can_transition_to(pair[1])));
    assert!(matches!(
        machine.get_current_state(&token).await,
        Some(CallUIState::Backgrounding | CallUIState::Retrying)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_backgrounding_deadline_hands_off_to_retry() {
    let config = StateMachineConfig {
        backgrounding_timeout_ms: 2_000,
        ..StateMachineConfig::default()
    };
    let (machine, _, _) = machine_with(config);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = machine.start(&shutdown_tx);
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    for to in [CallUIState::Detecting, CallUIState::DetectionSucceeded] {
        machine
            .transition_state(&token, to, TransitionTrigger::SystemEvent, HashMap::new())
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(machine.get_current_state(&token).await, Some(CallUIState::Backgrounding));

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(machine.get_current_state(&token).await, Some(CallUIState::Retrying));

    let history = machine.get_state_history(&token, usize::MAX).await;
    let failed = history
        .iter()
        .find(|snapshot| snapshot.state == CallUIState::BackgroundingFailed)
        .unwrap();
    assert_eq!(failed.trigger, TransitionTrigger::TimeoutExpired);
    assert!(machine.rejected_transitions(10).await.is_empty());

    stop(shutdown_tx, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_backgrounding_signal_beats_deadline() {
    let config = StateMachineConfig {
        backgrounding_timeout_ms: 2_000,
        ..StateMachineConfig::default()
    };
    let (machine, _, _) = machine_with(config);
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = machine.start(&shutdown_tx);
    let token = CallToken::new("call-1");

    machine.initialize_call(&token, HashMap::new()).await.unwrap();
    for to in [CallUIState::Detecting, CallUIState::DetectionSucceeded] {
        machine
            .transition_state(&token, to, TransitionTrigger::SystemEvent, HashMap::new())
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(machine.handle_did_enter_background().await, 1);
    tokio::time::sleep(Duration::from_millis(3_000)).await;

    assert_eq!(machine.get_current_state(&token).await, Some(CallUIState::CallKitActive));
    assert!(!states(&machine, &token)
        .await
        .contains(&CallUIState::BackgroundingFailed));
    assert!(machine.rejected_transitions(10).await.is_empty());

    stop(shutdown_tx, handles).await;
}
