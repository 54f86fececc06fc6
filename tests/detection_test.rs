//! Detection engine against a changing observation source.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callsync::domain::models::{
    AppForegroundState, CallKitUIState, CallObservation, CallToken, DetectionConfig, DetectionEnd,
    DetectionEvent, SystemCall,
};
use callsync::services::DetectionEngine;
use callsync::DetectionError;
use common::FakeObservationSource;

fn lag_platform() -> DetectionConfig {
    DetectionConfig {
        presentation_lag_defect: true,
        lag_poll_interval_ms: 100,
        ..DetectionConfig::default()
    }
}

async fn next_finalized(
    events: &mut tokio::sync::broadcast::Receiver<DetectionEvent>,
) -> (CallKitUIState, DetectionEnd, u32) {
    loop {
        if let DetectionEvent::Finalized { result, reason } = events.recv().await.unwrap() {
            return (result.final_state, reason, result.attempt_count);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_call_transitions_then_lands_in_native_ui() {
    let token = CallToken::new("call-1");
    let source = FakeObservationSource::new(CallObservation::new(
        AppForegroundState::Active,
        vec![SystemCall::new("call-1").outgoing()],
    ));
    let engine = DetectionEngine::new(lag_platform(), source.clone());
    let mut events = engine.subscribe();

    engine.start_detection(&token, HashMap::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        engine.get_current_state(&token).await,
        Some(CallKitUIState::Transitioning)
    );

    source.set(CallObservation::new(
        AppForegroundState::Background,
        vec![SystemCall::new("call-1").outgoing().connected()],
    ));

    let (state, reason, attempts) = next_finalized(&mut events).await;
    assert_eq!(state, CallKitUIState::CallKitActive);
    assert_eq!(reason, DetectionEnd::Stable);
    assert!(attempts >= 3);
    assert!(!engine.is_monitoring(&token).await);
}

#[tokio::test(start_paused = true)]
async fn test_busy_system_polls_until_timeout_then_fails() {
    let token = CallToken::new("call-1");
    let source = FakeObservationSource::new(CallObservation::new(
        AppForegroundState::Active,
        vec![SystemCall::new("call-1"), SystemCall::new("other")],
    ));
    let engine = DetectionEngine::new(DetectionConfig::default(), source);
    let mut events = engine.subscribe();

    engine.start_detection(&token, HashMap::new()).await.unwrap();
    let (state, reason, _) = next_finalized(&mut events).await;

    assert_eq!(state, CallKitUIState::Failed);
    assert_eq!(reason, DetectionEnd::TimedOut);
    assert_eq!(engine.get_current_state(&token).await, None);
}

#[tokio::test]
async fn test_concurrency_limit_and_restart_after_stop() {
    let source = FakeObservationSource::new(CallObservation::new(AppForegroundState::Inactive, vec![]));
    let config = DetectionConfig {
        max_concurrent_detections: 2,
        ..DetectionConfig::default()
    };
    let engine = Arc::new(DetectionEngine::new(config, source));

    let a = CallToken::new("a");
    let b = CallToken::new("b");
    let c = CallToken::new("c");
    engine.start_detection(&a, HashMap::new()).await.unwrap();
    engine.start_detection(&b, HashMap::new()).await.unwrap();

    assert_eq!(
        engine.start_detection(&c, HashMap::new()).await,
        Err(DetectionError::ConcurrentDetectionLimit { limit: 2 })
    );
    assert_eq!(
        engine.start_detection(&a, HashMap::new()).await,
        Err(DetectionError::AlreadyMonitoring(a.clone()))
    );

    assert!(engine.stop_detection(&a).await);
    assert!(!engine.stop_detection(&a).await);
    engine.start_detection(&c, HashMap::new()).await.unwrap();
    assert_eq!(engine.monitored_count().await, 2);

    engine.stop_all().await;
    assert_eq!(engine.monitored_count().await, 0);
}
