//! State synchronizer seen through observers and configured priorities.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use callsync::domain::models::{CallToken, CallUIState, ConflictResolution, SyncConfig, SyncSource};
use callsync::services::{NotificationHub, StateSynchronizer};
use common::{wait_until, RecordingObserver};

#[tokio::test]
async fn test_observer_sees_sync_and_conflict() {
    let hub = NotificationHub::with_defaults();
    let sync = StateSynchronizer::new(SyncConfig::default(), Arc::clone(&hub));
    let observer = RecordingObserver::new();
    let id = sync.add_observer(&observer).await;
    let token = CallToken::new("call-1");

    sync.sync_state(SyncSource::CallKit, &token, None, CallUIState::CallKitActive, HashMap::new())
        .await
        .unwrap();
    sync.sync_state(SyncSource::Backend, &token, None, CallUIState::FallbackUIActive, HashMap::new())
        .await
        .unwrap();

    let seen = wait_until(
        || {
            let observer = Arc::clone(&observer);
            async move { observer.count("did_resolve_conflict") == 1 }
        },
        1_000,
    )
    .await;
    assert!(seen);
    assert_eq!(observer.count("did_sync"), 2);
    assert_eq!(observer.count("did_detect_conflict"), 1);
    let events = observer.events();
    let detect = events.iter().position(|e| e == "did_detect_conflict").unwrap();
    let resolve = events.iter().position(|e| e == "did_resolve_conflict").unwrap();
    assert!(detect < resolve);

    assert!(sync.remove_observer(id).await);
    sync.sync_state(SyncSource::CallKit, &token, None, CallUIState::Completed, HashMap::new())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(observer.count("did_sync"), 2);
}

#[tokio::test]
async fn test_configured_priority_overrides_default() {
    let mut config = SyncConfig::default();
    config.source_priorities.insert(SyncSource::Backend, 150);
    let sync = StateSynchronizer::new(config, NotificationHub::with_defaults());
    let token = CallToken::new("call-1");

    sync.sync_state(SyncSource::CallKit, &token, None, CallUIState::CallKitActive, HashMap::new())
        .await
        .unwrap();
    let event = sync
        .sync_state(SyncSource::Backend, &token, None, CallUIState::Terminated, HashMap::new())
        .await
        .unwrap();

    assert_eq!(event.priority, 150);
    assert_eq!(sync.get_current_state(&token).await, Some(CallUIState::Terminated));
    let history = sync.conflict_history(1).await;
    assert_eq!(history[0].resolution, ConflictResolution::PriorityBased);
    assert_eq!(history[0].winner, SyncSource::Backend);
}

#[tokio::test]
async fn test_agreeing_reports_do_not_conflict() {
    let sync = StateSynchronizer::new(SyncConfig::default(), NotificationHub::with_defaults());
    let token = CallToken::new("call-1");
    let other = CallToken::new("call-2");

    sync.sync_state(SyncSource::CallKit, &token, None, CallUIState::CallKitActive, HashMap::new())
        .await
        .unwrap();
    sync.sync_state(SyncSource::Backend, &token, None, CallUIState::CallKitActive, HashMap::new())
        .await
        .unwrap();
    sync.sync_state(SyncSource::Backend, &other, None, CallUIState::FallbackUIActive, HashMap::new())
        .await
        .unwrap();

    assert!(sync.get_current_conflicts().await.is_empty());
    assert_eq!(sync.metrics().await.conflicts_detected, 0);
    assert_eq!(sync.get_current_state(&other).await, Some(CallUIState::FallbackUIActive));

    sync.clear_call(&token).await;
    assert_eq!(sync.get_current_state(&token).await, None);
    assert!(sync.get_presentation(&token).await.is_none());
    assert_eq!(sync.get_recent_events(10).await.len(), 3);
}
