use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::lifecycle::LifecycleNotifier;
use crate::domain::models::{Config, LifecycleSignal};
use crate::domain::ports::{CallObservationSource, CallStateObserver, MemoryProbe, RedetectionAction};
use crate::infrastructure::system::SysinfoMemoryProbe;
use crate::services::{
    CallUiStateMachine, CircuitBreakerService, DetectionEngine, DetectionRedetector,
    NotificationHub, NotificationHubConfig, ObserverId, RetryOrchestrator, StateSynchronizer,
};

/// Owns and wires every engine for one process.
///
/// Engines reference each other only through the handles passed in here;
/// there are no globals. Background tasks run from [`CallCoordinator::start`]
/// until [`CallCoordinator::shutdown`].
pub struct CallCoordinator {
    config: Config,
    hub: Arc<NotificationHub>,
    detection: Arc<DetectionEngine>,
    breaker: Arc<CircuitBreakerService>,
    retry: Arc<RetryOrchestrator>,
    synchronizer: Arc<StateSynchronizer>,
    state_machine: Arc<CallUiStateMachine>,
    lifecycle: LifecycleNotifier,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CallCoordinator {
    /// Wire the production stack: sysinfo memory probe and detection-backed
    /// re-detection.
    pub fn new(config: Config, source: Arc<dyn CallObservationSource>) -> Arc<Self> {
        Self::with_parts(config, source, Arc::new(SysinfoMemoryProbe::new()), None)
    }

    /// Wire with explicit collaborators. Without `action`, retries re-run
    /// detection against `source`.
    pub fn with_parts(
        config: Config,
        source: Arc<dyn CallObservationSource>,
        memory: Arc<dyn MemoryProbe>,
        action: Option<Arc<dyn RedetectionAction>>,
    ) -> Arc<Self> {
        let hub = NotificationHub::start(NotificationHubConfig::default());
        let detection = Arc::new(DetectionEngine::new(
            config.detection.clone(),
            Arc::clone(&source),
        ));
        let breaker = Arc::new(CircuitBreakerService::new(config.circuit_breaker.clone()));
        let action = action.unwrap_or_else(|| {
            Arc::new(DetectionRedetector::new(Arc::clone(&detection))) as Arc<dyn RedetectionAction>
        });
        let retry = Arc::new(RetryOrchestrator::new(
            config.retry.clone(),
            Arc::clone(&breaker),
            action,
            Arc::clone(&memory),
        ));
        let synchronizer = Arc::new(StateSynchronizer::new(
            config.sync.clone(),
            Arc::clone(&hub),
        ));
        let state_machine = Arc::new(
            CallUiStateMachine::new(
                config.state_machine.clone(),
                Arc::clone(&hub),
                Arc::clone(&synchronizer),
                memory,
            )
            .with_detection(Arc::clone(&detection))
            .with_retry(Arc::clone(&retry))
            .with_observation_source(source),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            hub,
            detection,
            breaker,
            retry,
            synchronizer,
            state_machine,
            lifecycle: LifecycleNotifier::default(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn detection(&self) -> &Arc<DetectionEngine> {
        &self.detection
    }

    pub fn breaker(&self) -> &Arc<CircuitBreakerService> {
        &self.breaker
    }

    pub fn retry(&self) -> &Arc<RetryOrchestrator> {
        &self.retry
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    pub fn state_machine(&self) -> &Arc<CallUiStateMachine> {
        &self.state_machine
    }

    pub fn lifecycle(&self) -> &LifecycleNotifier {
        &self.lifecycle
    }

    pub async fn add_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: CallStateObserver + 'static,
    {
        self.hub.add_observer(observer).await
    }

    /// Spawn the engine listeners and periodic tasks. Calling twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = self.state_machine.start(&self.shutdown_tx);
        handles.push(
            self.retry
                .start_history_sweep(self.shutdown_tx.subscribe()),
        );
        handles.push(
            self.synchronizer
                .start_metrics_task(self.shutdown_tx.subscribe()),
        );
        handles.push(self.spawn_lifecycle_listener());

        info!(tasks = handles.len(), "Call coordinator started");
        self.tasks.lock().await.extend(handles);
    }

    fn spawn_lifecycle_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut signals = self.lifecycle.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(signal) => coordinator.handle_signal(signal).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Lifecycle listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Apply a lifecycle signal to every engine directly.
    pub async fn handle_signal(&self, signal: LifecycleSignal) {
        match signal {
            LifecycleSignal::DidEnterBackground => {
                let completed = self.state_machine.handle_did_enter_background().await;
                debug!(completed, "Backgrounding completed on lifecycle signal");
            }
            LifecycleSignal::WillEnterForeground => {
                debug!("App returning to foreground");
            }
            LifecycleSignal::MemoryPressure => {
                let shed = self.detection.handle_memory_pressure().await;
                self.retry.handle_memory_pressure().await;
                warn!(shed, "Memory pressure handled");
            }
        }
    }

    /// Stop background tasks and cancel outstanding work.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        self.detection.stop_all().await;
        self.retry.stop_all().await;
        self.started.store(false, Ordering::SeqCst);
        info!("Call coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{AppForegroundState, CallObservation, CallToken, CallUIState, SystemCall};
    use crate::domain::ports::NullMemoryProbe;
    use std::collections::HashMap;

    struct Backgrounded;

    impl CallObservationSource for Backgrounded {
        fn observe(&self) -> CallObservation {
            CallObservation::new(AppForegroundState::Background, vec![SystemCall::new("call-1")])
        }
    }

    #[tokio::test]
    async fn test_wired_stack_reaches_native_ui() {
        let mut config = Config::default();
        config.detection.poll_interval_ms = 10;
        let coordinator =
            CallCoordinator::with_parts(config, Arc::new(Backgrounded), Arc::new(NullMemoryProbe), None);
        coordinator.start().await;

        let machine = coordinator.state_machine();
        let token = CallToken::new("call-1");
        machine.initialize_call(&token, HashMap::new()).await.unwrap();
        machine
            .transition_state(
                &token,
                CallUIState::Detecting,
                crate::domain::models::TransitionTrigger::UserAction,
                HashMap::new(),
            )
            .await
            .unwrap();

        let mut reached = false;
        for _ in 0..100 {
            if machine.get_current_state(&token).await == Some(CallUIState::CallKitActive) {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reached);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_pressure_refuses_new_work() {
        let coordinator = CallCoordinator::with_parts(
            Config::default(),
            Arc::new(Backgrounded),
            Arc::new(NullMemoryProbe),
            None,
        );
        coordinator.handle_signal(LifecycleSignal::MemoryPressure).await;

        let token = CallToken::new("call-1");
        assert!(coordinator
            .detection()
            .start_detection(&token, HashMap::new())
            .await
            .is_err());
        assert!(coordinator.retry().start_retry(&token, None, None).await.is_err());
    }
}
