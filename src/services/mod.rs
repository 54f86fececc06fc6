//! Engines coordinating the call presentation.

pub mod call_state_machine;
pub mod circuit_breaker;
pub mod detection_engine;
pub mod notification_hub;
pub mod redetector;
pub mod retry_orchestrator;
pub mod state_health;
pub mod state_synchronizer;

pub use call_state_machine::CallUiStateMachine;
pub use circuit_breaker::{CircuitBreakerService, CircuitCheckResult, CircuitState, CircuitStats};
pub use detection_engine::DetectionEngine;
pub use notification_hub::{NotificationHub, NotificationHubConfig, ObserverId};
pub use redetector::DetectionRedetector;
pub use retry_orchestrator::RetryOrchestrator;
pub use state_synchronizer::{PresentationMirror, StateSynchronizer};
