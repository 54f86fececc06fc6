pub mod call_state;
pub mod config;
pub mod detection;
pub mod health;
pub mod lifecycle;
pub mod retry;
pub mod sync;

pub use call_state::{
    CallToken, CallUIState, PerformanceContext, StateSnapshot, StateTransition, SystemContext,
    TransitionTrigger, TransitionValidation,
};
pub use config::{
    CircuitBreakerConfig, Config, DetectionConfig, LoggingConfig, RetryConfig, StateMachineConfig,
    SyncConfig,
};
pub use detection::{
    AppForegroundState, CallKitUIState, CallObservation, DetectionEnd, DetectionEvent,
    DetectionResult, SystemCall,
};
pub use health::{
    HealthReport, Recommendation, RecommendationCategory, RecommendationPriority, StuckCall,
    TransitionLoop,
};
pub use lifecycle::LifecycleSignal;
pub use retry::{
    RetryConfiguration, RetryEvent, RetryOperation, RetryResult, RetryStrategy, StrategyOutcome,
};
pub use sync::{
    ConflictResolution, HealthTrend, SequenceNumber, StateSyncEvent, SyncApplied, SyncConflict,
    SyncHealthMetrics, SyncSource,
};
