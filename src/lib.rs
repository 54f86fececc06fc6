//! callsync - native call UI coordination
//!
//! Keeps a call's presentation consistent between the platform's native
//! call UI and the app's own call screen.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): call state models, ports, and errors
//! - **Service Layer** (`services`): detection engine, retry orchestrator with
//!   circuit breaker, conflict-resolving synchronizer, call UI state machine
//! - **Application Layer** (`application`): explicit wiring and lifecycle fan-out
//! - **Infrastructure Layer** (`infrastructure`): config loading, logging, memory probe
//! - **Adapters** (`adapters`): scripted observation source
//! - **CLI Layer** (`cli`): simulator and config inspection
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use callsync::adapters::ScriptedObservationSource;
//! use callsync::application::CallCoordinator;
//! use callsync::domain::models::{AppForegroundState, CallObservation, CallToken, Config};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let source = Arc::new(ScriptedObservationSource::fixed(CallObservation::new(
//!     AppForegroundState::Active,
//!     vec![],
//! )));
//! let coordinator = CallCoordinator::new(Config::default(), source);
//! coordinator.start().await;
//!
//! let call = CallToken::generate();
//! coordinator.state_machine().initialize_call(&call, HashMap::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{CallCoordinator, LifecycleNotifier};
pub use domain::errors::{DetectionError, RetryError, StateMachineError, SyncError};
pub use domain::models::{CallToken, CallUIState, Config, LifecycleSignal, TransitionTrigger};
pub use domain::ports::{CallObservationSource, CallStateObserver, MemoryProbe, RedetectionAction};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CallUiStateMachine, DetectionEngine, NotificationHub, RetryOrchestrator, StateSynchronizer,
};
