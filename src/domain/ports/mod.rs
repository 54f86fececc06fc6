//! Port trait definitions (Hexagonal Architecture)
//!
//! Contracts consumed from platform collaborators:
//! - CallObservationSource: app foreground state and live system calls
//! - RedetectionAction: what a retry attempt does
//! - MemoryProbe: resident memory for resource checks
//!
//! And the contract exposed to UI and diagnostics layers:
//! - CallStateObserver: typed state-change notifications

pub mod call_observation;
pub mod memory_probe;
pub mod observer;
pub mod redetection;

pub use call_observation::CallObservationSource;
pub use memory_probe::{MemoryProbe, NullMemoryProbe};
pub use observer::{CallNotification, CallStateObserver};
pub use redetection::RedetectionAction;
