//! Domain layer for callsync
//!
//! Core call-presentation models, the contracts consumed from platform
//! collaborators, and the error taxonomy shared by every engine.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DetectionError, RetryError, StateMachineError, SyncError};
