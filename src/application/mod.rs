//! Application layer: wiring and lifecycle fan-out.

pub mod coordinator;
pub mod lifecycle;

pub use coordinator::CallCoordinator;
pub use lifecycle::LifecycleNotifier;
