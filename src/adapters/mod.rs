//! Adapters implementing the domain ports.

pub mod scripted_observation;

pub use scripted_observation::ScriptedObservationSource;
