//! Layered configuration: built-in defaults, `.callsync/` YAML files, then
//! `CALLSYNC_*` environment variables.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
