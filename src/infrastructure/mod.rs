//! Infrastructure layer module
//!
//! Implementations that touch the host:
//! - Configuration management
//! - Logging infrastructure
//! - Process memory sampling

pub mod config;
pub mod logging;
pub mod system;
