use async_trait::async_trait;

use crate::domain::models::CallToken;

/// Port for the action a retry attempt performs.
///
/// The production wiring re-runs native UI detection for the call; tests
/// substitute scripted outcomes.
#[async_trait]
pub trait RedetectionAction: Send + Sync {
    /// Attempt to bring the native UI back for `call_token`.
    ///
    /// `Ok(())` means the native UI is confirmed active. The orchestrator
    /// enforces the per-attempt timeout around this call.
    async fn attempt(&self, call_token: &CallToken, attempt: u32) -> Result<(), String>;
}
