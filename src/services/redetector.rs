use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::models::CallToken;
use crate::domain::ports::RedetectionAction;
use crate::services::detection_engine::DetectionEngine;

/// Retry action that re-samples the call-observation source.
///
/// An attempt succeeds only when the one-shot classification says the
/// native UI owns the call.
pub struct DetectionRedetector {
    detection: Arc<DetectionEngine>,
}

impl DetectionRedetector {
    pub fn new(detection: Arc<DetectionEngine>) -> Self {
        Self { detection }
    }
}

#[async_trait]
impl RedetectionAction for DetectionRedetector {
    async fn attempt(&self, call_token: &CallToken, attempt: u32) -> Result<(), String> {
        let result = self
            .detection
            .probe_once(call_token)
            .map_err(|e| e.to_string())?;

        tracing::debug!(
            call_token = %call_token,
            attempt,
            state = result.final_state.as_str(),
            "Re-detection probe"
        );

        if result.is_success() {
            Ok(())
        } else {
            Err(format!(
                "native call UI not active ({})",
                result.final_state.as_str()
            ))
        }
    }
}
