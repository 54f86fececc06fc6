//! Deterministic call-observation source.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::models::{AppForegroundState, CallObservation};
use crate::domain::ports::CallObservationSource;

/// Replays a fixed sequence of observations, repeating the last one forever.
///
/// Used by the CLI simulator and tests in place of a platform call API.
#[derive(Debug)]
pub struct ScriptedObservationSource {
    script: Mutex<VecDeque<CallObservation>>,
    last: Mutex<CallObservation>,
}

impl ScriptedObservationSource {
    pub fn new(script: impl IntoIterator<Item = CallObservation>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(CallObservation::new(AppForegroundState::Active, Vec::new())),
        }
    }

    /// Source that always reports the same observation.
    pub fn fixed(observation: CallObservation) -> Self {
        Self::new([observation])
    }

    /// Queue more observations after the current script.
    pub fn push(&self, observation: CallObservation) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(observation);
        }
    }

    /// Drop the remaining script and report `observation` from now on.
    pub fn set(&self, observation: CallObservation) {
        if let Ok(mut script) = self.script.lock() {
            script.clear();
            script.push_back(observation);
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl CallObservationSource for ScriptedObservationSource {
    fn observe(&self) -> CallObservation {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let Ok(mut last) = self.last.lock() else {
            return next.unwrap_or_else(|| {
                CallObservation::new(AppForegroundState::Active, Vec::new())
            });
        };
        if let Some(observation) = next {
            *last = observation;
        }
        last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SystemCall;

    #[test]
    fn test_replays_then_repeats_last() {
        let source = ScriptedObservationSource::new([
            CallObservation::new(AppForegroundState::Active, vec![]),
            CallObservation::new(AppForegroundState::Background, vec![SystemCall::new("a")]),
        ]);

        assert_eq!(source.observe().app_state, AppForegroundState::Active);
        assert_eq!(source.observe().app_state, AppForegroundState::Background);
        assert_eq!(source.observe().calls.len(), 1);
        assert_eq!(source.remaining(), 0);

        source.set(CallObservation::new(AppForegroundState::Inactive, vec![]));
        assert_eq!(source.observe().app_state, AppForegroundState::Inactive);
    }
}
