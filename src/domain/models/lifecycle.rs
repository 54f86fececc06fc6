use serde::{Deserialize, Serialize};

/// App lifecycle signal broadcast to every engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    DidEnterBackground,
    WillEnterForeground,
    MemoryPressure,
}

impl LifecycleSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DidEnterBackground => "did_enter_background",
            Self::WillEnterForeground => "will_enter_foreground",
            Self::MemoryPressure => "memory_pressure",
        }
    }
}
