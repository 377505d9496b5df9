//! Coordinator State

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a coordinator
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    /// Nothing loaded (also the state after `destroy()`)
    #[default]
    Idle,
    /// A load is running
    Loading,
    /// A model is loaded and no operation is running
    Ready,
    /// An operation is running
    Busy,
    /// The last load or operation failed
    Error,
}

impl CoordinatorState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }

    /// Human-readable description for status displays
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Idle => "No model loaded",
            Self::Loading => "Loading model...",
            Self::Ready => "Ready",
            Self::Busy => "Working...",
            Self::Error => "Something went wrong",
        }
    }

    /// Whether a load is allowed to start from this state
    #[must_use]
    pub fn accepts_load(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
