//! Coordinator Errors
//!
//! Errors returned synchronously by [`Coordinator`](crate::Coordinator)
//! calls. Failures of the model itself are not here: those arrive as
//! `onError` events.

use thiserror::Error;

use crate::coordinator::CoordinatorState;

/// Errors returned by coordinator calls
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// An operation was issued before a successful load
    #[error("model is not ready (state: {state})")]
    NotReady {
        /// State the coordinator was in
        state: CoordinatorState,
    },

    /// An operation was issued while another one is running
    #[error("an operation is already in progress")]
    Busy,

    /// `load()` was called with a model already loaded
    #[error("model is already loaded")]
    AlreadyLoaded,

    /// `load()` was called while a load is running
    #[error("model is already loading")]
    LoadInProgress,

    /// The coordinator has been destroyed
    #[error("coordinator has been destroyed")]
    Destroyed,

    /// The model could not be loaded; the same reason was delivered as `onError`
    #[error("model load failed: {0}")]
    LoadFailed(String),
}

impl CoordinatorError {
    /// Whether the call was refused because of the coordinator's state
    #[must_use]
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::NotReady { .. }
                | Self::Busy
                | Self::AlreadyLoaded
                | Self::LoadInProgress
                | Self::Destroyed
        )
    }
}
