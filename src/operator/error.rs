use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::{LifecycleState, OperationKind};
use crate::store::StoreError;

/// Stable error codes for the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidTransition,
    LockTimeout,
    DriverRecoverable,
    DriverTerminal,
    NotFound,
    StoreConflict,
    InvalidSpec,
    Store,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::LockTimeout => "LOCK_TIMEOUT",
            ErrorKind::DriverRecoverable => "DRIVER_RECOVERABLE",
            ErrorKind::DriverTerminal => "DRIVER_TERMINAL",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::StoreConflict => "STORE_CONFLICT",
            ErrorKind::InvalidSpec => "INVALID_SPEC",
            ErrorKind::Store => "STORE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Cannot {operation} container {id} in state {state} (allowed: {allowed:?})")]
    InvalidTransition {
        id: String,
        state: LifecycleState,
        operation: OperationKind,
        allowed: Vec<OperationKind>,
    },

    #[error("Container {id} is busy: lock not acquired within {waited:?}")]
    LockTimeout { id: String, waited: Duration },

    #[error("{operation} on container {id} failed, retry later: {detail}")]
    DriverRecoverable {
        id: String,
        operation: OperationKind,
        state: LifecycleState,
        detail: String,
    },

    #[error("{operation} on container {id} failed permanently: {detail}")]
    DriverTerminal {
        id: String,
        operation: OperationKind,
        state: LifecycleState,
        detail: String,
    },

    #[error("Container {id} not found")]
    NotFound { id: String },

    #[error("Container {id} was modified concurrently (state {state:?}); re-read and retry")]
    StoreConflict {
        id: String,
        state: Option<LifecycleState>,
    },

    #[error("Invalid request: {0}")]
    InvalidSpec(String),

    #[error("Store error: {0}")]
    Store(#[source] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OrchestratorError::LockTimeout { .. } => ErrorKind::LockTimeout,
            OrchestratorError::DriverRecoverable { .. } => ErrorKind::DriverRecoverable,
            OrchestratorError::DriverTerminal { .. } => ErrorKind::DriverTerminal,
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::StoreConflict { .. } => ErrorKind::StoreConflict,
            OrchestratorError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            OrchestratorError::Store(_) => ErrorKind::Store,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The container's state when the error was raised, where known.
    pub fn state(&self) -> Option<LifecycleState> {
        match self {
            OrchestratorError::InvalidTransition { state, .. }
            | OrchestratorError::DriverRecoverable { state, .. }
            | OrchestratorError::DriverTerminal { state, .. } => Some(*state),
            OrchestratorError::NotFound { .. } => Some(LifecycleState::Absent),
            OrchestratorError::StoreConflict { state, .. } => *state,
            _ => None,
        }
    }

    /// Whether re-sending the same request (same idempotency key) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::LockTimeout { .. }
                | OrchestratorError::DriverRecoverable { .. }
                | OrchestratorError::StoreConflict { .. }
        )
    }

    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidTransition | ErrorKind::LockTimeout | ErrorKind::StoreConflict => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidSpec => 422,
            ErrorKind::DriverRecoverable => 503,
            ErrorKind::DriverTerminal => 502,
            ErrorKind::Store | ErrorKind::Internal => 500,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id, .. } => OrchestratorError::StoreConflict { id, state: None },
            other => OrchestratorError::Store(other),
        }
    }
}
