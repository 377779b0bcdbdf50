use thiserror::Error;

use crate::models::DriverFailure;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Transient failure (network, timeout, busy host). Retrying may succeed.
    #[error("Recoverable driver error: {0}")]
    Recoverable(String),

    /// The host refused the operation (bad template, no resources, ...).
    #[error("Terminal driver error: {0}")]
    Terminal(String),
}

impl DriverError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        DriverError::Recoverable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        DriverError::Terminal(message.into())
    }

    pub fn failure(&self) -> DriverFailure {
        match self {
            DriverError::Recoverable(_) => DriverFailure::Recoverable,
            DriverError::Terminal(_) => DriverFailure::Terminal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DriverError::Recoverable(message) | DriverError::Terminal(message) => message,
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => DriverError::Terminal(err.to_string()),
            _ => DriverError::Recoverable(err.to_string()),
        }
    }
}
