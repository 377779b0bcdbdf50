use thiserror::Error;

use super::{LifecycleState, OperationKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot {operation} a container in state {from} (allowed: {})", format_allowed(.allowed))]
    Illegal {
        from: LifecycleState,
        operation: OperationKind,
        allowed: Vec<OperationKind>,
    },

    #[error("No operation in flight for a container in state {state}")]
    NotInFlight { state: LifecycleState },
}

fn format_allowed(allowed: &[OperationKind]) -> String {
    allowed
        .iter()
        .map(OperationKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
