//! Container lifecycle state machine.
//!
//! Everything in this module is pure: given a state and an operation it decides
//! what happens next, without touching the store or the host. It is the only
//! place that produces a [`LifecycleState`] for a container record.

mod error;

pub use error::TransitionError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::driver::ObservedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Absent,
    Creating,
    Stopped,
    Starting,
    Running,
    Stopping,
    Destroying,
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Absent,
        LifecycleState::Creating,
        LifecycleState::Stopped,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Destroying,
        LifecycleState::Failed,
    ];

    pub const TRANSITIONAL: [LifecycleState; 4] = [
        LifecycleState::Creating,
        LifecycleState::Starting,
        LifecycleState::Stopping,
        LifecycleState::Destroying,
    ];

    /// True while a driver call is (or was, before a crash) in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            LifecycleState::Creating
                | LifecycleState::Starting
                | LifecycleState::Stopping
                | LifecycleState::Destroying
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Absent => "ABSENT",
            LifecycleState::Creating => "CREATING",
            LifecycleState::Stopped => "STOPPED",
            LifecycleState::Starting => "STARTING",
            LifecycleState::Running => "RUNNING",
            LifecycleState::Stopping => "STOPPING",
            LifecycleState::Destroying => "DESTROYING",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle state: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Restart,
    Destroy,
    Inspect,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Create,
        OperationKind::Start,
        OperationKind::Stop,
        OperationKind::Restart,
        OperationKind::Destroy,
        OperationKind::Inspect,
    ];

    /// Everything except `Inspect` goes through the lock manager.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, OperationKind::Inspect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Start => "START",
            OperationKind::Stop => "STOP",
            OperationKind::Restart => "RESTART",
            OperationKind::Destroy => "DESTROY",
            OperationKind::Inspect => "INSPECT",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind: {s}"))
    }
}

/// Computes the state a container enters when `operation` is requested from `current`.
///
/// For mutating operations the result is the transitional state that is persisted
/// before the driver is called. `Inspect` always maps a state onto itself.
pub fn transition(
    current: LifecycleState,
    operation: OperationKind,
) -> Result<LifecycleState, TransitionError> {
    use LifecycleState::*;
    use OperationKind::*;

    match (current, operation) {
        (state, Inspect) => Ok(state),
        (Absent, Create) => Ok(Creating),
        (Stopped, Start) => Ok(Starting),
        (Running, Stop) => Ok(Stopping),
        (Running, Restart) => Ok(Starting),
        (Stopped, Destroy) => Ok(Destroying),
        // Force removal of a container whose last operation failed
        (Failed, Destroy) => Ok(Destroying),
        (from, operation) => Err(TransitionError::Illegal {
            from,
            operation,
            allowed: allowed_operations(from),
        }),
    }
}

/// The "driver success" edge out of a transitional state.
pub fn on_driver_success(transitional: LifecycleState) -> Result<LifecycleState, TransitionError> {
    match transitional {
        LifecycleState::Creating => Ok(LifecycleState::Stopped),
        LifecycleState::Starting => Ok(LifecycleState::Running),
        LifecycleState::Stopping => Ok(LifecycleState::Stopped),
        LifecycleState::Destroying => Ok(LifecycleState::Absent),
        state => Err(TransitionError::NotInFlight { state }),
    }
}

/// The "driver failure" edge out of a transitional state.
pub fn on_driver_failure(transitional: LifecycleState) -> Result<LifecycleState, TransitionError> {
    if transitional.is_transitional() {
        Ok(LifecycleState::Failed)
    } else {
        Err(TransitionError::NotInFlight {
            state: transitional,
        })
    }
}

/// Operations that [`transition`] accepts from `state`.
pub fn allowed_operations(state: LifecycleState) -> Vec<OperationKind> {
    OperationKind::ALL
        .into_iter()
        .filter(|operation| match (state, operation) {
            (_, OperationKind::Inspect) => true,
            (LifecycleState::Absent, OperationKind::Create) => true,
            (LifecycleState::Stopped, OperationKind::Start | OperationKind::Destroy) => true,
            (LifecycleState::Running, OperationKind::Stop | OperationKind::Restart) => true,
            (LifecycleState::Failed, OperationKind::Destroy) => true,
            _ => false,
        })
        .collect()
}

/// Resolves an interrupted operation against what the host actually reports.
///
/// Observed ground truth always wins over a stale transitional marker. States that
/// are not transitional are left alone.
pub fn reconcile(current: LifecycleState, observed: ObservedState) -> LifecycleState {
    if !current.is_transitional() {
        return current;
    }

    match observed {
        ObservedState::Missing => LifecycleState::Absent,
        ObservedState::Stopped => LifecycleState::Stopped,
        ObservedState::Running => LifecycleState::Running,
        ObservedState::Unknown => LifecycleState::Failed,
    }
}

/// The operation most likely in flight when a container was left in `state`.
///
/// Only a fallback for markers that do not carry their operation: `Starting` is
/// written by both `Start` and `Restart` and maps to `Start` here.
pub fn interrupted_operation(state: LifecycleState) -> Option<OperationKind> {
    match state {
        LifecycleState::Creating => Some(OperationKind::Create),
        LifecycleState::Starting => Some(OperationKind::Start),
        LifecycleState::Stopping => Some(OperationKind::Stop),
        LifecycleState::Destroying => Some(OperationKind::Destroy),
        _ => None,
    }
}

/// Whether what the host reports is consistent with the persisted state.
///
/// In-flight and failed containers can legitimately be in any host state.
pub fn agrees_with(state: LifecycleState, observed: ObservedState) -> bool {
    match (state, observed) {
        (LifecycleState::Absent, ObservedState::Missing)
        | (LifecycleState::Stopped, ObservedState::Stopped)
        | (LifecycleState::Running, ObservedState::Running) => true,
        (LifecycleState::Failed, _) => true,
        (state, _) => state.is_transitional(),
    }
}
