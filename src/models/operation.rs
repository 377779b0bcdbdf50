use serde::{Deserialize, Serialize};

use super::{CallerIdentity, CompletedOperation, ContainerRecord, ContainerSpec};
use crate::driver::ObservedState;
use crate::lifecycle::{LifecycleState, OperationKind};

/// One call into the orchestrator. Lives only for the duration of that call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub container_id: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub caller: Option<CallerIdentity>,
    /// Only read for `Create`.
    #[serde(default)]
    pub spec: Option<ContainerSpec>,
}

impl OperationRequest {
    pub fn new(container_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            container_id: container_id.into(),
            kind,
            idempotency_key: None,
            caller: None,
            spec: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(CallerIdentity(caller.into()));
        self
    }

    pub fn with_spec(mut self, spec: ContainerSpec) -> Self {
        self.spec = Some(spec);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub kind: OperationKind,
    /// State the operation left the container in.
    pub state: LifecycleState,
    pub generation: u64,
    /// Current record as read or written by this call.
    pub container: ContainerRecord,
    /// Set when an earlier call with the same idempotency key already did the work.
    pub replayed: bool,
    /// What the driver reported, for `Inspect`.
    pub observed: Option<ObservedState>,
    pub warning: Option<String>,
}

impl OperationOutcome {
    pub(crate) fn committed(kind: OperationKind, container: ContainerRecord) -> Self {
        Self {
            kind,
            state: container.state(),
            generation: container.generation(),
            container,
            replayed: false,
            observed: None,
            warning: None,
        }
    }

    pub(crate) fn replay(
        kind: OperationKind,
        prior: &CompletedOperation,
        container: ContainerRecord,
    ) -> Self {
        Self {
            kind,
            state: prior.state,
            generation: prior.generation,
            container,
            replayed: true,
            observed: None,
            warning: None,
        }
    }
}

/// Result of resolving one interrupted operation at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub container_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub observed: Option<ObservedState>,
}
