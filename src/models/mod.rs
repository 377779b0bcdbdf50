pub mod container;
pub mod operation;

pub use container::{
    validate_container_id, CallerIdentity, CompletedOperation, ContainerRecord, ContainerSpec,
    DriverFailure, ErrorDetail,
};
pub use operation::{OperationOutcome, OperationRequest, Reconciliation};
