//! Lifecycle orchestration for LXC containers.
//!
//! Requests enter through [`Orchestrator::execute`], are serialized per container,
//! validated against the [`lifecycle`] state machine, recorded in a [`store::StateStore`]
//! and carried out by a [`driver::HostDriver`].

pub mod driver;
pub mod lifecycle;
pub mod models;
pub mod operator;
pub mod shared;
pub mod store;

pub use driver::{DriverError, HostDriver, MockDriver, ObservedState, ProxmoxDriver};
pub use lifecycle::{LifecycleState, OperationKind};
pub use models::{ContainerRecord, ContainerSpec, OperationOutcome, OperationRequest};
pub use operator::{ErrorKind, Orchestrator, OrchestratorError};
pub use shared::config::{Config, OrchestratorConfig};
pub use store::{MemoryStore, SqliteStore, StateStore};
