use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lifecycle::{LifecycleState, OperationKind};

pub const MAX_NAME_LEN: usize = 255;

// Resource bounds, in cores and megabytes
pub const CORES_RANGE: (u32, u32) = (1, 64);
pub const MEMORY_MB_RANGE: (u32, u32) = (256, 32768);
pub const SWAP_MB_RANGE: (u32, u32) = (0, 16384);
pub const DISK_MB_RANGE: (u32, u32) = (1024, 1048576);

/// Resources a container is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub template: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_swap_mb")]
    pub swap_mb: u32,
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u32,
}

fn default_cores() -> u32 {
    1
}

fn default_memory_mb() -> u32 {
    512
}

fn default_swap_mb() -> u32 {
    512
}

fn default_disk_mb() -> u32 {
    10240
}

impl ContainerSpec {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            cores: default_cores(),
            memory_mb: default_memory_mb(),
            swap_mb: default_swap_mb(),
            disk_mb: default_disk_mb(),
        }
    }

    /// Checks the spec against the host limits, returning a readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.template.is_empty() || self.template.len() > MAX_NAME_LEN {
            return Err(format!(
                "template must be between 1 and {MAX_NAME_LEN} characters"
            ));
        }
        check_range("cores", self.cores, CORES_RANGE)?;
        check_range("memory_mb", self.memory_mb, MEMORY_MB_RANGE)?;
        check_range("swap_mb", self.swap_mb, SWAP_MB_RANGE)?;
        check_range("disk_mb", self.disk_mb, DISK_MB_RANGE)?;
        Ok(())
    }
}

fn check_range(field: &str, value: u32, (min, max): (u32, u32)) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!("{field} must be between {min} and {max}, got {value}"));
    }
    Ok(())
}

pub fn validate_container_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_NAME_LEN {
        return Err(format!(
            "container id must be between 1 and {MAX_NAME_LEN} characters"
        ));
    }
    Ok(())
}

/// Opaque identity of whoever requested an operation. Recorded for audit only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity(pub String);

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverFailure {
    Recoverable,
    Terminal,
}

/// Error recorded on a container whose last operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub failure: DriverFailure,
    pub operation: OperationKind,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// A successfully committed operation, kept for idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOperation {
    pub idempotency_key: String,
    pub kind: OperationKind,
    pub state: LifecycleState,
    pub generation: u64,
    pub caller: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Persisted view of one container.
///
/// Fields are read-only outside the crate. The lifecycle state is only ever set from
/// values computed by [`crate::lifecycle`], through the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    id: String,
    state: LifecycleState,
    spec: ContainerSpec,
    last_error: Option<ErrorDetail>,
    updated_at: DateTime<Utc>,
    generation: u64,
    revision: u64,
    last_caller: Option<String>,
    /// Operation that wrote the current transitional marker.
    #[serde(default)]
    in_flight: Option<OperationKind>,
    #[serde(default)]
    operations: Vec<CompletedOperation>,
}

impl ContainerRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn last_error(&self) -> Option<&ErrorDetail> {
        self.last_error.as_ref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Number of committed state changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Store write counter used for compare-and-set.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_caller(&self) -> Option<&str> {
        self.last_caller.as_deref()
    }

    /// The operation behind a transitional state. `None` once the outcome is committed.
    pub fn in_flight(&self) -> Option<OperationKind> {
        self.in_flight
    }

    pub fn operations(&self) -> &[CompletedOperation] {
        &self.operations
    }

    /// Finds a committed operation with the same idempotency key and kind.
    pub fn find_completed(&self, key: &str, kind: OperationKind) -> Option<&CompletedOperation> {
        self.operations
            .iter()
            .rev()
            .find(|op| op.idempotency_key == key && op.kind == kind)
    }

    // Mutators below are crate-private; callers pass states computed by the
    // lifecycle module.

    pub(crate) fn new_absent(id: &str, spec: ContainerSpec) -> Self {
        Self {
            id: id.to_string(),
            state: LifecycleState::Absent,
            spec,
            last_error: None,
            updated_at: Utc::now(),
            generation: 0,
            revision: 0,
            last_caller: None,
            in_flight: None,
            operations: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: String,
        state: LifecycleState,
        spec: ContainerSpec,
        last_error: Option<ErrorDetail>,
        updated_at: DateTime<Utc>,
        generation: u64,
        revision: u64,
        last_caller: Option<String>,
        in_flight: Option<OperationKind>,
        operations: Vec<CompletedOperation>,
    ) -> Self {
        Self {
            id,
            state,
            spec,
            last_error,
            updated_at,
            generation,
            revision,
            last_caller,
            in_flight,
            operations,
        }
    }

    pub(crate) fn set_spec(&mut self, spec: ContainerSpec) {
        self.spec = spec;
    }

    /// Writes the in-flight marker. Not a committed change, so `generation` stays.
    pub(crate) fn mark_in_flight(
        &mut self,
        transitional: LifecycleState,
        operation: OperationKind,
        caller: Option<&str>,
    ) {
        self.state = transitional;
        self.in_flight = Some(operation);
        self.last_caller = caller.map(str::to_string);
        self.updated_at = Utc::now();
    }

    /// Commits a settled state, clearing any previous error.
    pub(crate) fn commit(&mut self, state: LifecycleState) {
        self.state = state;
        self.in_flight = None;
        self.last_error = None;
        self.generation += 1;
        self.updated_at = Utc::now();
    }

    /// Commits `Failed` (or whatever the lifecycle decided) along with the error.
    pub(crate) fn commit_failure(&mut self, state: LifecycleState, error: ErrorDetail) {
        self.state = state;
        self.in_flight = None;
        self.last_error = Some(error);
        self.generation += 1;
        self.updated_at = Utc::now();
    }

    pub(crate) fn remember(&mut self, operation: CompletedOperation, window: usize) {
        self.operations.push(operation);
        if self.operations.len() > window {
            let excess = self.operations.len() - window;
            self.operations.drain(..excess);
        }
    }

    /// Called by stores once a write has been accepted.
    pub(crate) fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }
}
