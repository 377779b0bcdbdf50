mod error;
#[cfg(test)]
mod http_stub;
mod mock;
mod proxmox;

pub use error::DriverError;
pub use mock::{DriverCall, MockDriver};
pub use proxmox::{ProxmoxConfig, ProxmoxDriver};
pub(crate) use proxmox::{
    default_node as default_proxmox_node,
    default_poll_interval_ms as default_proxmox_poll_interval_ms,
    default_storage as default_proxmox_storage,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ContainerSpec;

/// What the host reports about a container right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservedState {
    Missing,
    Stopped,
    Running,
    Unknown,
}

/// Control surface of an LXC host.
///
/// Every primitive must be safe to repeat: the orchestrator may re-issue one after a
/// crash between the call and the persisted result. `create` succeeds if the container
/// already exists, `start` if it is already running, `destroy` if it is already gone.
#[async_trait]
pub trait HostDriver: Send + Sync {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), DriverError>;

    async fn start(&self, id: &str) -> Result<(), DriverError>;

    async fn stop(&self, id: &str) -> Result<(), DriverError>;

    async fn restart(&self, id: &str) -> Result<(), DriverError> {
        self.stop(id).await?;
        self.start(id).await
    }

    async fn destroy(&self, id: &str) -> Result<(), DriverError>;

    async fn inspect(&self, id: &str) -> Result<ObservedState, DriverError>;
}
