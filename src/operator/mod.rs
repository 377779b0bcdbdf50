mod error;
mod lock;
mod orchestrator;

pub use error::{ErrorKind, OrchestratorError};
pub use lock::{LockEntry, LockError, OperationLock, OperationLockManager};
pub use orchestrator::Orchestrator;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::driver::{HostDriver, MockDriver, ProxmoxDriver};
use crate::shared::config::Config;
use crate::store::SqliteStore;

/// Builds an orchestrator from `config` and settles whatever a previous process left in
/// flight. Nothing should accept requests before this returns.
pub async fn start(config: &Config) -> Result<Orchestrator> {
    tracing::info!("Starting Nuages orchestrator...");

    let store = SqliteStore::open(&config.database_url)
        .await
        .with_context(|| format!("failed to open container store at {}", config.database_url))?;

    let driver: Arc<dyn HostDriver> = match &config.proxmox {
        Some(proxmox) => Arc::new(
            ProxmoxDriver::new(proxmox.clone()).context("failed to set up the Proxmox driver")?,
        ),
        None => {
            tracing::warn!("No Proxmox credentials configured, using the in-memory mock driver");
            Arc::new(MockDriver::new())
        }
    };

    let orchestrator = Orchestrator::new(Arc::new(store), driver, config.orchestrator.clone());

    let reconciled = orchestrator
        .reconcile()
        .await
        .context("startup reconciliation failed")?;
    for r in &reconciled {
        tracing::info!(
            "Startup reconciliation: {} {} -> {}",
            r.container_id,
            r.from,
            r.to
        );
    }

    tracing::info!("Nuages orchestrator ready");
    Ok(orchestrator)
}
