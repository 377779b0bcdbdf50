use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::error::OrchestratorError;
use super::lock::{LockError, OperationLockManager};
use crate::driver::{DriverError, HostDriver, ObservedState};
use crate::lifecycle::{self, LifecycleState, OperationKind, TransitionError};
use crate::models::{
    validate_container_id, CompletedOperation, ContainerRecord, ContainerSpec, DriverFailure,
    ErrorDetail, OperationOutcome, OperationRequest, Reconciliation,
};
use crate::shared::config::OrchestratorConfig;
use crate::store::{StateStore, StoreError};

/// Runs lifecycle operations against containers.
///
/// Mutating operations on one container are serialized through the lock manager, checked
/// against the lifecycle state machine, recorded as in flight, dispatched to the host
/// driver and committed with their observed outcome. Nothing is retried here: failures
/// come back typed, and callers retry with the same idempotency key.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    driver: Arc<dyn HostDriver>,
    locks: OperationLockManager,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        driver: Arc<dyn HostDriver>,
        config: OrchestratorConfig,
    ) -> Self {
        let locks = OperationLockManager::new(config.lock_timeout());
        Self {
            store,
            driver,
            locks,
            config,
        }
    }

    pub fn locks(&self) -> &OperationLockManager {
        &self.locks
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        request: OperationRequest,
    ) -> Result<OperationOutcome, OrchestratorError> {
        validate_container_id(&request.container_id).map_err(OrchestratorError::InvalidSpec)?;

        if !request.kind.is_mutating() {
            return self.inspect(&request.container_id).await;
        }

        let id = request.container_id.clone();
        let lock = self.locks.acquire(&id).await.map_err(lock_timeout)?;

        let mut current = self.store.get(&id).await?;
        if let Some(record) = current.take() {
            current = Some(if record.state().is_transitional() {
                // Our lock is held, so the marker belongs to another instance sharing
                // the store. It is only abandoned once its driver call must have ended.
                if self.is_live(&record) {
                    warn!(
                        "Container {} is {} by another instance, rejecting {}",
                        id,
                        record.state(),
                        request.kind
                    );
                    return Err(OrchestratorError::StoreConflict {
                        id,
                        state: Some(record.state()),
                    });
                }
                warn!(
                    "Container {} was left in {}, reconciling before {}",
                    id,
                    record.state(),
                    request.kind
                );
                self.reconcile_record(record).await?.0
            } else {
                record
            });
        }

        if let (Some(key), Some(record)) = (&request.idempotency_key, &current) {
            if let Some(prior) = record.find_completed(key, request.kind) {
                info!(
                    "Replaying {} on {} for idempotency key {} (generation {})",
                    request.kind, id, key, prior.generation
                );
                return Ok(OperationOutcome::replay(request.kind, prior, record.clone()));
            }
        }

        let state = current
            .as_ref()
            .map(ContainerRecord::state)
            .unwrap_or(LifecycleState::Absent);
        if state == LifecycleState::Absent && request.kind != OperationKind::Create {
            return Err(OrchestratorError::NotFound { id });
        }

        let transitional = lifecycle::transition(state, request.kind)
            .map_err(|err| invalid_transition(&id, err))?;

        let expected_revision = current.as_ref().map(ContainerRecord::revision);
        let mut record = match current {
            Some(record) => record,
            None => ContainerRecord::new_absent(&id, self.default_spec()),
        };
        if request.kind == OperationKind::Create {
            let spec = request.spec.clone().unwrap_or_else(|| self.default_spec());
            spec.validate().map_err(OrchestratorError::InvalidSpec)?;
            record.set_spec(spec);
        }

        let caller = request.caller.as_ref().map(|c| c.0.as_str());
        record.mark_in_flight(transitional, request.kind, caller);
        let record = self
            .store
            .compare_and_set(&id, expected_revision, record)
            .await
            .map_err(|err| store_error(&id, err, Some(state)))?;

        info!(
            "{} on {} accepted: {} -> {} (caller: {})",
            request.kind,
            id,
            state,
            transitional,
            caller.unwrap_or("anonymous")
        );

        // The driver call and the outcome write run detached from the caller: if the
        // caller goes away the host operation still completes and gets recorded, and
        // the lock is released only afterwards.
        let this = self.clone();
        let task = tokio::spawn(async move {
            let _lock = lock;
            this.drive(record, &request).await
        });

        task.await
            .map_err(|err| OrchestratorError::Internal(format!("operation on {id} aborted: {err}")))?
    }

    /// Every container that currently exists.
    pub async fn list(&self) -> Result<Vec<ContainerRecord>, OrchestratorError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|record| record.state() != LifecycleState::Absent)
            .collect())
    }

    /// Resolves every operation a previous process left in flight.
    ///
    /// Called once at startup. Each container is reconciled under its own lock, so
    /// distinct containers proceed concurrently.
    pub async fn reconcile(&self) -> Result<Vec<Reconciliation>, OrchestratorError> {
        let pending = self.store.list_transitional().await?;
        if pending.is_empty() {
            info!("No interrupted operations to reconcile");
            return Ok(Vec::new());
        }

        info!("Reconciling {} interrupted operations", pending.len());
        let results = join_all(pending.iter().map(|record| self.reconcile_one(record.id()))).await;

        let mut reconciled = Vec::with_capacity(results.len());
        for result in results {
            if let Some(reconciliation) = result? {
                reconciled.push(reconciliation);
            }
        }
        Ok(reconciled)
    }

    async fn reconcile_one(&self, id: &str) -> Result<Option<Reconciliation>, OrchestratorError> {
        let _lock = self.locks.acquire(id).await.map_err(lock_timeout)?;

        // Someone may have settled it between the listing and the lock
        let Some(record) = self.store.get(id).await? else {
            return Ok(None);
        };
        if !record.state().is_transitional() {
            return Ok(None);
        }

        let (_, reconciliation) = self.reconcile_record(record).await?;
        Ok(Some(reconciliation))
    }

    /// Replaces a stale transitional marker with what the host reports. The caller holds
    /// the container's lock.
    async fn reconcile_record(
        &self,
        mut record: ContainerRecord,
    ) -> Result<(ContainerRecord, Reconciliation), OrchestratorError> {
        let id = record.id().to_string();
        let from = record.state();
        let expected_revision = record.revision();
        let interrupted = record
            .in_flight()
            .or_else(|| lifecycle::interrupted_operation(from))
            .unwrap_or(OperationKind::Inspect);

        let observed = match self.observe(&id).await {
            Ok(observed) => Some(observed),
            Err(err) => {
                warn!("Could not observe {} during reconciliation: {}", id, err);
                let to = lifecycle::on_driver_failure(from).map_err(internal)?;
                record.commit_failure(
                    to,
                    ErrorDetail {
                        failure: DriverFailure::Recoverable,
                        operation: interrupted,
                        message: format!("interrupted {interrupted} could not be verified: {err}"),
                        occurred_at: Utc::now(),
                    },
                );
                None
            }
        };

        if let Some(observed) = observed {
            let to = lifecycle::reconcile(from, observed);
            if to == LifecycleState::Failed {
                record.commit_failure(
                    to,
                    ErrorDetail {
                        failure: DriverFailure::Recoverable,
                        operation: interrupted,
                        message: format!("host reports {observed:?} after interrupted {interrupted}"),
                        occurred_at: Utc::now(),
                    },
                );
            } else {
                record.commit(to);
            }
        }

        let to = record.state();
        let stored = self
            .store
            .compare_and_set(&id, Some(expected_revision), record)
            .await
            .map_err(|err| store_error(&id, err, Some(from)))?;

        info!(
            "Reconciled {}: {} -> {} (host: {:?}, generation {})",
            id,
            from,
            to,
            observed,
            stored.generation()
        );

        Ok((
            stored,
            Reconciliation {
                container_id: id,
                from,
                to,
                observed,
            },
        ))
    }

    /// Read-only view of a container, refreshed from the host on a best-effort basis.
    async fn inspect(&self, id: &str) -> Result<OperationOutcome, OrchestratorError> {
        let record = self
            .store
            .get(id)
            .await?
            .filter(|record| record.state() != LifecycleState::Absent)
            .ok_or_else(|| OrchestratorError::NotFound { id: id.to_string() })?;

        let state = record.state();
        let mut outcome = OperationOutcome::committed(OperationKind::Inspect, record);
        match self.observe(id).await {
            Ok(observed) => {
                outcome.observed = Some(observed);
                if !lifecycle::agrees_with(state, observed) {
                    warn!("Container {} is {} but the host reports {:?}", id, state, observed);
                    outcome.warning = Some(format!(
                        "host reports {observed:?} while the last known state is {state}"
                    ));
                }
            }
            Err(err) => {
                warn!("Returning last known state of {}: {}", id, err);
                outcome.warning = Some(format!("state not refreshed from host: {err}"));
            }
        }

        Ok(outcome)
    }

    async fn drive(
        &self,
        record: ContainerRecord,
        request: &OperationRequest,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let timeout = self.config.driver_timeout();
        let result = tokio::time::timeout(timeout, self.call_driver(request.kind, &record))
            .await
            .unwrap_or_else(|_| {
                Err(DriverError::recoverable(format!(
                    "{} timed out after {timeout:?}",
                    request.kind
                )))
            });

        match result {
            Ok(()) => self.commit_success(record, request).await,
            Err(err) => self.commit_failure(record, request.kind, err).await,
        }
    }

    async fn call_driver(
        &self,
        kind: OperationKind,
        record: &ContainerRecord,
    ) -> Result<(), DriverError> {
        let id = record.id();
        match kind {
            OperationKind::Create => self.driver.create(id, record.spec()).await,
            OperationKind::Start => self.driver.start(id).await,
            OperationKind::Stop => self.driver.stop(id).await,
            OperationKind::Restart => self.driver.restart(id).await,
            OperationKind::Destroy => self.driver.destroy(id).await,
            OperationKind::Inspect => self.driver.inspect(id).await.map(|_| ()),
        }
    }

    async fn commit_success(
        &self,
        mut record: ContainerRecord,
        request: &OperationRequest,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let id = record.id().to_string();
        let from = record.state();
        let to = lifecycle::on_driver_success(from).map_err(internal)?;
        let expected_revision = record.revision();

        record.commit(to);
        if let Some(key) = &request.idempotency_key {
            let completed = CompletedOperation {
                idempotency_key: key.clone(),
                kind: request.kind,
                state: to,
                generation: record.generation(),
                caller: request.caller.as_ref().map(|c| c.0.clone()),
                completed_at: Utc::now(),
            };
            record.remember(completed, self.config.idempotency_window);
        }

        let stored = self
            .store
            .compare_and_set(&id, Some(expected_revision), record)
            .await
            .map_err(|err| store_error(&id, err, Some(from)))?;

        info!(
            "{} on {} succeeded: {} -> {} (generation {})",
            request.kind,
            id,
            from,
            to,
            stored.generation()
        );
        Ok(OperationOutcome::committed(request.kind, stored))
    }

    async fn commit_failure(
        &self,
        mut record: ContainerRecord,
        operation: OperationKind,
        err: DriverError,
    ) -> Result<OperationOutcome, OrchestratorError> {
        let id = record.id().to_string();
        let from = record.state();
        let to = lifecycle::on_driver_failure(from).map_err(internal)?;
        let expected_revision = record.revision();

        error!("{} on {} failed in {}: {}", operation, id, from, err);
        record.commit_failure(
            to,
            ErrorDetail {
                failure: err.failure(),
                operation,
                message: err.message().to_string(),
                occurred_at: Utc::now(),
            },
        );
        self.store
            .compare_and_set(&id, Some(expected_revision), record)
            .await
            .map_err(|err| store_error(&id, err, Some(from)))?;

        Err(match err {
            DriverError::Recoverable(detail) => OrchestratorError::DriverRecoverable {
                id,
                operation,
                state: to,
                detail,
            },
            DriverError::Terminal(detail) => OrchestratorError::DriverTerminal {
                id,
                operation,
                state: to,
                detail,
            },
        })
    }

    async fn observe(&self, id: &str) -> Result<ObservedState, DriverError> {
        let timeout = self.config.driver_timeout();
        tokio::time::timeout(timeout, self.driver.inspect(id))
            .await
            .unwrap_or_else(|_| {
                Err(DriverError::recoverable(format!(
                    "inspect timed out after {timeout:?}"
                )))
            })
    }

    /// Whether a transitional marker may still have its driver call running. A marker
    /// stamped in the future is treated as live.
    fn is_live(&self, record: &ContainerRecord) -> bool {
        Utc::now()
            .signed_duration_since(record.updated_at())
            .to_std()
            .map(|age| age < self.config.driver_timeout())
            .unwrap_or(true)
    }

    fn default_spec(&self) -> ContainerSpec {
        ContainerSpec::new(self.config.default_template.clone())
    }
}

fn lock_timeout(err: LockError) -> OrchestratorError {
    match err {
        LockError::Timeout { id, waited } => OrchestratorError::LockTimeout { id, waited },
    }
}

fn invalid_transition(id: &str, err: TransitionError) -> OrchestratorError {
    match err {
        TransitionError::Illegal {
            from,
            operation,
            allowed,
        } => OrchestratorError::InvalidTransition {
            id: id.to_string(),
            state: from,
            operation,
            allowed,
        },
        other => internal(other),
    }
}

fn internal(err: TransitionError) -> OrchestratorError {
    OrchestratorError::Internal(err.to_string())
}

fn store_error(id: &str, err: StoreError, state: Option<LifecycleState>) -> OrchestratorError {
    match err {
        StoreError::Conflict { .. } => {
            warn!("Lost a concurrent write on {}: {}", id, err);
            OrchestratorError::StoreConflict {
                id: id.to_string(),
                state,
            }
        }
        other => OrchestratorError::Store(other),
    }
}
