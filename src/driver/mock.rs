use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{DriverError, HostDriver, ObservedState};
use crate::models::ContainerSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    Create,
    Start,
    Stop,
    Restart,
    Destroy,
    Inspect,
}

/// In-memory host used for tests and for running without a real LXC host.
///
/// Failures and delays can be scripted per primitive; every call is recorded.
#[derive(Default)]
pub struct MockDriver {
    containers: Mutex<HashMap<String, ObservedState>>,
    failures: Mutex<HashMap<DriverCall, VecDeque<DriverError>>>,
    delays: Mutex<HashMap<DriverCall, Duration>>,
    calls: Mutex<Vec<(DriverCall, String)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `call` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, call: DriverCall, error: DriverError) {
        lock(&self.failures).entry(call).or_default().push_back(error);
    }

    /// Every call to `call` sleeps for `delay` before doing anything.
    pub fn set_delay(&self, call: DriverCall, delay: Duration) {
        lock(&self.delays).insert(call, delay);
    }

    /// Overrides what the host reports, as if something changed behind our back.
    pub fn set_observed(&self, id: &str, state: ObservedState) {
        let mut containers = lock(&self.containers);
        if state == ObservedState::Missing {
            containers.remove(id);
        } else {
            containers.insert(id.to_string(), state);
        }
    }

    pub fn observed(&self, id: &str) -> ObservedState {
        lock(&self.containers)
            .get(id)
            .copied()
            .unwrap_or(ObservedState::Missing)
    }

    pub fn call_count(&self, call: DriverCall, id: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|(c, target)| *c == call && target == id)
            .count()
    }

    pub fn calls(&self) -> Vec<(DriverCall, String)> {
        lock(&self.calls).clone()
    }

    async fn enter(&self, call: DriverCall, id: &str) -> Result<(), DriverError> {
        debug!("Mock driver {:?} for {}", call, id);
        lock(&self.calls).push((call, id.to_string()));

        let delay = lock(&self.delays).get(&call).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match lock(&self.failures).get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn require_present(&self, id: &str) -> Result<(), DriverError> {
        if lock(&self.containers).contains_key(id) {
            Ok(())
        } else {
            Err(DriverError::terminal(format!("container {id} does not exist")))
        }
    }
}

#[async_trait]
impl HostDriver for MockDriver {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), DriverError> {
        self.enter(DriverCall::Create, id).await?;
        debug!("Mock create {} from template {}", id, spec.template);
        lock(&self.containers)
            .entry(id.to_string())
            .or_insert(ObservedState::Stopped);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        self.enter(DriverCall::Start, id).await?;
        self.require_present(id)?;
        self.set_observed(id, ObservedState::Running);
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), DriverError> {
        self.enter(DriverCall::Stop, id).await?;
        self.require_present(id)?;
        self.set_observed(id, ObservedState::Stopped);
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<(), DriverError> {
        self.enter(DriverCall::Restart, id).await?;
        self.require_present(id)?;
        self.set_observed(id, ObservedState::Running);
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), DriverError> {
        self.enter(DriverCall::Destroy, id).await?;
        lock(&self.containers).remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ObservedState, DriverError> {
        self.enter(DriverCall::Inspect, id).await?;
        Ok(self.observed(id))
    }
}
