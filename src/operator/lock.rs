use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for the lock on {id}")]
    Timeout { id: String, waited: Duration },
}

/// Who holds a container's lock, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

struct Slot {
    // tokio's mutex queues waiters in FIFO order
    gate: Arc<tokio::sync::Mutex<()>>,
    holder: Mutex<Option<LockEntry>>,
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LockTable {
    fn checkout(&self, id: &str) -> Arc<Slot> {
        lock(&self.slots)
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    gate: Arc::new(tokio::sync::Mutex::new(())),
                    holder: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Returns a slot reference and drops the table entry once nobody holds or awaits it.
    fn checkin(&self, id: &str, slot: Arc<Slot>) {
        let mut slots = lock(&self.slots);
        drop(slot);
        if slots.get(id).is_some_and(|s| Arc::strong_count(s) == 1) {
            slots.remove(id);
            debug!("Released lock table entry for {}", id);
        }
    }
}

/// A reference to a slot that is returned to the table however it is dropped,
/// including when an acquire future is cancelled mid-wait.
struct SlotRef {
    table: Arc<LockTable>,
    id: String,
    slot: Option<Arc<Slot>>,
}

impl SlotRef {
    fn set_holder(&self, entry: Option<LockEntry>) {
        if let Some(slot) = &self.slot {
            *lock(&slot.holder) = entry;
        }
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.table.checkin(&self.id, slot);
        }
    }
}

/// Per-container mutual exclusion for mutating operations.
///
/// Distinct ids never contend. Waiters on the same id are served first come, first
/// served, and give up after the configured timeout.
#[derive(Clone)]
pub struct OperationLockManager {
    table: Arc<LockTable>,
    timeout: Duration,
}

impl OperationLockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn acquire(&self, id: &str) -> Result<OperationLock, LockError> {
        let slot = self.table.checkout(id);
        let gate = slot.gate.clone();
        let slot_ref = SlotRef {
            table: self.table.clone(),
            id: id.to_string(),
            slot: Some(slot),
        };

        let guard = tokio::time::timeout(self.timeout, gate.lock_owned())
            .await
            .map_err(|_| LockError::Timeout {
                id: id.to_string(),
                waited: self.timeout,
            })?;

        let entry = LockEntry {
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
        };
        slot_ref.set_holder(Some(entry.clone()));
        debug!("Acquired lock on {} ({})", id, entry.token);

        Ok(OperationLock {
            guard: Some(guard),
            entry,
            slot_ref,
        })
    }

    /// Current holder of `id`'s lock, if an operation is in flight.
    pub fn holder(&self, id: &str) -> Option<LockEntry> {
        let slot = lock(&self.table.slots).get(id).cloned()?;
        let holder = lock(&slot.holder).clone();
        holder
    }

    /// Number of ids that currently have a holder or waiters.
    pub fn in_flight(&self) -> usize {
        lock(&self.table.slots).len()
    }
}

/// Held for the duration of one mutating operation. Dropping it releases the lock.
pub struct OperationLock {
    guard: Option<OwnedMutexGuard<()>>,
    entry: LockEntry,
    slot_ref: SlotRef,
}

impl OperationLock {
    pub fn id(&self) -> &str {
        &self.slot_ref.id
    }

    pub fn entry(&self) -> &LockEntry {
        &self.entry
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        self.slot_ref.set_holder(None);
        // Let the next waiter in before the slot reference is returned
        self.guard.take();
        debug!("Released lock on {} ({})", self.slot_ref.id, self.entry.token);
    }
}
