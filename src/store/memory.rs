use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{StateStore, StoreError};
use crate::models::ContainerRecord;

/// Process-local store. Suitable for tests and single-instance development setups.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, ContainerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ContainerRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self.records().get(id).cloned())
    }

    async fn compare_and_set(
        &self,
        id: &str,
        expected_revision: Option<u64>,
        record: ContainerRecord,
    ) -> Result<ContainerRecord, StoreError> {
        if record.id() != id {
            return Err(StoreError::IdMismatch {
                key: id.to_string(),
                record: record.id().to_string(),
            });
        }

        let mut records = self.records();
        let actual = records.get(id).map(ContainerRecord::revision);
        if actual != expected_revision {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_revision,
                actual,
            });
        }

        let stored = record.with_revision(actual.unwrap_or(0) + 1);
        records.insert(id.to_string(), stored.clone());
        Ok(stored)
    }

    async fn list_transitional(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let mut records: Vec<_> = self
            .records()
            .values()
            .filter(|record| record.state().is_transitional())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }
}
