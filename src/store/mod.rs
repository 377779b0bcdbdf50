mod error;
mod memory;
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::models::ContainerRecord;

/// Durable map from container id to its last-known record.
///
/// Writes go exclusively through [`StateStore::compare_and_set`], which is atomic per
/// record: the write only lands when the stored revision still equals
/// `expected_revision` (`None` meaning "no record yet"). The returned record carries
/// the new revision.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError>;

    async fn compare_and_set(
        &self,
        id: &str,
        expected_revision: Option<u64>,
        record: ContainerRecord,
    ) -> Result<ContainerRecord, StoreError>;

    /// Records left in `Creating`, `Starting`, `Stopping` or `Destroying`.
    async fn list_transitional(&self) -> Result<Vec<ContainerRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<ContainerRecord>, StoreError>;
}
