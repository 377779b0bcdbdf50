use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Revision conflict on {id}: expected {expected:?}, found {actual:?}")]
    Conflict {
        id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Record id mismatch: key {key}, record {record}")]
    IdMismatch { key: String, record: String },

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
