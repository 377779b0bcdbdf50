use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::types::Json;
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::info;

use super::{StateStore, StoreError};
use crate::lifecycle::{LifecycleState, OperationKind};
use crate::models::{CompletedOperation, ContainerRecord, ContainerSpec, ErrorDetail};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SELECT_COLUMNS: &str = r#"
    SELECT id, state, spec, last_error, updated_at, generation, revision, last_caller, in_flight,
        operations
    FROM containers
"#;

/// SQLite-backed store. Compare-and-set is a single conditional statement, so two
/// processes sharing the database cannot both win the same revision.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connects to `database_url` (creating the file if needed) and runs migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        info!("Opened container store at {}", database_url);
        Self::from_pool(pool).await
    }

    /// A private in-memory database. Pinned to one connection so it outlives idle reaping.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn current_revision(&self, id: &str) -> Result<Option<u64>, StoreError> {
        let revision: Option<i64> = sqlx::query_scalar("SELECT revision FROM containers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        revision.map(|r| to_u64(id, "revision", r)).transpose()
    }
}

fn to_u64(id: &str, column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("negative {column}: {value}"),
    })
}

fn to_i64(id: &str, column: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("{column} out of range: {value}"),
    })
}

fn record_from_row(row: &SqliteRow) -> Result<ContainerRecord, StoreError> {
    let id: String = row.try_get("id")?;
    let state: String = row.try_get("state")?;
    let state = LifecycleState::from_str(&state).map_err(|reason| StoreError::Corrupt {
        id: id.clone(),
        reason,
    })?;
    let Json(spec): Json<ContainerSpec> = row.try_get("spec")?;
    let last_error: Option<Json<ErrorDetail>> = row.try_get("last_error")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    let generation = to_u64(&id, "generation", row.try_get("generation")?)?;
    let revision = to_u64(&id, "revision", row.try_get("revision")?)?;
    let last_caller: Option<String> = row.try_get("last_caller")?;
    let in_flight: Option<String> = row.try_get("in_flight")?;
    let in_flight = in_flight
        .map(|kind| OperationKind::from_str(&kind))
        .transpose()
        .map_err(|reason| StoreError::Corrupt {
            id: id.clone(),
            reason,
        })?;
    let Json(operations): Json<Vec<CompletedOperation>> = row.try_get("operations")?;

    Ok(ContainerRecord::from_parts(
        id,
        state,
        spec,
        last_error.map(|Json(e)| e),
        updated_at,
        generation,
        revision,
        last_caller,
        in_flight,
        operations,
    ))
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
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

        let next_revision = expected_revision.unwrap_or(0) + 1;
        let record = record.with_revision(next_revision);
        let generation = to_i64(id, "generation", record.generation())?;
        let revision = to_i64(id, "revision", next_revision)?;
        let last_error = record.last_error().cloned().map(Json);
        let in_flight = record.in_flight().map(|kind| kind.as_str());
        let operations = Json(record.operations().to_vec());

        let result = match expected_revision {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO containers
                        (id, state, spec, last_error, updated_at, generation, revision, last_caller,
                         in_flight, operations)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO NOTHING
                    "#,
                )
                .bind(id)
                .bind(record.state().as_str())
                .bind(Json(record.spec()))
                .bind(last_error)
                .bind(record.updated_at())
                .bind(generation)
                .bind(revision)
                .bind(record.last_caller())
                .bind(in_flight)
                .bind(operations)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE containers
                    SET state = ?, spec = ?, last_error = ?, updated_at = ?, generation = ?,
                        revision = ?, last_caller = ?, in_flight = ?, operations = ?
                    WHERE id = ? AND revision = ?
                    "#,
                )
                .bind(record.state().as_str())
                .bind(Json(record.spec()))
                .bind(last_error)
                .bind(record.updated_at())
                .bind(generation)
                .bind(revision)
                .bind(record.last_caller())
                .bind(in_flight)
                .bind(operations)
                .bind(id)
                .bind(to_i64(id, "revision", expected)?)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_revision,
                actual: self.current_revision(id).await?,
            });
        }

        Ok(record)
    }

    async fn list_transitional(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let [a, b, c, d] = LifecycleState::TRANSITIONAL;
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE state IN (?, ?, ?, ?) ORDER BY id"
        ))
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(c.as_str())
        .bind(d.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }
}
