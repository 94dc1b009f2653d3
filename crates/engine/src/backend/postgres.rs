//! PostgreSQL implementation of ResultBackend
//!
//! Results live in `taskward_results`, keyed by task id. Inserts use
//! `ON CONFLICT DO NOTHING` so a redelivered message can never overwrite
//! the first terminal result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::*;
use crate::task::TaskError;

/// PostgreSQL-backed result backend
///
/// Shares its schema migrations with [`crate::PostgresBroker`].
#[derive(Clone)]
pub struct PostgresResultBackend {
    pool: PgPool,
}

impl PostgresResultBackend {
    /// Create a new backend over the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(e: sqlx::Error) -> BackendError {
    BackendError::Database(e.to_string())
}

#[async_trait]
impl ResultBackend for PostgresResultBackend {
    #[instrument(skip(self, result), fields(task_id = %result.task_id, state = %result.state))]
    async fn store_result(&self, result: TaskResult) -> Result<(), BackendError> {
        let error = result
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO taskward_results
                (task_id, task_name, state, result, error, retries, date_done)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(result.task_id)
        .bind(&result.task_name)
        .bind(result.state.to_string())
        .bind(&result.result)
        .bind(error)
        .bind(i32::try_from(result.retries).unwrap_or(i32::MAX))
        .bind(result.date_done)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if inserted.rows_affected() == 0 {
            return Err(BackendError::AlreadyStored(result.task_id));
        }

        debug!("stored result");
        Ok(())
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, task_name, state, result, error, retries, date_done
            FROM taskward_results
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state: String = row.try_get("state").map_err(db_error)?;
        let error: Option<serde_json::Value> = row.try_get("error").map_err(db_error)?;
        let error = error
            .map(serde_json::from_value::<TaskError>)
            .transpose()
            .map_err(|e| BackendError::Serialization(e.to_string()))?;

        Ok(Some(TaskResult {
            task_id: row.try_get("task_id").map_err(db_error)?,
            task_name: row.try_get("task_name").map_err(db_error)?,
            state: state.parse()?,
            result: row.try_get("result").map_err(db_error)?,
            error,
            retries: u32::try_from(row.try_get::<i32, _>("retries").map_err(db_error)?)
                .unwrap_or(0),
            date_done: row
                .try_get::<DateTime<Utc>, _>("date_done")
                .map_err(db_error)?,
        }))
    }
}
