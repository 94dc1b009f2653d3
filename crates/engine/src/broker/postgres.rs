//! PostgreSQL implementation of BrokerClient
//!
//! One row per message in `taskward_messages`:
//! - Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent consumers never
//!   receive the same message
//! - A claim pushes `visible_at` forward by the visibility window; a message
//!   that is neither acked nor rejected in time simply becomes claimable again
//! - Ack and reject-without-requeue delete the row

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::client::{BrokerClient, BrokerError, Requeue, MAX_SCHEDULE_DELAY};
use crate::task::{TaskMessage, TaskPayload, DEFAULT_QUEUE};

/// PostgreSQL-backed broker
///
/// # Example
///
/// ```ignore
/// use taskward_engine::PostgresBroker;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/taskward").await?;
/// let broker = PostgresBroker::new(pool, vec!["default".into()]);
/// broker.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresBroker {
    pool: PgPool,
    queues: Vec<String>,
    visibility_timeout: Duration,
}

impl PostgresBroker {
    /// Create a broker consuming `queues` over the given connection pool
    pub fn new(pool: PgPool, queues: Vec<String>) -> Self {
        let queues = if queues.is_empty() {
            vec![DEFAULT_QUEUE.to_string()]
        } else {
            queues
        };
        Self {
            pool,
            queues,
            visibility_timeout: Duration::from_secs(3600),
        }
    }

    /// Set how long a claimed message stays invisible before redelivery
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), BrokerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Backend(e.to_string()))
    }

    /// Publish a message; it becomes claimable at its eta (or immediately)
    #[instrument(skip(self, message), fields(task_id = %message.id, task = %message.task))]
    pub async fn publish(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            INSERT INTO taskward_messages
                (id, queue, task_name, content_type, body, retries, eta, expires, visible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($7, NOW()))
            "#,
        )
        .bind(message.id)
        .bind(&message.queue)
        .bind(&message.task)
        .bind(&message.payload.content_type)
        .bind(&message.payload.body)
        .bind(i32::try_from(message.retries).unwrap_or(i32::MAX))
        .bind(message.eta)
        .bind(message.expires)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!("published message");
        Ok(())
    }
}

/// Classify sqlx errors: transport problems are transient, everything else is not
fn map_sqlx_error(e: sqlx::Error) -> BrokerError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BrokerError::Transient(e.to_string()),
        other => {
            error!("broker query failed: {}", other);
            BrokerError::Backend(other.to_string())
        }
    }
}

#[async_trait]
impl BrokerClient for PostgresBroker {
    fn queues(&self) -> &[String] {
        &self.queues
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<Option<TaskMessage>, BrokerError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM taskward_messages
                WHERE queue = ANY($1)
                  AND visible_at <= NOW()
                ORDER BY array_position($1, queue), visible_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE taskward_messages m
            SET visible_at = NOW() + make_interval(secs => $2),
                deliveries = deliveries + 1
            FROM claimable c
            WHERE m.id = c.id
            RETURNING m.id, m.queue, m.task_name, m.content_type, m.body,
                      m.retries, m.eta, m.expires
            "#,
        )
        .bind(&self.queues)
        .bind(self.visibility_timeout.min(MAX_SCHEDULE_DELAY).as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let decode = |e: sqlx::Error| BrokerError::Serialization(e.to_string());
        let message = TaskMessage {
            id: row.try_get("id").map_err(decode)?,
            queue: row.try_get("queue").map_err(decode)?,
            task: row.try_get("task_name").map_err(decode)?,
            payload: TaskPayload::new(
                row.try_get::<String, _>("content_type").map_err(decode)?,
                row.try_get::<Vec<u8>, _>("body").map_err(decode)?,
            ),
            retries: u32::try_from(row.try_get::<i32, _>("retries").map_err(decode)?)
                .unwrap_or(0),
            eta: row
                .try_get::<Option<DateTime<Utc>>, _>("eta")
                .map_err(decode)?,
            expires: row
                .try_get::<Option<DateTime<Utc>>, _>("expires")
                .map_err(decode)?,
        };

        debug!(task_id = %message.id, task = %message.task, "claimed message");
        Ok(Some(message))
    }

    #[instrument(skip(self))]
    async fn ack(&self, id: Uuid) -> Result<(), BrokerError> {
        let result = sqlx::query("DELETE FROM taskward_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::UnknownDelivery(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reject(&self, id: Uuid, requeue: Requeue) -> Result<(), BrokerError> {
        let result = match requeue {
            Requeue::No => {
                sqlx::query("DELETE FROM taskward_messages WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await
            }
            Requeue::Yes { delay, retries } => {
                sqlx::query(
                    r#"
                    UPDATE taskward_messages
                    SET visible_at = NOW() + make_interval(secs => $2),
                        retries = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(delay.min(MAX_SCHEDULE_DELAY).as_secs_f64())
                .bind(i32::try_from(retries).unwrap_or(i32::MAX))
                .execute(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::UnknownDelivery(id));
        }
        Ok(())
    }
}
