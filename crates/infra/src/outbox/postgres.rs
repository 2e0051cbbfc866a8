//! Postgres-backed outbox store.
//!
//! The creator of an event writes its outbox row with [`PostgresOutboxStore::save_in_tx`]
//! inside the same transaction as the business change, so either both commit or
//! neither does. Everything after that is single-row updates guarded by the expected
//! status in the `WHERE` clause.
//!
//! ## Error Mapping
//!
//! | SQLx Error | OutboxStoreError |
//! |------------|------------------|
//! | Database (unique violation `23505`) | `Storage` (duplicate id) |
//! | Database (other) | `Storage` |
//! | PoolClosed / Io / other | `Storage` |
//! | Row decoding | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use courier_core::OutboxEventId;

use super::store::{OutboxStore, OutboxStoreError};
use super::types::{OutboxEvent, OutboxStats, OutboxStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS outbox_events (
        id              UUID PRIMARY KEY,
        aggregate_id    TEXT NOT NULL,
        aggregate_type  TEXT NOT NULL,
        event_type      TEXT NOT NULL,
        event_data      JSONB NOT NULL,
        routing_key     TEXT NOT NULL,
        exchange        TEXT NOT NULL,
        status          TEXT NOT NULL
            CHECK (status IN ('pending', 'published', 'failed', 'cancelled')),
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL,
        published_at    TIMESTAMPTZ,
        retry_count     INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retries     INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
        next_retry_at   TIMESTAMPTZ,
        last_error      TEXT,
        correlation_id  TEXT,
        metadata        JSONB NOT NULL DEFAULT '{}'::jsonb,
        CHECK (status <> 'published' OR published_at IS NOT NULL)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_pending_idx
        ON outbox_events (created_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_retry_idx
        ON outbox_events (next_retry_at)
        WHERE status = 'failed' AND next_retry_at IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS outbox_events_published_idx
        ON outbox_events (published_at)
        WHERE status = 'published'
    "#,
];

const SELECT_COLUMNS: &str = r#"
    id, aggregate_id, aggregate_type, event_type, event_data, routing_key, exchange,
    status, created_at, updated_at, published_at, retry_count, max_retries,
    next_retry_at, last_error, correlation_id, metadata
"#;

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    event_data: JsonValue,
    routing_key: String,
    exchange: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    correlation_id: Option<String>,
    metadata: JsonValue,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            routing_key: row.try_get("routing_key")?,
            exchange: row.try_get("exchange")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            published_at: row.try_get("published_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            correlation_id: row.try_get("correlation_id")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OutboxStatus>()
            .map_err(OutboxStoreError::Serialization)?;
        Ok(OutboxEvent {
            id: OutboxEventId::from_uuid(row.id),
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            event_data: row.event_data,
            routing_key: row.routing_key,
            exchange: row.exchange,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            published_at: row.published_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            max_retries: u32::try_from(row.max_retries).unwrap_or_default(),
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            correlation_id: row.correlation_id,
            metadata: row.metadata,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let duplicate = db_err.code().as_deref() == Some("23505");
            if duplicate {
                OutboxStoreError::Storage(format!("duplicate outbox event in {operation}"))
            } else {
                OutboxStoreError::Storage(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                ))
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            OutboxStoreError::Serialization(format!("failed to decode row in {operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => OutboxStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Insert a `Pending` row inside the caller's transaction.
    #[instrument(
        skip(self, tx, event),
        fields(outbox_id = %event.id, event_type = %event.event_type),
        err
    )]
    pub async fn save_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<OutboxEventId, OutboxStoreError> {
        if event.status != OutboxStatus::Pending {
            return Err(OutboxStoreError::InvalidTransition {
                id: event.id,
                from: event.status,
                to: OutboxStatus::Pending,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, aggregate_id, aggregate_type, event_type, event_data, routing_key,
                exchange, status, created_at, updated_at, retry_count, max_retries,
                correlation_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $8, 0, $9, $10, $11)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(&event.routing_key)
        .bind(&event.exchange)
        .bind(event.created_at)
        .bind(to_i32(event.max_retries))
        .bind(&event.correlation_id)
        .bind(&event.metadata)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        Ok(event.id)
    }

    async fn fetch_status(&self, id: OutboxEventId) -> Result<OutboxStatus, OutboxStoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("fetch_status", e))?;
        status
            .ok_or(OutboxStoreError::NotFound(id))?
            .parse()
            .map_err(OutboxStoreError::Serialization)
    }

    /// Explain why a guarded update touched no row.
    async fn transition_error(&self, id: OutboxEventId, to: OutboxStatus) -> OutboxStoreError {
        match self.fetch_status(id).await {
            Ok(from) => OutboxStoreError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }

    async fn fetch_many(
        &self,
        operation: &str,
        sql: &str,
        bind_now: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut query = sqlx::query_as::<_, OutboxRow>(sql);
        if let Some(now) = bind_now {
            query = query.bind(now);
        }
        let rows = query
            .bind(to_i64(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let id = self.save_in_tx(&mut tx, &event).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(id)
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(OutboxEvent::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events \
             WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        self.fetch_many("find_pending", &sql, None, limit).await
    }

    #[instrument(skip(self), err)]
    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_events \
             WHERE status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= $1 \
               AND retry_count <= max_retries \
             ORDER BY next_retry_at ASC, id ASC LIMIT $2"
        );
        self.fetch_many("find_retryable", &sql, Some(now), limit).await
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn mark_published(
        &self,
        id: OutboxEventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = $2, next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1
              AND (status = 'pending' OR (status = 'failed' AND next_retry_at IS NOT NULL))
            "#,
        )
        .bind(id.as_uuid())
        .bind(published_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;

        if result.rows_affected() == 0 {
            return match self.fetch_status(id).await? {
                OutboxStatus::Published => Ok(()),
                from => Err(OutboxStoreError::InvalidTransition {
                    id,
                    from,
                    to: OutboxStatus::Published,
                }),
            };
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn mark_retry(
        &self,
        id: OutboxEventId,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed', retry_count = retry_count + 1, next_retry_at = $2,
                last_error = $3, updated_at = NOW()
            WHERE id = $1
              AND (status = 'pending' OR (status = 'failed' AND next_retry_at IS NOT NULL))
            "#,
        )
        .bind(id.as_uuid())
        .bind(next_retry_at)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_retry", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(outbox_id = %id), err)]
    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed', next_retry_at = NULL, last_error = $2, updated_at = NOW()
            WHERE id = $1
              AND (status = 'pending' OR (status = 'failed' AND next_retry_at IS NOT NULL))
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn cancel(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'cancelled', next_retry_at = NULL, updated_at = NOW()
            WHERE id = $1
              AND (status = 'pending' OR (status = 'failed' AND next_retry_at IS NOT NULL))
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, OutboxStatus::Cancelled).await);
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_published_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'published' AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_published_older_than", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)::BIGINT, COALESCE(SUM(retry_count), 0)::BIGINT
            FROM outbox_events
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for (status, count, retries) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match status.parse::<OutboxStatus>().map_err(OutboxStoreError::Serialization)? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Published => stats.published = count,
                OutboxStatus::Failed => stats.failed = count,
                OutboxStatus::Cancelled => stats.cancelled = count,
            }
            stats.total_retries += u64::try_from(retries).unwrap_or_default();
        }
        Ok(stats)
    }
}
