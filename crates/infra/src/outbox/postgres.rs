//! Postgres-backed outbox store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Persistence` | Duplicate id (dedupe conflicts are resolved, not raised) |
//! | Database (other) | Any other | `Persistence` | Constraint or statement failure |
//! | PoolClosed | N/A | `Persistence` | Connection pool was closed |
//! | Other | N/A | `Persistence` | Network errors, connection failures, etc. |
//!
//! ## Same-transaction append
//!
//! [`PostgresOutboxStore::append_in_tx`] inserts through the caller's open
//! transaction so the event commits or rolls back together with the domain
//! mutation. The relay only ever sees committed rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use vaultgate_core::OutboxEventId;
use vaultgate_events::{NewOutboxEvent, OutboxEvent};

use super::{MarkOutcome, OutboxError, OutboxStore, PendingCursor};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id           UUID PRIMARY KEY,
    event_type   TEXT NOT NULL CHECK (length(btrim(event_type)) > 0),
    payload      JSONB NOT NULL DEFAULT '{}'::jsonb,
    dedupe_key   TEXT UNIQUE,
    published_at TIMESTAMPTZ NULL,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS outbox_events_pending_idx
    ON outbox_events (created_at, id)
    WHERE published_at IS NULL;
"#;

const COLUMNS: &str = "id, event_type, payload, dedupe_key, published_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self, OutboxError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `outbox_events` table and its pending-row index if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Insert through the caller's transaction.
    ///
    /// The row becomes visible to relays only when the caller commits.
    #[instrument(
        skip(self, tx, event),
        fields(event_type = %event.event_type()),
        err
    )]
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewOutboxEvent,
    ) -> Result<OutboxEvent, OutboxError> {
        insert_event(&mut **tx, event).await
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(
        skip(self, event),
        fields(event_type = %event.event_type()),
        err
    )]
    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        insert_event(&mut *conn, event).await
    }

    #[instrument(skip(self), err)]
    async fn fetch_pending_after(
        &self,
        cursor: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events \
             WHERE published_at IS NULL \
               AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3)) \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1"
        ))
        .bind(limit)
        .bind(cursor.map(|c| c.created_at))
        .bind(cursor.map(|c| *c.id.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map(OutboxEvent::from)
                    .map_err(|e| OutboxError::Persistence(format!("failed to decode outbox row: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET published_at = $2, updated_at = $2
            WHERE id = $1 AND published_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;

        if result.rows_affected() == 1 {
            return Ok(MarkOutcome::Marked);
        }

        let exists = sqlx::query("SELECT 1 FROM outbox_events WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published_lookup", e))?;

        match exists {
            Some(_) => Ok(MarkOutcome::AlreadyPublished),
            None => Err(OutboxError::NotFound(id)),
        }
    }

    #[instrument(skip(self), err)]
    async fn pending_count(&self) -> Result<u64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM outbox_events WHERE published_at IS NULL")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("pending_count", e))?;

        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| OutboxError::Persistence(format!("failed to read count: {e}")))?;
        Ok(pending.max(0) as u64)
    }
}

/// Insert a row, resolving dedupe-key conflicts to the existing row.
async fn insert_event(conn: &mut PgConnection, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxError> {
    let pending = event.into_event(OutboxEventId::new(), Utc::now());

    let inserted = sqlx::query(&format!(
        "INSERT INTO outbox_events ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, NULL, $5, $5) \
         ON CONFLICT (dedupe_key) DO NOTHING \
         RETURNING {COLUMNS}"
    ))
    .bind(pending.id().as_uuid())
    .bind(pending.event_type())
    .bind(pending.payload())
    .bind(pending.dedupe_key())
    .bind(pending.created_at())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_event", e))?;

    let row = match (inserted, pending.dedupe_key()) {
        (Some(row), _) => row,
        (None, Some(key)) => sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events WHERE dedupe_key = $1"
        ))
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_deduplicated", e))?,
        (None, None) => {
            return Err(OutboxError::Persistence(format!(
                "insert of outbox event {} returned no row",
                pending.id()
            )));
        }
    };

    OutboxRow::from_row(&row)
        .map(OutboxEvent::from)
        .map_err(|e| OutboxError::Persistence(format!("failed to decode outbox row: {e}")))
}

/// Map SQLx errors to OutboxError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            match code.as_deref() {
                Some("23505") => OutboxError::Persistence(format!(
                    "duplicate outbox row in {operation}: {}",
                    db_err.message()
                )),
                _ => OutboxError::Persistence(format!(
                    "database error in {operation}: {}",
                    db_err.message()
                )),
            }
        }
        sqlx::Error::PoolClosed => {
            OutboxError::Persistence(format!("connection pool closed in {operation}"))
        }
        _ => OutboxError::Persistence(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    dedupe_key: Option<String>,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            dedupe_key: row.try_get("dedupe_key")?,
            published_at: row.try_get("published_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxEvent {
    fn from(row: OutboxRow) -> Self {
        OutboxEvent::restore(
            OutboxEventId::from_uuid(row.id),
            row.event_type,
            row.payload,
            row.dedupe_key,
            row.published_at,
            row.created_at,
            row.updated_at,
        )
    }
}
