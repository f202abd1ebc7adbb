use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SmsId, UserId};
use domain::{SmsMessage, SmsParts, SmsStatus};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    OutboxEntry, Result, SmsFilter, StorageError,
    repository::{OutboxStore, SmsRepository, SmsTransaction},
};

const SMS_COLUMNS: &str = "id, user_id, content, receiver, provider, status, delivered_at, failure_code, created_at, updated_at";

/// PostgreSQL-backed SMS store.
///
/// Soft-deleted rows (`deleted_at IS NOT NULL`) are invisible to every
/// operation.
#[derive(Clone)]
pub struct PostgresSmsRepository {
    pool: PgPool,
}

impl PostgresSmsRepository {
    /// Creates a new PostgreSQL SMS store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_sms(row: PgRow) -> Result<SmsMessage> {
        let status: String = row.try_get("status")?;
        let status: SmsStatus = status
            .parse()
            .map_err(|e: domain::SmsError| StorageError::Corrupt(e.to_string()))?;

        Ok(SmsMessage::restore(SmsParts {
            id: SmsId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            content: row.try_get("content")?,
            receiver: row.try_get("receiver")?,
            provider: row.try_get("provider")?,
            status,
            delivered_at: row.try_get("delivered_at")?,
            failure_code: row.try_get("failure_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

async fn insert_sms(conn: &mut PgConnection, sms: &SmsMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sms_messages (id, user_id, content, receiver, provider, status, delivered_at, failure_code, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(sms.id().as_uuid())
    .bind(sms.user_id().as_str())
    .bind(sms.content())
    .bind(sms.receiver())
    .bind(sms.provider())
    .bind(sms.status().as_str())
    .bind(sms.delivered_at())
    .bind(sms.failure_code())
    .bind(sms.created_at())
    .bind(sms.updated_at())
    .execute(conn)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e
            && db_err.is_unique_violation()
        {
            return StorageError::AlreadyExists(sms.id());
        }
        StorageError::Database(e)
    })?;
    Ok(())
}

/// Writes the mutable columns, optionally guarded on the current status.
/// Returns the number of rows touched.
async fn write_sms(
    conn: &mut PgConnection,
    id: SmsId,
    expected: Option<SmsStatus>,
    sms: &SmsMessage,
) -> Result<u64> {
    let mut sql = String::from(
        r#"
        UPDATE sms_messages
        SET provider = $2, status = $3, delivered_at = $4, failure_code = $5, updated_at = $6
        WHERE id = $1 AND deleted_at IS NULL
        "#,
    );
    if expected.is_some() {
        sql.push_str(" AND status = $7");
    }

    let mut query = sqlx::query(&sql)
        .bind(id.as_uuid())
        .bind(sms.provider())
        .bind(sms.status().as_str())
        .bind(sms.delivered_at())
        .bind(sms.failure_code())
        .bind(Utc::now());
    if let Some(expected) = expected {
        query = query.bind(expected.as_str());
    }

    Ok(query.execute(conn).await?.rows_affected())
}

/// Explains why a guarded write touched no rows.
async fn guard_failure(conn: &mut PgConnection, id: SmsId, expected: SmsStatus) -> StorageError {
    let current: std::result::Result<Option<String>, sqlx::Error> = sqlx::query_scalar(
        "SELECT status FROM sms_messages WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(id.as_uuid())
    .fetch_optional(conn)
    .await;

    match current {
        Ok(None) => StorageError::NotFound,
        Ok(Some(status)) => match status.parse::<SmsStatus>() {
            Ok(actual) => StorageError::Conflict {
                id,
                expected,
                actual,
            },
            Err(e) => StorageError::Corrupt(e.to_string()),
        },
        Err(e) => StorageError::Database(e),
    }
}

async fn guarded_write(
    conn: &mut PgConnection,
    id: SmsId,
    expected: SmsStatus,
    sms: &SmsMessage,
) -> Result<()> {
    if write_sms(&mut *conn, id, Some(expected), sms).await? == 0 {
        return Err(guard_failure(conn, id, expected).await);
    }
    Ok(())
}

async fn insert_outbox(conn: &mut PgConnection, entry: &OutboxEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sms_outbox (id, event_type, aggregate_id, payload, created_at, dispatched_at, attempts, last_error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.event_type)
    .bind(&entry.aggregate_id)
    .bind(&entry.payload)
    .bind(entry.created_at)
    .bind(entry.dispatched_at)
    .bind(entry.attempts)
    .bind(&entry.last_error)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl SmsRepository for PostgresSmsRepository {
    async fn create(&self, sms: &SmsMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_sms(&mut conn, sms).await
    }

    async fn update(&self, id: SmsId, sms: &SmsMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if write_sms(&mut conn, id, None, sms).await? == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn update_if_status(
        &self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        guarded_write(&mut conn, id, expected, sms).await
    }

    async fn get_by_filter(&self, filter: SmsFilter) -> Result<SmsMessage> {
        let mut sql = format!("SELECT {SMS_COLUMNS} FROM sms_messages WHERE deleted_at IS NULL");
        let mut param_count = 0;

        // Build dynamic query
        if filter.id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND id = ${param_count}"));
        }
        if filter.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if filter.user_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND user_id = ${param_count}"));
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT 1");

        let mut query = sqlx::query(&sql);
        if let Some(id) = filter.id {
            query = query.bind(id.as_uuid());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(ref user_id) = filter.user_id {
            query = query.bind(user_id.as_str().to_string());
        }

        let row = query
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::NotFound)?;
        Self::row_to_sms(row)
    }

    async fn begin(&self) -> Result<Box<dyn SmsTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }
}

#[async_trait]
impl OutboxStore for PostgresSmsRepository {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, aggregate_id, payload, created_at, dispatched_at, attempts, last_error
            FROM sms_outbox
            WHERE dispatched_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        let dispatched_at: DateTime<Utc> = Utc::now();
        let result = sqlx::query(
            "UPDATE sms_outbox SET dispatched_at = $2, last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(dispatched_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::OutboxEntryNotFound(id));
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sms_outbox SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::OutboxEntryNotFound(id));
        }
        Ok(())
    }
}

/// A database transaction. Dropping it rolls back.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SmsTransaction for PostgresTransaction {
    async fn create(&mut self, sms: &SmsMessage) -> Result<()> {
        insert_sms(&mut self.tx, sms).await
    }

    async fn update_if_status(
        &mut self,
        id: SmsId,
        expected: SmsStatus,
        sms: &SmsMessage,
    ) -> Result<()> {
        guarded_write(&mut self.tx, id, expected, sms).await
    }

    async fn enqueue(&mut self, entry: OutboxEntry) -> Result<()> {
        insert_outbox(&mut self.tx, &entry).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { tx } = *self;
        tx.commit().await?;
        Ok(())
    }
}
