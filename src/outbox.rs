//! # Durable notification outbox
//!
//! Durable channels write every notification into the `pgbus_notification`
//! table inside the publishing transaction, then NOTIFY with just the stored
//! row's id. Processors claim rows with `FOR UPDATE SKIP LOCKED` so exactly
//! one competing listener processes each row, delete on success, and leave
//! the row in place on failure for a later recovery sweep.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgQueryResult;
use sqlx::{PgConnection, PgExecutor, PgPool};

use crate::error::Result;

/// A notification persisted in the outbox table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredNotification {
    /// Monotonic row id; durable NOTIFY payloads carry this
    pub id: i64,
    /// Wire name of the channel the notification belongs to
    pub channel: String,
    /// Serialized channel payload
    pub payload: Value,
    /// Insertion time, used for processing-lag metrics
    pub created_at: DateTime<Utc>,
    /// Schema version the payload was captured under
    pub db_version: Option<i64>,
}

/// Outbox table DDL, mirrored by `migrations/0001_create_outbox.sql`
pub const CREATE_OUTBOX_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pgbus_notification (
    id BIGSERIAL PRIMARY KEY,
    channel VARCHAR(63) NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    db_version BIGINT
);
CREATE INDEX IF NOT EXISTS pgbus_notification_channel_idx
    ON pgbus_notification (channel);
CREATE INDEX IF NOT EXISTS pgbus_notification_created_at_idx
    ON pgbus_notification (created_at);
"#;

/// Create the outbox table and indexes if they do not exist
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for statement in CREATE_OUTBOX_SQL.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Insert a notification row, returning its id.
///
/// Runs on the caller's executor so the insert shares the publishing
/// transaction and rolls back with it.
pub async fn insert<'e, E: PgExecutor<'e>>(
    executor: E,
    channel: &str,
    payload: &Value,
    db_version: Option<i64>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO pgbus_notification (channel, payload, db_version) \
         VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(channel)
    .bind(payload)
    .bind(db_version)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Claim one stored notification by id.
///
/// `SKIP LOCKED` makes a row already claimed by a competing listener look
/// absent, which is the signal to stand down rather than block.
pub async fn claim_by_id(
    conn: &mut PgConnection,
    channel: &str,
    id: i64,
) -> Result<Option<StoredNotification>> {
    let row = sqlx::query_as::<_, StoredNotification>(
        "SELECT id, channel, payload, created_at, db_version \
         FROM pgbus_notification \
         WHERE channel = $1 AND id = $2 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(channel)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Claim one stored notification by exact payload match.
///
/// Legacy path for notifications emitted before id-carrying NOTIFY payloads;
/// oldest matching row wins.
pub async fn claim_by_payload(
    conn: &mut PgConnection,
    channel: &str,
    payload: &Value,
) -> Result<Option<StoredNotification>> {
    let row = sqlx::query_as::<_, StoredNotification>(
        "SELECT id, channel, payload, created_at, db_version \
         FROM pgbus_notification \
         WHERE channel = $1 AND payload = $2 \
         ORDER BY id \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(channel)
    .bind(payload)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Claim every unlocked stored notification for a channel, oldest first
pub async fn claim_backlog(
    conn: &mut PgConnection,
    channel: &str,
) -> Result<Vec<StoredNotification>> {
    let rows = sqlx::query_as::<_, StoredNotification>(
        "SELECT id, channel, payload, created_at, db_version \
         FROM pgbus_notification \
         WHERE channel = $1 \
         ORDER BY id \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(channel)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Delete a processed notification row
pub async fn delete(conn: &mut PgConnection, id: i64) -> Result<PgQueryResult> {
    let result = sqlx::query("DELETE FROM pgbus_notification WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result)
}

/// Number of notifications currently waiting in the outbox
pub async fn depth(pool: &PgPool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pgbus_notification")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Age of the oldest waiting notification in milliseconds, 0 when empty
pub async fn oldest_age_ms(pool: &PgPool) -> Result<i64> {
    let age: i64 = sqlx::query_scalar(
        "SELECT COALESCE( \
             (EXTRACT(EPOCH FROM (now() - MIN(created_at))) * 1000)::BIGINT, 0) \
         FROM pgbus_notification",
    )
    .fetch_one(pool)
    .await?;
    Ok(age)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_has_required_columns() {
        for column in ["channel VARCHAR(63)", "payload JSONB", "created_at", "db_version"] {
            assert!(CREATE_OUTBOX_SQL.contains(column), "missing {column}");
        }
    }

    #[test]
    fn test_ddl_statements_split_cleanly() {
        let statements: Vec<_> = CREATE_OUTBOX_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].starts_with("CREATE TABLE"));
    }
}
