//! # Publishing notifications
//!
//! Publishing always rides the caller's transaction: [`publish_in`] encodes
//! the channel instance, enforces the pg_notify size ceiling, and for
//! durable channels inserts into the outbox before NOTIFYing with the
//! stored row's id. NOTIFY itself is transactional in Postgres, so a
//! rolled-back transaction emits nothing and leaves no outbox row behind.
//! [`publish`] is the convenience wrapper that opens and commits its own
//! transaction.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use crate::channel::{Channel, ChannelRegistry};
use crate::config::PgBusConfig;
use crate::error::{PgBusError, Result};
use crate::outbox;
use crate::payload::SENTINEL_PAYLOAD;

/// What a publish produced: the wire name NOTIFYed, the serialized payload,
/// and the outbox row id for durable channels.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub wire_name: String,
    pub payload: String,
    pub outbox_id: Option<i64>,
}

/// Publish a channel instance in its own transaction
pub async fn publish<C: Channel>(
    pool: &PgPool,
    config: &PgBusConfig,
    channel: &C,
) -> Result<PublishReceipt> {
    let mut tx = pool.begin().await?;
    let receipt = publish_in(&mut tx, config, channel).await?;
    tx.commit().await?;
    Ok(receipt)
}

/// Publish with explicit request context, in one transaction.
///
/// The context is bound to the publishing transaction (it reaches any
/// capture triggers fired by the same transaction) and clears itself at
/// commit or rollback, so no ambient state leaks into unrelated work.
pub async fn publish_with_context<C: Channel>(
    pool: &PgPool,
    config: &PgBusConfig,
    channel: &C,
    context: &serde_json::Map<String, Value>,
) -> Result<PublishReceipt> {
    let mut tx = pool.begin().await?;
    crate::context::set_notification_context(&mut *tx, context, config.tx_bound_context).await?;
    let receipt = publish_in(&mut tx, config, channel).await?;
    tx.commit().await?;
    Ok(receipt)
}

/// Publish a channel instance inside an existing transaction, so the
/// notification commits or rolls back with the caller's other writes.
#[instrument(skip_all, fields(channel = %C::logical_name(), durable = C::DURABLE))]
pub async fn publish_in<C: Channel>(
    tx: &mut Transaction<'_, Postgres>,
    config: &PgBusConfig,
    channel: &C,
) -> Result<PublishReceipt> {
    let encoded = channel.encode()?;
    enforce_payload_limit(&encoded, config.max_payload_size)?;
    let wire_name = C::wire_name();

    let outbox_id = if C::DURABLE {
        let payload: Value = serde_json::from_str(&encoded)?;
        let id = outbox::insert(&mut **tx, &wire_name, &payload, None).await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&wire_name)
            .bind(id.to_string())
            .execute(&mut **tx)
            .await?;
        Some(id)
    } else {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&wire_name)
            .bind(&encoded)
            .execute(&mut **tx)
            .await?;
        None
    };

    debug!(size = encoded.len(), ?outbox_id, "published notification");
    Ok(PublishReceipt {
        wire_name,
        payload: encoded,
        outbox_id,
    })
}

/// Send the recovery sentinel to durable channels, prompting connected
/// listeners to sweep their outbox backlog. With `channels = None` every
/// registered durable channel is kicked; a filter selecting only
/// non-durable channels kicks nothing.
pub async fn notify_stored(
    pool: &PgPool,
    registry: &ChannelRegistry,
    channels: Option<&[&str]>,
) -> Result<usize> {
    let entries = match channels {
        Some(filter) => registry.select(Some(filter))?,
        None => registry.durable_entries(),
    };

    let mut kicked = 0;
    for entry in entries.iter().filter(|e| e.is_durable()) {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(entry.wire_name())
            .bind(SENTINEL_PAYLOAD)
            .execute(pool)
            .await?;
        debug!(channel = entry.logical_name(), "sent recovery sentinel");
        kicked += 1;
    }
    Ok(kicked)
}

fn enforce_payload_limit(payload: &str, limit: usize) -> Result<()> {
    let size = payload.len();
    if size > limit {
        return Err(PgBusError::PayloadTooLarge { size, limit });
    }
    Ok(())
}
