//! # Notification processing strategies
//!
//! Every incoming notification is processed by exactly one of three
//! strategies, chosen up front from the channel contract and the raw
//! payload:
//!
//! - **direct**: non-durable channels; decode and dispatch immediately,
//!   nothing to claim or delete;
//! - **locking**: durable channels; claim the outbox row with
//!   `FOR UPDATE SKIP LOCKED` so one of N competing listeners wins, run
//!   callbacks, delete the row, commit. A failed claim means another
//!   listener got there first and is not an error;
//! - **recovery**: the sentinel payload; sweep the whole outbox backlog for
//!   the channel, isolating each row in a savepoint so one poisoned
//!   notification cannot abort the sweep.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sqlx::{Acquire, PgPool};
use tracing::{debug, instrument, warn};

use crate::channel::{ChannelEntry, ChannelRegistry, DecodeContext};
use crate::error::Result;
use crate::outbox;
use crate::payload;

/// Processing strategy for one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Dispatch the payload as-is, no outbox involvement
    Direct,
    /// Claim the referenced outbox row before dispatching
    Locking,
    /// Sweep the channel's outbox backlog
    Recovery,
}

/// Choose the strategy for a notification; a pure function of the channel
/// contract and the raw payload.
pub fn select_strategy(entry: &ChannelEntry, raw_payload: &str) -> Strategy {
    if !entry.is_durable() {
        Strategy::Direct
    } else if payload::is_sentinel(raw_payload) {
        Strategy::Recovery
    } else {
        Strategy::Locking
    }
}

/// What processing one notification amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Callbacks ran and the outbox row (if any) was deleted
    Processed,
    /// A competing listener already claimed the outbox row
    LockMiss,
    /// The configured filter skipped the notification; the row stays
    Filtered,
    /// A recovery sweep ran over the channel's backlog
    Swept { processed: usize, skipped: usize },
}

/// Predicate deciding which stored notifications a listener processes.
///
/// Rows the filter rejects are left in the outbox for differently-filtered
/// listeners (or a later recovery sweep) to pick up.
pub trait NotificationFilter: Send + Sync {
    fn matches(&self, payload: &Value) -> bool;
}

/// Processes notifications for channels resolved through a registry
pub struct Processor {
    pool: PgPool,
    registry: Arc<ChannelRegistry>,
    ctx: DecodeContext,
    filter: Option<Arc<dyn NotificationFilter>>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("registry", &self.registry)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl Processor {
    /// Create a processor over a pool, registry and decode context
    pub fn new(pool: PgPool, registry: Arc<ChannelRegistry>, ctx: DecodeContext) -> Self {
        Self {
            pool,
            registry,
            ctx,
            filter: None,
        }
    }

    /// Restrict which stored notifications this processor handles
    pub fn with_filter(mut self, filter: Arc<dyn NotificationFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Process one raw notification received on a wire channel
    #[instrument(skip(self, raw_payload), fields(channel = %wire_name))]
    pub async fn process(&self, wire_name: &str, raw_payload: &str) -> Result<ProcessOutcome> {
        let entry = self.registry.resolve(wire_name)?;
        match select_strategy(&entry, raw_payload) {
            Strategy::Direct => self.process_direct(&entry, raw_payload).await,
            Strategy::Locking => self.process_locking(&entry, raw_payload).await,
            Strategy::Recovery => self.process_recovery(&entry).await,
        }
    }

    /// Sweep the outbox backlog of every durable channel, optionally
    /// filtered by name. Returns total (processed, skipped) counts.
    pub async fn recover(&self, channels: Option<&[&str]>) -> Result<(usize, usize)> {
        let entries = match channels {
            Some(filter) => self.registry.select(Some(filter))?,
            None => self.registry.durable_entries(),
        };

        let mut total_processed = 0;
        let mut total_skipped = 0;
        for entry in entries.iter().filter(|e| e.is_durable()) {
            if let ProcessOutcome::Swept { processed, skipped } =
                self.process_recovery(entry).await?
            {
                total_processed += processed;
                total_skipped += skipped;
            }
        }
        Ok((total_processed, total_skipped))
    }

    /// Dispatch without touching the outbox. Callbacks run outside any
    /// transaction here; at-most-once delivery is the contract for
    /// non-durable channels and a failed callback is simply reported.
    async fn process_direct(&self, entry: &ChannelEntry, raw_payload: &str) -> Result<ProcessOutcome> {
        entry
            .dispatch(self.ctx.clone(), raw_payload.to_string())
            .await?;
        Ok(ProcessOutcome::Processed)
    }

    async fn process_locking(
        &self,
        entry: &ChannelEntry,
        raw_payload: &str,
    ) -> Result<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;

        // Id-carrying payloads are the standard; full-JSON payloads come
        // from triggers installed by earlier releases and are matched
        // against the stored payload instead.
        let stored = match raw_payload.trim().parse::<i64>() {
            Ok(id) => outbox::claim_by_id(&mut tx, entry.wire_name(), id).await?,
            Err(_) => {
                let value: Value = serde_json::from_str(raw_payload)?;
                outbox::claim_by_payload(&mut tx, entry.wire_name(), &value).await?
            }
        };

        let Some(stored) = stored else {
            debug!("outbox row already claimed by a competing listener");
            return Ok(ProcessOutcome::LockMiss);
        };

        if let Some(filter) = &self.filter {
            if !filter.matches(&stored.payload) {
                tx.commit().await?;
                return Ok(ProcessOutcome::Filtered);
            }
        }

        // A callback error drops the transaction, rolling back the claim
        // and leaving the row for recovery.
        entry
            .dispatch(self.ctx.clone(), stored.payload.to_string())
            .await?;
        outbox::delete(&mut tx, stored.id).await?;
        tx.commit().await?;
        Ok(ProcessOutcome::Processed)
    }

    async fn process_recovery(&self, entry: &ChannelEntry) -> Result<ProcessOutcome> {
        let mut tx = self.pool.begin().await?;
        let backlog = outbox::claim_backlog(&mut tx, entry.wire_name()).await?;

        let mut processed = 0;
        let mut skipped = 0;
        for stored in backlog {
            if let Some(filter) = &self.filter {
                if !filter.matches(&stored.payload) {
                    skipped += 1;
                    continue;
                }
            }

            // Each row gets its own savepoint so a failing callback only
            // rolls back that row's deletion.
            let mut savepoint = tx.begin().await?;
            match entry
                .dispatch(self.ctx.clone(), stored.payload.to_string())
                .await
            {
                Ok(()) => {
                    outbox::delete(&mut savepoint, stored.id).await?;
                    savepoint.commit().await?;
                    processed += 1;
                }
                Err(err) => {
                    warn!(id = stored.id, error = %err, "recovery skipped a notification");
                    savepoint.rollback().await?;
                    skipped += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(processed, skipped, channel = entry.logical_name(), "recovery sweep finished");
        Ok(ProcessOutcome::Swept { processed, skipped })
    }
}
