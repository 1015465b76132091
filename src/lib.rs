//! # pgbus
//!
//! Reliable, strongly-typed pub/sub over PostgreSQL LISTEN/NOTIFY.
//!
//! Channels are Rust types: any serde struct becomes a keyword-argument
//! channel via [`plain_channel!`], and database tables get row-change
//! channels captured by installed triggers. Durable channels write every
//! notification through a transactional outbox table and claim rows with
//! `FOR UPDATE SKIP LOCKED`, turning LISTEN/NOTIFY's fire-and-forget
//! delivery into exactly-once processing across competing listeners, with
//! a recovery sweep picking up anything missed while a listener was down.
//!
//! ## Components
//!
//! - [`channel`]: channel contracts, the registry, row-change entities
//! - [`publish`]: transactional publishing and the recovery sentinel
//! - [`listen`]: the long-running notification loop
//! - [`process`]: direct / locking / recovery processing strategies
//! - [`triggers`]: PL/pgSQL capture trigger generation and installation
//! - [`outbox`]: the durable notification table
//! - [`context`]: request context and payload extras settings
//! - [`metrics`]: outbox depth and processing-lag gauges
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pgbus::{ChannelRegistry, Listener, ListenOptions, PgBusConfig};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct PostReads {
//!     post_id: i64,
//! }
//!
//! pgbus::plain_channel!(PostReads, durable = true);
//!
//! # async fn run(pool: sqlx::PgPool) -> pgbus::Result<()> {
//! let registry = Arc::new(ChannelRegistry::new());
//! registry.register(|reads: PostReads| async move {
//!     println!("post {} was read", reads.post_id);
//!     Ok(())
//! })?;
//!
//! pgbus::outbox::ensure_schema(&pool).await?;
//! pgbus::publish(&pool, &PgBusConfig::default(), &PostReads { post_id: 1 }).await?;
//!
//! let listener = Listener::new(pool, registry, PgBusConfig::default());
//! listener.listen(ListenOptions::new().with_recover(true)).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod listen;
pub mod logging;
pub mod metrics;
pub mod outbox;
pub mod payload;
pub mod process;
pub mod publish;
pub mod triggers;
pub mod wire;

// Re-exported for the `plain_channel!` macro expansion.
pub use futures;

pub use channel::{
    Channel, ChannelEntry, ChannelRegistry, DecodeContext, Entity, NoVersioning, RowChange,
    RowChangeSpec, SchemaVersions,
};
pub use config::{PgBusConfig, PG_NOTIFY_PAYLOAD_LIMIT};
pub use error::{PgBusError, Result};
pub use listen::{ListenOptions, Listener};
pub use logging::init_logging;
pub use metrics::OutboxMetrics;
pub use outbox::StoredNotification;
pub use payload::RowChangePayload;
pub use process::{NotificationFilter, ProcessOutcome, Processor, Strategy};
pub use publish::{notify_stored, publish, publish_in, publish_with_context, PublishReceipt};
pub use triggers::{TriggerDefinition, TriggerInstaller, TriggerOp, TriggerWhen};
pub use wire::MAX_POSTGRES_CHANNEL_LENGTH;
