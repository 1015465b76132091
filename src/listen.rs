//! # The listening loop
//!
//! A [`Listener`] LISTENs on the wire names of the selected channels and
//! routes every notification through a [`Processor`]. The receive wait is
//! bounded by the configured poll interval so the loop stays responsive to
//! shutdown and never parks forever on a silent connection.
//!
//! `PgListener` reconnects transparently when the underlying connection
//! drops; the loop observes the drop (a `None` from `try_recv`) and reacts
//! by sweeping the outbox backlog, because any NOTIFY sent while the
//! connection was down is gone. That sweep is what turns connection loss
//! into delayed delivery instead of lost delivery for durable channels.

use std::fmt;
use std::sync::Arc;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelRegistry, DecodeContext, SchemaVersions};
use crate::config::PgBusConfig;
use crate::error::{PgBusError, Result};
use crate::process::{NotificationFilter, Processor};

/// Per-invocation listening options
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Logical or wire names to listen on; `None` means every registered
    /// channel
    pub channels: Option<Vec<String>>,
    /// Sweep the outbox backlog before waiting for notifications
    pub recover: bool,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on the named channels only
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    /// Sweep the outbox backlog at startup
    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }
}

/// Long-running notification listener
pub struct Listener {
    pool: PgPool,
    registry: Arc<ChannelRegistry>,
    config: PgBusConfig,
    ctx: DecodeContext,
    filter: Option<Arc<dyn NotificationFilter>>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl Listener {
    /// Create a listener over a pool, registry and configuration
    pub fn new(pool: PgPool, registry: Arc<ChannelRegistry>, config: PgBusConfig) -> Self {
        let ctx = DecodeContext::new(pool.clone()).with_pass_extras(config.pass_extras_to_listeners);
        Self {
            pool,
            registry,
            config,
            ctx,
            filter: None,
        }
    }

    /// Attach a migration-version oracle for stale-payload detection
    pub fn with_versions(mut self, versions: Arc<dyn SchemaVersions>) -> Self {
        self.ctx = self.ctx.with_versions(versions);
        self
    }

    /// Restrict which stored notifications this listener processes
    pub fn with_filter(mut self, filter: Arc<dyn NotificationFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    fn processor(&self) -> Processor {
        let processor = Processor::new(self.pool.clone(), self.registry.clone(), self.ctx.clone());
        match &self.filter {
            Some(filter) => processor.with_filter(filter.clone()),
            None => processor,
        }
    }

    /// Listen and process until the connection fails unrecoverably.
    ///
    /// Selecting zero channels is a configuration error rather than a loop
    /// that can never receive anything.
    #[instrument(skip_all)]
    pub async fn listen(&self, options: ListenOptions) -> Result<()> {
        self.config.validate()?;
        let name_filter: Option<Vec<&str>> = options
            .channels
            .as_ref()
            .map(|names| names.iter().map(String::as_str).collect());
        let entries = self.registry.select(name_filter.as_deref())?;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        let wire_names: Vec<&str> = entries.iter().map(|e| e.wire_name()).collect();
        listener.listen_all(wire_names).await?;
        info!(channels = entries.len(), "listening");

        let processor = self.processor();
        if options.recover {
            let (processed, skipped) = processor.recover(name_filter.as_deref()).await?;
            info!(processed, skipped, "startup recovery sweep finished");
        }

        loop {
            match timeout(self.config.poll_interval, listener.try_recv()).await {
                // Quiet interval; re-poll.
                Err(_elapsed) => continue,
                Ok(Ok(Some(notification))) => {
                    debug!(channel = notification.channel(), "received notification");
                    let result = processor
                        .process(notification.channel(), notification.payload())
                        .await;
                    if let Err(err) = result {
                        if is_fatal(&err) {
                            return Err(err);
                        }
                        warn!(channel = notification.channel(), error = %err,
                              "notification processing failed");
                    }
                }
                Ok(Ok(None)) => {
                    // The connection dropped and PgListener re-established
                    // it; NOTIFYs sent in between never arrived.
                    warn!("listening connection was re-established; sweeping backlog");
                    let (processed, skipped) = processor.recover(name_filter.as_deref()).await?;
                    info!(processed, skipped, "post-reconnect recovery sweep finished");
                }
                Ok(Err(err)) => return Err(err.into()),
            }
        }
    }

    /// Run [`listen`](Self::listen), restarting after failures up to
    /// `max_restarts` times. Restarts always sweep the backlog, since
    /// notifications may have been lost while the listener was down.
    pub async fn run_supervised(&self, options: ListenOptions, max_restarts: usize) -> Result<()> {
        let mut options = options;
        let mut attempts = 0;
        loop {
            match self.listen(options.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempts += 1;
                    if attempts > max_restarts {
                        return Err(err);
                    }
                    warn!(error = %err, attempt = attempts, "listener failed; restarting");
                    options.recover = true;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }
}

/// Errors that should take the listening loop down rather than be logged
/// and skipped. Per-notification failures (bad payloads, subscriber
/// errors, races on unregistered channels) are not fatal.
fn is_fatal(err: &PgBusError) -> bool {
    matches!(
        err,
        PgBusError::Database(_) | PgBusError::Configuration { .. } | PgBusError::NotConnected
    )
}
