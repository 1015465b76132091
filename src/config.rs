//! # Configuration for pgbus
//!
//! This module provides the configuration structure controlling listener
//! polling, payload limits and trigger-side metadata behavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PgBusError, Result};

/// pg_notify rejects payloads of 8000 bytes or more
pub const PG_NOTIFY_PAYLOAD_LIMIT: usize = 8000;

/// Configuration for pgbus publishing and listening
///
/// # Examples
///
/// ```rust
/// use pgbus::config::PgBusConfig;
/// use std::time::Duration;
///
/// let config = PgBusConfig::new()
///     .with_poll_interval(Duration::from_secs(1))
///     .with_max_payload_size(4000);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_payload_size, 4000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgBusConfig {
    /// Bounded wait on the listening connection before re-polling
    pub poll_interval: Duration,

    /// Maximum serialized payload size in bytes (pg_notify limit is 8000)
    pub max_payload_size: usize,

    /// Whether notification context set via `set_config` is cleared at
    /// transaction end (`true`) or persists for the session (`false`)
    pub tx_bound_context: bool,

    /// Whether trigger-computed extras are merged into the new-row snapshot
    /// before callbacks see it
    pub pass_extras_to_listeners: bool,

    /// Prefix for outbox metric names
    pub metric_prefix: String,
}

impl Default for PgBusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_payload_size: 7800, // Leave buffer under the 8000 byte limit
            tx_bound_context: true,
            pass_extras_to_listeners: false,
            metric_prefix: "pgbus".to_string(),
        }
    }
}

impl PgBusConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bounded poll wait
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set maximum payload size
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(PG_NOTIFY_PAYLOAD_LIMIT - 200);
        self
    }

    /// Set whether notification context is transaction-bound
    pub fn with_tx_bound_context(mut self, tx_bound: bool) -> Self {
        self.tx_bound_context = tx_bound;
        self
    }

    /// Enable merging of trigger extras into the new-row snapshot
    pub fn with_pass_extras_to_listeners(mut self, pass: bool) -> Self {
        self.pass_extras_to_listeners = pass;
        self
    }

    /// Set the metric name prefix
    pub fn with_metric_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.metric_prefix = prefix.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(PgBusError::config("poll_interval must be non-zero"));
        }

        if self.max_payload_size == 0 || self.max_payload_size >= PG_NOTIFY_PAYLOAD_LIMIT {
            return Err(PgBusError::config(format!(
                "max_payload_size must be between 1 and {} bytes",
                PG_NOTIFY_PAYLOAD_LIMIT - 1
            )));
        }

        if self.metric_prefix.is_empty() {
            return Err(PgBusError::config("metric_prefix must not be empty"));
        }

        Ok(())
    }
}
