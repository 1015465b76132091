//! Error types for pgbus

use thiserror::Error;

/// Result type for pgbus operations
pub type Result<T> = std::result::Result<T, PgBusError>;

/// Errors that can occur in pgbus operations
#[derive(Error, Debug)]
pub enum PgBusError {
    /// No channel registered under the given name or wire name
    #[error("Channel not found: {channel}")]
    ChannelNotFound { channel: String },

    /// Malformed or incompatible notification payload
    #[error("Payload decode error: {message}")]
    PayloadDecode { message: String },

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Two distinct channels hash to the same wire name
    #[error("Wire name collision: {first} and {second} both map to {wire_name}")]
    WireNameCollision {
        first: String,
        second: String,
        wire_name: String,
    },

    /// Listener not connected
    #[error("Listener is not connected to database")]
    NotConnected,

    /// Serialized payload exceeds the pg_notify size ceiling
    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A subscriber callback returned an error
    #[error("Subscriber callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

impl From<serde_json::Error> for PgBusError {
    fn from(err: serde_json::Error) -> Self {
        Self::PayloadDecode {
            message: err.to_string(),
        }
    }
}

impl PgBusError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a channel not found error
    pub fn channel_not_found<S: Into<String>>(channel: S) -> Self {
        Self::ChannelNotFound {
            channel: channel.into(),
        }
    }

    /// Create a payload decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::PayloadDecode {
            message: message.into(),
        }
    }
}
