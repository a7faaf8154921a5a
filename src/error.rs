//! Error types for the cache engine and the webhook delivery engine

use std::io;

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A cache key string did not have the expected four-part shape
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// A CIDR or IP literal could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Webhook with the given id does not exist
    #[error("Webhook not found: {0}")]
    NotFound(String),

    /// Webhook is registered but marked inactive
    #[error("Webhook inactive: {0}")]
    Inactive(String),

    /// Webhook is not subscribed to the event type being delivered
    #[error("Webhook {webhook_id} is not subscribed to {event_type}")]
    NotSubscribed {
        /// Webhook id
        webhook_id: String,
        /// Event type
        event_type: String,
    },

    /// Delivery queue is at capacity
    #[error("Delivery queue is full")]
    QueueFull,

    /// Both debouncing and batching were enabled for the same event type
    #[error("Event type {0} cannot be both debounced and batched")]
    ConflictingDispatchMode(String),

    /// A `deliver_event` call was cancelled during a retry delay
    #[error("Delivery cancelled")]
    Cancelled,

    /// IO error (disk backend, queue journal, repository files)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Embedded-SQL backend error
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Remote-KV backend error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Outbound HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// A delivery attempt failed in a way that should be retried (5xx, 429,
    /// connection errors)
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    /// A delivery attempt failed in a way that retrying cannot fix (4xx
    /// other than 429)
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl Error {
    /// Whether this error represents a transient failure that the delivery
    /// engine should retry (see spec §7 failure taxonomy).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Io(_) | Self::Transient(_))
    }
}
