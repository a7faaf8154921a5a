//! Webhook delivery engine (spec components C9–C15).
//!
//! [`repository::Repository`] owns the durable webhook/delivery/attempt
//! records; [`delivery::Engine`] drives the queue, worker pool, retries,
//! and dead-letter queue; [`emitter::Emitter`] fans a local event out to
//! both in-process listeners and the delivery engine;
//! [`middleware`] guards the inbound management surface with an IP
//! allowlist and a rate limiter.

pub mod allowlist;
pub mod delivery;
pub mod emitter;
pub mod middleware;
pub mod rate_limiter;
pub mod repository;
pub mod signature;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Unique id
    pub id: String,
    /// Destination URL
    pub url: String,
    /// Event types this webhook receives
    pub events: Vec<String>,
    /// Human-readable description
    pub description: Option<String>,
    /// Whether deliveries are attempted at all
    pub active: bool,
    /// Hash of the caller-supplied secret (never the raw secret) — see
    /// `repository::Repository::sign_payload`
    pub secret_hash: Option<String>,
    /// Encrypted secret, present only when `encrypt_secrets` is enabled
    pub encrypted_secret: Option<String>,
    /// Custom headers merged into every outbound request
    pub headers: std::collections::HashMap<String, String>,
    /// Creation timestamp (unix seconds)
    pub created_at: i64,
    /// Last-update timestamp (unix seconds)
    pub updated_at: i64,
}

impl Webhook {
    /// Whether this webhook is both active and subscribed to `event_type`.
    #[must_use]
    pub fn receives(&self, event_type: &str) -> bool {
        self.active && self.events.iter().any(|e| e == event_type)
    }
}

/// Fresh webhook id.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outcome of a delivery's attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued, not yet attempted
    Pending,
    /// An attempt is currently in flight or a retry is scheduled
    Retrying,
    /// Terminal: an attempt returned 2xx
    Success,
    /// Terminal: all `max_attempts` attempts failed
    MaxRetriesExceeded,
    /// Terminal: the delivery deadline elapsed before success
    Failed,
}

impl DeliveryStatus {
    /// Whether this status will never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::MaxRetriesExceeded | Self::Failed)
    }
}

/// The aggregate outcome of up to `max_attempts` attempts for one
/// `(webhook, event)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Unique id
    pub id: String,
    /// Owning webhook id
    pub webhook_id: String,
    /// Event type being delivered
    pub event_type: String,
    /// The envelope payload, as sent (or to be sent)
    pub payload: serde_json::Value,
    /// Current status
    pub status: DeliveryStatus,
    /// Number of attempts made so far
    pub attempt_count: u32,
    /// Caller-supplied idempotency key, if any
    pub idempotency_key: Option<String>,
    /// Creation timestamp (unix seconds)
    pub created_at: i64,
    /// Last-update timestamp (unix seconds)
    pub updated_at: i64,
}

/// Status of a single HTTP POST attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Dispatched, awaiting response
    Pending,
    /// Response received but not 2xx, or a transport error occurred
    Failed,
    /// Response was 2xx
    Success,
}

/// A single HTTP POST from the delivery engine to a webhook target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique id
    pub id: String,
    /// Owning delivery id
    pub delivery_id: String,
    /// Attempt outcome
    pub status: AttemptStatus,
    /// HTTP status code, if a response was received
    pub response_code: Option<u16>,
    /// Truncated response body
    pub response_body: Option<String>,
    /// Error description, if the attempt failed before a response
    pub error: Option<String>,
    /// When this attempt was dispatched (unix seconds)
    pub created_at: i64,
}

/// A delivery that exhausted its retries and was dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The delivery id that exhausted retries
    pub delivery_id: String,
    /// When this entry was dead-lettered (unix seconds)
    pub dead_lettered_at: i64,
}

/// Relative priority of a queued delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Delivered after all high-priority tasks
    Low,
    /// Delivered first
    High,
}

/// `{id, type, created_at, data}` envelope posted to the webhook target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event id
    pub id: String,
    /// Event type (`"batch"` for a flushed batch)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Creation timestamp (unix seconds)
    pub created_at: i64,
    /// Event payload
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Build a fresh envelope stamped with the current time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            event_type: event_type.into(),
            created_at: chrono::Utc::now().timestamp(),
            data,
        }
    }
}

pub(crate) fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
