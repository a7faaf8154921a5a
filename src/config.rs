//! Configuration management
//!
//! Loaded with [`figment`] from an optional YAML file overlaid with
//! environment variables (`CACHEWORK_*`), the same layering the cache and
//! webhook engines have used since the first release.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration for both engines.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Cache engine configuration
    pub cache: CacheConfig,
    /// Webhook delivery engine configuration
    pub webhook: WebhookConfig,
    /// Security middleware configuration
    pub security: SecurityConfig,
}

impl Config {
    /// Load configuration from an optional YAML file, overlaid with
    /// `CACHEWORK_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("CACHEWORK_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Which backend a [`crate::cache::Manager`] should construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Thread-safe in-process map
    #[default]
    Memory,
    /// Hashed-filename files on disk
    Disk,
    /// Embedded SQL database
    Sql,
    /// Remote key-value store
    Remote,
}

/// Eviction policy for bounded backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the least-recently-used entry
    #[default]
    Lru,
    /// Evict the least-frequently-used entry
    Lfu,
    /// Evict the oldest inserted entry
    Fifo,
}

/// Global caching policy level (spec §4.8 / §6): shifts default TTLs and
/// can disable whole categories of namespaces without touching callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachingPolicyLevel {
    /// Caching is entirely disabled; every operation behaves as a miss/no-op
    Disabled,
    /// Only cheap, short-TTL caching
    Minimal,
    /// Default middle ground
    #[default]
    Balanced,
    /// Long TTLs, cache everything not explicitly excluded
    Aggressive,
}

impl CachingPolicyLevel {
    /// Default TTL this policy level implies, absent an explicit override.
    #[must_use]
    pub fn default_ttl(self) -> Option<Duration> {
        match self {
            Self::Disabled => Some(Duration::ZERO),
            Self::Minimal => Some(Duration::from_secs(30)),
            Self::Balanced => Some(Duration::from_secs(300)),
            Self::Aggressive => Some(Duration::from_secs(3600)),
        }
    }
}

/// Cache engine configuration (spec §4.8 `CacheManager` construction record).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled at all
    pub enabled: bool,
    /// Backend to construct
    pub backend: CacheBackendKind,
    /// Default TTL applied when a caller does not specify one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Maximum number of entries for bounded backends (memory, disk)
    pub max_size: usize,
    /// Eviction policy for bounded backends
    pub eviction_policy: EvictionPolicy,
    /// Global policy level (disabled/minimal/balanced/aggressive)
    pub policy_level: CachingPolicyLevel,
    /// Only these model ids may be cached; empty means no restriction
    pub model_allowlist: HashSet<String>,
    /// Only these operations may be cached; empty means no restriction
    pub operation_allowlist: HashSet<String>,
    /// Disk backend: directory to store cache files under
    pub disk_dir: String,
    /// SQL backend: path to the sqlite database file
    pub sql_path: String,
    /// Remote backend: connection URL (e.g. `redis://127.0.0.1/`)
    pub remote_url: String,
    /// Remote backend: key prefix shared by value/metadata keys
    pub remote_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            default_ttl: Duration::from_secs(300),
            max_size: 10_000,
            eviction_policy: EvictionPolicy::Lru,
            policy_level: CachingPolicyLevel::Balanced,
            model_allowlist: HashSet::new(),
            operation_allowlist: HashSet::new(),
            disk_dir: "cache".to_string(),
            sql_path: "cache.db".to_string(),
            remote_url: "redis://127.0.0.1/".to_string(),
            remote_prefix: "cachework:".to_string(),
        }
    }
}

/// Webhook delivery engine configuration (spec §4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Root directory for the JSON-file repository
    pub repository_root: String,
    /// Number of concurrent delivery workers
    pub max_workers: usize,
    /// Bounded queue capacity before `QueueFull`
    pub queue_capacity: usize,
    /// Maximum attempts per delivery before max-retries-exceeded
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Ceiling for exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Per-attempt HTTP timeout
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Optional end-to-end delivery deadline
    #[serde(with = "humantime_serde")]
    pub delivery_deadline: Duration,
    /// Whether the dead-letter queue is enabled
    pub dlq_enabled: bool,
    /// Whether the queue is journalled to disk and rehydrated on startup
    pub persist_queue: bool,
    /// Path to the append-only queue journal
    pub queue_file: String,
    /// Maximum response body size kept on an attempt record
    pub max_response_body_bytes: usize,
    /// Batch window for batched event types
    #[serde(with = "humantime_serde")]
    pub batch_window: Duration,
    /// Number of events that force an early batch flush
    pub batch_size: usize,
    /// Debounce window for debounced event keys
    #[serde(with = "humantime_serde")]
    pub debounce_window: Duration,
    /// Event types that should be delivered as batches
    pub batched_event_types: HashSet<String>,
    /// Event types that should be debounced
    pub debounced_event_types: HashSet<String>,
    /// Store webhook secrets encrypted at rest and sign with the decrypted
    /// value, instead of the default (sign with the hashed secret — see
    /// DESIGN.md open question)
    pub encrypt_secrets: bool,
    /// Passphrase the encrypted-secret mode stretches into an AES-256 key
    /// via PBKDF2. Required (non-empty) when `encrypt_secrets` is set.
    pub secret_encryption_key: String,
}

impl WebhookConfig {
    /// Validate cross-field invariants (spec §9 open question: batching and
    /// debouncing must not both apply to the same event type).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConflictingDispatchMode`] naming the first event type
    /// present in both sets, or [`Error::Config`] if `encrypt_secrets` is set
    /// without a `secret_encryption_key`.
    pub fn validate(&self) -> Result<()> {
        if let Some(event_type) = self
            .batched_event_types
            .intersection(&self.debounced_event_types)
            .next()
        {
            return Err(Error::ConflictingDispatchMode(event_type.clone()));
        }
        if self.encrypt_secrets && self.secret_encryption_key.is_empty() {
            return Err(Error::Config(
                "encrypt_secrets is set but secret_encryption_key is empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            repository_root: "webhooks".to_string(),
            max_workers: 4,
            queue_capacity: 1_000,
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
            delivery_deadline: Duration::from_secs(300),
            dlq_enabled: true,
            persist_queue: true,
            queue_file: "webhooks/queue.jsonl".to_string(),
            max_response_body_bytes: 4096,
            batch_window: Duration::from_secs(5),
            batch_size: 50,
            debounce_window: Duration::from_millis(500),
            batched_event_types: HashSet::new(),
            debounced_event_types: HashSet::new(),
            encrypt_secrets: false,
            secret_encryption_key: String::new(),
        }
    }
}

/// Security middleware configuration (spec §4.15).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Path prefix the middleware applies to
    pub path_prefix: String,
    /// Literal + CIDR allowlist entries; empty allows all
    pub allowlist: Vec<String>,
    /// Requests allowed per window
    pub rate_limit: u32,
    /// Sliding window size
    #[serde(with = "humantime_serde")]
    pub rate_limit_window: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/webhooks".to_string(),
            allowlist: Vec::new(),
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads_without_a_file() {
        let config = Config::load(None).unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.webhook.max_attempts, 5);
    }

    #[test]
    fn rejects_event_type_in_both_batch_and_debounce_sets() {
        let mut webhook = WebhookConfig::default();
        webhook.batched_event_types.insert("order.created".into());
        webhook.debounced_event_types.insert("order.created".into());
        assert!(matches!(
            webhook.validate(),
            Err(Error::ConflictingDispatchMode(ref e)) if e == "order.created"
        ));
    }

    #[test]
    fn policy_levels_imply_distinct_default_ttls() {
        assert_eq!(
            CachingPolicyLevel::Disabled.default_ttl(),
            Some(Duration::ZERO)
        );
        assert!(
            CachingPolicyLevel::Aggressive.default_ttl()
                > CachingPolicyLevel::Minimal.default_ttl()
        );
    }
}
