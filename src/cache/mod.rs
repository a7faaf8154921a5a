//! Multi-backend cache engine (spec components C1–C8).
//!
//! [`Backend`] is the capability every storage engine implements; callers
//! never talk to a backend directly — they go through [`manager::Manager`],
//! which applies namespace policy and versioning (see [`version`]) before
//! delegating.

pub mod disk;
pub mod key;
pub mod manager;
pub mod memory;
pub mod policy;
pub mod remote;
pub mod sql;
pub mod version;

pub use manager::Manager;

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Opaque cached value. Only JSON-representable values are accepted —
/// arbitrary-object deserialization is forbidden (spec §4.3 / §9 design
/// notes: no pickle-equivalent serializer).
pub type Value = serde_json::Value;

/// A stored entry plus its bookkeeping metadata (spec §3 "Cache entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// The stored value
    pub value: Value,
    /// Absolute expiration time; `None` means no expiry
    pub expires_at: Option<SystemTime>,
    /// When this entry was first stored
    pub created_at: SystemTime,
    /// When this entry was last read
    pub last_access: SystemTime,
    /// Number of times this entry has been read
    pub access_count: u64,
    /// When this entry was last overwritten
    pub updated_at: SystemTime,
}

impl Entry {
    /// Construct a freshly-stored entry.
    #[must_use]
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        let now = SystemTime::now();
        Self {
            value,
            expires_at: ttl.map(|d| now + d),
            created_at: now,
            last_access: now,
            access_count: 0,
            updated_at: now,
        }
    }

    /// Whether the wall clock is past this entry's expiration (spec §3
    /// invariant 1: an expired entry is logically absent).
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| SystemTime::now() > exp)
    }

    /// Record an access, bumping the count and last-access timestamp.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_access = SystemTime::now();
    }

    /// Remaining TTL in seconds, if this entry has an expiration.
    #[must_use]
    pub fn ttl_seconds(&self) -> Option<i64> {
        self.expires_at.map(|exp| {
            exp.duration_since(SystemTime::now())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        })
    }
}

/// Per-backend counters (spec §3 "Cache statistics"). Monotonically
/// non-decreasing within a process.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy)]
pub struct Stats {
    /// Successful reads
    pub hits: u64,
    /// Reads that found nothing (or an expired entry)
    pub misses: u64,
    /// Writes
    pub sets: u64,
    /// Explicit deletes
    pub deletes: u64,
    /// Entries removed by an eviction policy or expiry sweep
    pub evictions: u64,
    /// Number of `clear()` calls
    pub clears: u64,
}

/// Uniform CRUD+TTL+stats contract every storage engine implements (spec
/// §4.1). Implementations must be safe under concurrent calls; individual
/// operations are linearizable with respect to their own backend instance.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch a value. Returns `Ok(None)` on miss or expiry (never an error).
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, evicting per the configured policy if the backend is
    /// at capacity and `key` is new. Returns `Ok(false)` on a storage fault.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a key. Returns `Ok(true)` if a value was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether `key` is present and not expired.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every entry in this backend's keyspace.
    async fn clear(&self) -> Result<()>;

    /// Number of live (non-expired) entries.
    async fn size(&self) -> Result<usize>;

    /// List stored keys, optionally filtered by a regular expression
    /// matched against the raw key. An invalid pattern falls back to a
    /// literal-prefix match (spec §4.1).
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    /// Snapshot of this backend's counters.
    async fn stats(&self) -> Result<Stats>;

    /// Remaining TTL in seconds: `Some(n)` with ttl, `Some(-1)`-free
    /// `None` for no-expiry keys that exist, or `Ok(None)` entirely absent.
    /// Modeled as `Option<Option<i64>>`: outer `None` = key absent, inner
    /// `None` = key exists with no expiry, `Some(secs)` = key expires in
    /// `secs` seconds.
    async fn get_ttl(&self, key: &str) -> Result<Option<Option<i64>>>;

    /// Update the TTL of an existing key without touching its value.
    /// Returns `Ok(false)` if the key does not exist.
    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool>;
}

/// Compile a `keys()` pattern into a predicate, falling back to a
/// literal-prefix match when the pattern is not a valid regular
/// expression (spec §4.1).
pub(crate) fn pattern_predicate(pattern: Option<&str>) -> Box<dyn Fn(&str) -> bool + Send + Sync> {
    match pattern {
        None => Box::new(|_: &str| true),
        Some(p) => match regex::Regex::new(p) {
            Ok(re) => Box::new(move |k: &str| re.is_match(k)),
            Err(_) => {
                let prefix = p.to_string();
                Box::new(move |k: &str| k.starts_with(prefix.as_str()))
            }
        },
    }
}
