//! Remote key-value cache backend (C5), backed by Redis.
//!
//! Value and metadata live under separate keys sharing a prefix/suffix
//! scheme: `{prefix}value:{key}` and `{prefix}metadata:{key}`. TTL is
//! delegated to the server's own expiry primitives rather than tracked
//! client-side.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::Result;

use super::{Backend, Stats, Value};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct RemoteMetadata {
    access_count: u64,
}

/// Redis-backed cache reached through a managed, auto-reconnecting
/// connection.
pub struct RemoteBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl RemoteBackend {
    /// Connect to `url` and wrap it in a [`ConnectionManager`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Redis`] if the client cannot be constructed
    /// or the initial connection fails. Callers should fall back to the
    /// in-memory backend on failure (spec §4.5).
    pub async fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }

    fn value_key(&self, key: &str) -> String {
        format!("{}value:{key}", self.prefix)
    }

    fn metadata_key(&self, key: &str) -> String {
        format!("{}metadata:{key}", self.prefix)
    }

    fn stats_key(&self) -> String {
        format!("{}stats", self.prefix)
    }

    async fn bump_stat(&self, field: &str) {
        let mut conn = self.conn.clone();
        let _: std::result::Result<i64, _> = conn.hincr(self.stats_key(), field, 1).await;
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(self.value_key(key)).await?;
        let Some(raw) = raw else {
            self.bump_stat("misses").await;
            return Ok(None);
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            self.bump_stat("misses").await;
            return Ok(None);
        };
        let _: std::result::Result<(), _> = conn.hincr(self.metadata_key(key), "access_count", 1).await;
        self.bump_stat("hits").await;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let Ok(bytes) = serde_json::to_vec(&value) else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let value_key = self.value_key(key);
        let metadata_key = self.metadata_key(key);

        match ttl {
            Some(d) => {
                let secs = d.as_secs().max(1);
                let _: () = conn.set_ex(&value_key, bytes, secs).await?;
                let _: () = conn.expire(&metadata_key, secs as i64).await.unwrap_or(());
            }
            None => {
                let _: () = conn.set(&value_key, bytes).await?;
            }
        }
        let _: std::result::Result<(), _> = conn.hset(&metadata_key, "access_count", 0).await;
        self.bump_stat("sets").await;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(self.value_key(key)).await?;
        let _: std::result::Result<i64, _> = conn.del(self.metadata_key(key)).await;
        if removed > 0 {
            self.bump_stat("deletes").await;
        }
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.value_key(key)).await?;
        Ok(exists)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            let _: std::result::Result<i64, _> = conn.del(keys).await;
        }
        self.bump_stat("clears").await;
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}value:*", self.prefix);
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys.len())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let scan_pattern = format!("{}value:*", self.prefix);
        let raw_keys: Vec<String> = conn.keys(scan_pattern).await?;
        let stripped: Vec<String> = raw_keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&format!("{}value:", self.prefix)).map(str::to_string))
            .collect();
        let predicate = super::pattern_predicate(pattern);
        Ok(stripped.into_iter().filter(|k| predicate(k)).collect())
    }

    async fn stats(&self) -> Result<Stats> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, u64> = conn.hgetall(self.stats_key()).await.unwrap_or_default();
        Ok(Stats {
            hits: *map.get("hits").unwrap_or(&0),
            misses: *map.get("misses").unwrap_or(&0),
            sets: *map.get("sets").unwrap_or(&0),
            deletes: *map.get("deletes").unwrap_or(&0),
            evictions: *map.get("evictions").unwrap_or(&0),
            clears: *map.get("clears").unwrap_or(&0),
        })
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Option<i64>>> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.value_key(key)).await?;
        if !exists {
            return Ok(None);
        }
        let ttl: i64 = conn.ttl(self.value_key(key)).await?;
        Ok(Some(if ttl < 0 { None } else { Some(ttl) }))
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value_key = self.value_key(key);
        let exists: bool = conn.exists(&value_key).await?;
        if !exists {
            return Ok(false);
        }
        match ttl {
            Some(d) => {
                let _: bool = conn.expire(&value_key, d.as_secs().max(1) as i64).await?;
            }
            None => {
                let _: bool = conn.persist(&value_key).await?;
            }
        }
        Ok(true)
    }
}
