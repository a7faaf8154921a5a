//! In-memory cache backend (C2).
//!
//! An `IndexMap` under a single `parking_lot::Mutex` gives us both O(1)
//! lookup and stable insertion order for FIFO eviction — the same
//! single-critical-section-per-operation discipline the circuit breaker
//! uses for its own state.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::Result;
use crate::config::EvictionPolicy;

use super::{Backend, Entry, Stats, Value, pattern_predicate};

/// Thread-safe, bounded in-process cache.
pub struct MemoryBackend {
    entries: Mutex<IndexMap<String, Entry>>,
    max_size: usize,
    eviction_policy: EvictionPolicy,
    stats: Mutex<Stats>,
}

impl MemoryBackend {
    /// Construct an empty backend bounded to `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize, eviction_policy: EvictionPolicy) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_size,
            eviction_policy,
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Select and remove the entry the configured policy would evict,
    /// skipping (and removing as a side effect) anything already expired.
    fn evict_one(&self, entries: &mut IndexMap<String, Entry>) {
        while let Some((_, entry)) = entries.first() {
            if entry.is_expired() {
                entries.shift_remove_index(0);
                continue;
            }
            break;
        }
        if entries.len() < self.max_size {
            return;
        }

        let victim = match self.eviction_policy {
            EvictionPolicy::Fifo => entries
                .iter()
                .position(|(_, e)| !e.is_expired())
                .map(|idx| entries.get_index(idx).unwrap().0.clone()),
            EvictionPolicy::Lru => entries
                .iter()
                .filter(|(_, e)| !e.is_expired())
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => entries
                .iter()
                .filter(|(_, e)| !e.is_expired())
                .min_by_key(|(_, e)| (e.access_count, e.last_access))
                .map(|(k, _)| k.clone()),
        };

        if let Some(key) = victim {
            entries.shift_remove(&key);
            self.stats.lock().evictions += 1;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key).is_some_and(Entry::is_expired);
        if expired {
            entries.shift_remove(key);
            self.stats.lock().misses += 1;
            return Ok(None);
        }
        match entries.get_mut(key) {
            Some(entry) => {
                entry.touch();
                self.stats.lock().hits += 1;
                Ok(Some(entry.value.clone()))
            }
            None => {
                self.stats.lock().misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) && entries.len() >= self.max_size {
            self.evict_one(&mut entries);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        self.stats.lock().sets += 1;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.entries.lock().shift_remove(key).is_some();
        if removed {
            self.stats.lock().deletes += 1;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key).is_some_and(Entry::is_expired);
        if expired {
            entries.shift_remove(key);
            return Ok(false);
        }
        Ok(entries.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        self.stats.lock().clears += 1;
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired());
        Ok(entries.len())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired());
        let predicate = pattern_predicate(pattern);
        Ok(entries
            .keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<Stats> {
        Ok(*self.stats.lock())
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Option<i64>>> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key).is_some_and(Entry::is_expired);
        if expired {
            entries.shift_remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(Entry::ttl_seconds))
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = ttl.map(|d| std::time::SystemTime::now() + d);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let backend = MemoryBackend::new(10, EvictionPolicy::Lru);
        backend.set("k", json!("v"), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(json!("v")));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let backend = MemoryBackend::new(10, EvictionPolicy::Lru);
        backend
            .set("k", json!("v"), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fifo_evicts_oldest_insertion() {
        let backend = MemoryBackend::new(2, EvictionPolicy::Fifo);
        backend.set("a", json!(1), None).await.unwrap();
        backend.set("b", json!(2), None).await.unwrap();
        backend.set("c", json!(3), None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap(), Some(json!(2)));
        assert_eq!(backend.get("c").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let backend = MemoryBackend::new(2, EvictionPolicy::Lru);
        backend.set("a", json!(1), None).await.unwrap();
        backend.set("b", json!(2), None).await.unwrap();
        backend.get("a").await.unwrap();
        backend.set("c", json!(3), None).await.unwrap();
        assert_eq!(backend.get("b").await.unwrap(), None);
        assert_eq!(backend.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn lfu_evicts_least_frequently_used() {
        let backend = MemoryBackend::new(2, EvictionPolicy::Lfu);
        backend.set("a", json!(1), None).await.unwrap();
        backend.set("b", json!(2), None).await.unwrap();
        backend.get("a").await.unwrap();
        backend.get("a").await.unwrap();
        backend.set("c", json!(3), None).await.unwrap();
        assert_eq!(backend.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let backend = MemoryBackend::new(10, EvictionPolicy::Lru);
        backend.set("a", json!(1), None).await.unwrap();
        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
        backend.set("b", json!(2), None).await.unwrap();
        backend.clear().await.unwrap();
        assert_eq!(backend.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn keys_falls_back_to_prefix_on_invalid_regex() {
        let backend = MemoryBackend::new(10, EvictionPolicy::Lru);
        backend.set("user:1", json!(1), None).await.unwrap();
        backend.set("order:1", json!(1), None).await.unwrap();
        let keys = backend.keys(Some("user:[")).await.unwrap();
        assert_eq!(keys, vec!["user:1".to_string()]);
    }
}
