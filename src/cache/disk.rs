//! On-disk cache backend (C3).
//!
//! Each entry is two files under `dir`: the value at `{dir}/{sha256(key)}`
//! (JSON only — arbitrary-object deserialization is forbidden) and its
//! metadata at `{dir}/_metadata/{sha256(key)}.json`. Counters live in
//! `{dir}/_metadata/stats.json`. Writes go through a temp file and a
//! rename so a reader never observes a partially-written entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};
use crate::config::EvictionPolicy;

use super::{Backend, Stats, Value};

#[derive(Debug, Serialize, Deserialize)]
struct DiskMetadata {
    key: String,
    expiration_time: Option<f64>,
    access_count: u64,
    last_access_time: f64,
    creation_time: f64,
}

impl DiskMetadata {
    fn is_expired(&self) -> bool {
        self.expiration_time.is_some_and(|exp| now_secs() > exp)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// File-backed cache with the `lru`/`lfu`/`fifo` eviction table from the
/// in-memory backend applied at the metadata level.
pub struct DiskBackend {
    dir: PathBuf,
    metadata_dir: PathBuf,
    stats_file: PathBuf,
    max_size: usize,
    eviction_policy: EvictionPolicy,
    lock: Arc<Mutex<()>>,
}

impl DiskBackend {
    /// Open (creating if absent) a disk-backed cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory tree cannot be created.
    pub fn new(dir: impl AsRef<Path>, max_size: usize, eviction_policy: EvictionPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let metadata_dir = dir.join("_metadata");
        fs::create_dir_all(&metadata_dir)?;
        Ok(Self {
            stats_file: metadata_dir.join("stats.json"),
            dir,
            metadata_dir,
            max_size,
            eviction_policy,
            lock: Arc::new(Mutex::new(())),
        })
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(hash_key(key))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.metadata_dir.join(format!("{}.json", hash_key(key)))
    }

    fn load_metadata(&self, key: &str) -> Option<DiskMetadata> {
        let raw = fs::read(self.metadata_path(key)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or(&self.dir))?;
        std::io::Write::write_all(&mut tmp, bytes)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn save_metadata(&self, key: &str, metadata: &DiskMetadata) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(metadata).unwrap_or_default();
        self.write_atomic(&self.metadata_path(key), &bytes)
    }

    fn load_stats(&self) -> Stats {
        fs::read(&self.stats_file)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    fn save_stats(&self, stats: &Stats) {
        if let Ok(bytes) = serde_json::to_vec(stats) {
            let _ = self.write_atomic(&self.stats_file, &bytes);
        }
    }

    fn bump_stat(&self, f: impl FnOnce(&mut Stats)) {
        let mut stats = self.load_stats();
        f(&mut stats);
        self.save_stats(&stats);
    }

    /// All live keys (metadata's own `key` field, not the hash), removing
    /// any that have expired as a side effect.
    fn live_keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(&self.metadata_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("stats.json") {
                continue;
            }
            let Ok(raw) = fs::read(&path) else { continue };
            let Ok(metadata) = serde_json::from_slice::<DiskMetadata>(&raw) else {
                continue;
            };
            if metadata.is_expired() {
                let _ = self.remove_files(&metadata.key);
                continue;
            }
            out.push(metadata.key);
        }
        out
    }

    fn remove_files(&self, key: &str) -> std::io::Result<()> {
        let _ = fs::remove_file(self.value_path(key));
        let _ = fs::remove_file(self.metadata_path(key));
        Ok(())
    }

    fn evict_one(&self) {
        let keys = self.live_keys();
        if keys.is_empty() {
            return;
        }
        let metas: Vec<(String, DiskMetadata)> = keys
            .into_iter()
            .filter_map(|k| self.load_metadata(&k).map(|m| (k, m)))
            .collect();
        let victim = match self.eviction_policy {
            EvictionPolicy::Fifo => metas
                .iter()
                .min_by(|a, b| a.1.creation_time.total_cmp(&b.1.creation_time))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lru => metas
                .iter()
                .min_by(|a, b| a.1.last_access_time.total_cmp(&b.1.last_access_time))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => metas
                .iter()
                .min_by(|a, b| {
                    a.1.access_count
                        .cmp(&b.1.access_count)
                        .then(a.1.last_access_time.total_cmp(&b.1.last_access_time))
                })
                .map(|(k, _)| k.clone()),
        };
        if let Some(key) = victim {
            let _ = self.remove_files(&key);
            self.bump_stat(|s| s.evictions += 1);
        }
    }
}

#[async_trait]
impl Backend for DiskBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock();
        let Some(mut metadata) = self.load_metadata(key) else {
            self.bump_stat(|s| s.misses += 1);
            return Ok(None);
        };
        if metadata.is_expired() {
            let _ = self.remove_files(key);
            self.bump_stat(|s| s.misses += 1);
            return Ok(None);
        }
        let Ok(raw) = fs::read(self.value_path(key)) else {
            self.bump_stat(|s| s.misses += 1);
            return Ok(None);
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            self.bump_stat(|s| s.misses += 1);
            return Ok(None);
        };
        metadata.access_count += 1;
        metadata.last_access_time = now_secs();
        let _ = self.save_metadata(key, &metadata);
        self.bump_stat(|s| s.hits += 1);
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let _guard = self.lock.lock();
        let already_exists = self.load_metadata(key).is_some_and(|m| !m.is_expired());
        if !already_exists && self.live_keys().len() >= self.max_size {
            self.evict_one();
        }

        let Ok(value_bytes) = serde_json::to_vec(&value) else {
            return Ok(false);
        };
        if self.write_atomic(&self.value_path(key), &value_bytes).is_err() {
            return Ok(false);
        }

        let now = now_secs();
        let metadata = DiskMetadata {
            key: key.to_string(),
            expiration_time: ttl.map(|d| now + d.as_secs_f64()),
            access_count: 0,
            last_access_time: now,
            creation_time: now,
        };
        if self.save_metadata(key, &metadata).is_err() {
            return Ok(false);
        }
        self.bump_stat(|s| s.sets += 1);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let existed = self.load_metadata(key).is_some();
        self.remove_files(key)?;
        if existed {
            self.bump_stat(|s| s.deletes += 1);
        }
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        match self.load_metadata(key) {
            Some(metadata) if metadata.is_expired() => {
                let _ = self.remove_files(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        for key in self.live_keys() {
            let _ = self.remove_files(&key);
        }
        self.bump_stat(|s| s.clears += 1);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        Ok(self.live_keys().len())
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let _guard = self.lock.lock();
        let predicate = super::pattern_predicate(pattern);
        Ok(self
            .live_keys()
            .into_iter()
            .filter(|k| predicate(k))
            .collect())
    }

    async fn stats(&self) -> Result<Stats> {
        let _guard = self.lock.lock();
        Ok(self.load_stats())
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Option<i64>>> {
        let _guard = self.lock.lock();
        match self.load_metadata(key) {
            Some(metadata) if metadata.is_expired() => {
                let _ = self.remove_files(key);
                Ok(None)
            }
            Some(metadata) => Ok(Some(metadata.expiration_time.map(|exp| {
                let remaining = exp - now_secs();
                if remaining > 0.0 { remaining as i64 } else { 0 }
            }))),
            None => Ok(None),
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let _guard = self.lock.lock();
        let Some(mut metadata) = self.load_metadata(key) else {
            return Ok(false);
        };
        if metadata.is_expired() {
            let _ = self.remove_files(key);
            return Ok(false);
        }
        metadata.expiration_time = ttl.map(|d| now_secs() + d.as_secs_f64());
        self.save_metadata(key, &metadata)
            .map_err(Error::from)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), 10, EvictionPolicy::Lru).unwrap();
        backend.set("k", json!({"v": 1}), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss_and_is_removed() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), 10, EvictionPolicy::Lru).unwrap();
        backend
            .set("k", json!(1), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn evicts_at_capacity() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), 1, EvictionPolicy::Fifo).unwrap();
        backend.set("a", json!(1), None).await.unwrap();
        backend.set("b", json!(2), None).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_reports_prior_presence() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), 10, EvictionPolicy::Lru).unwrap();
        backend.set("a", json!(1), None).await.unwrap();
        assert!(backend.delete("a").await.unwrap());
        assert!(!backend.delete("a").await.unwrap());
    }

    #[tokio::test]
    async fn stats_survive_reopening_the_backend() {
        let dir = tempdir().unwrap();
        {
            let backend = DiskBackend::new(dir.path(), 10, EvictionPolicy::Lru).unwrap();
            backend.set("a", json!(1), None).await.unwrap();
        }
        let backend = DiskBackend::new(dir.path(), 10, EvictionPolicy::Lru).unwrap();
        assert_eq!(backend.stats().await.unwrap().sets, 1);
    }
}
