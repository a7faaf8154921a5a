//! Cache manager / service (C8).
//!
//! The single entry point callers use: wraps a concrete [`super::Backend`]
//! with namespace versioning, policy gating, and the allowlists from
//! [`crate::config::CacheConfig`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::config::CacheConfig;

use super::disk::DiskBackend;
use super::key::CacheKey;
use super::memory::MemoryBackend;
use super::policy::should_cache;
use super::sql::SqlBackend;
use super::version::VersionManager;
use super::{Backend, Stats, Value};

/// Namespace gate: maps a namespace name to "is caching allowed here".
pub type NamespaceHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Orchestrates a backend, the version manager, and cache policy.
pub struct Manager {
    backend: arc_swap::ArcSwap<dyn Backend>,
    versions: VersionManager,
    config: parking_lot::RwLock<CacheConfig>,
    namespace_hook: parking_lot::RwLock<Option<NamespaceHook>>,
    generation: AtomicUsize,
}

impl Manager {
    /// Construct a backend from `config`. A `remote` backend that fails to
    /// connect falls back to the in-memory backend, logged once (spec
    /// §4.5 construction-time fallback).
    pub async fn new(config: CacheConfig) -> Result<Self> {
        let backend = Self::build_backend(&config).await;
        Ok(Self {
            backend: arc_swap::ArcSwap::from_pointee(backend),
            versions: VersionManager::new(),
            config: parking_lot::RwLock::new(config),
            namespace_hook: parking_lot::RwLock::new(None),
            generation: AtomicUsize::new(0),
        })
    }

    async fn build_backend(config: &CacheConfig) -> Arc<dyn Backend> {
        use crate::config::CacheBackendKind;
        match config.backend {
            CacheBackendKind::Memory => {
                Arc::new(MemoryBackend::new(config.max_size, config.eviction_policy))
            }
            CacheBackendKind::Disk => {
                match DiskBackend::new(&config.disk_dir, config.max_size, config.eviction_policy) {
                    Ok(backend) => Arc::new(backend),
                    Err(err) => {
                        warn!(error = %err, "disk cache backend unavailable, falling back to memory");
                        Arc::new(MemoryBackend::new(config.max_size, config.eviction_policy))
                    }
                }
            }
            CacheBackendKind::Sql => match SqlBackend::new(&config.sql_path) {
                Ok(backend) => Arc::new(backend),
                Err(err) => {
                    warn!(error = %err, "sql cache backend unavailable, falling back to memory");
                    Arc::new(MemoryBackend::new(config.max_size, config.eviction_policy))
                }
            },
            CacheBackendKind::Remote => {
                match super::remote::RemoteBackend::new(&config.remote_url, &config.remote_prefix).await {
                    Ok(backend) => Arc::new(backend),
                    Err(err) => {
                        warn!(error = %err, "remote cache backend unavailable, falling back to memory");
                        Arc::new(MemoryBackend::new(config.max_size, config.eviction_policy))
                    }
                }
            }
        }
    }

    /// Replace the namespace hook. A `None` hook allows every namespace.
    pub fn set_namespace_hook(&self, hook: Option<NamespaceHook>) {
        *self.namespace_hook.write() = hook;
    }

    fn namespace_allowed(&self, namespace: &str) -> bool {
        self.namespace_hook
            .read()
            .as_ref()
            .is_none_or(|hook| hook(namespace))
    }

    fn versioned_key(&self, key: &CacheKey) -> String {
        let version = self.versions.namespace_version(&key.model_id);
        format!("v:{version}:{key}")
    }

    /// Bump `namespace`'s version, invalidating every key previously
    /// stored under it without enumerating and deleting them.
    pub fn bump_namespace_version(&self, namespace: &str) {
        self.versions.bump_sequential(namespace);
    }

    /// Bump `namespace` to a code-identity version derived from `source`.
    pub fn bump_namespace_code_version(&self, namespace: &str, source: &str) {
        self.versions.bump_code(namespace, source);
    }

    /// Fetch a cached value, honoring policy gates. A disallowed namespace
    /// or model/operation behaves as a miss (spec §4.7/§4.8).
    pub async fn get<I: Serialize, P: Serialize>(
        &self,
        model_id: &str,
        operation: &str,
        inputs: &I,
        parameters: &P,
    ) -> Result<Option<Value>> {
        let config = self.config.read().clone();
        if !should_cache(&config, model_id, operation, self.namespace_allowed(model_id)) {
            return Ok(None);
        }
        let key = CacheKey::build(model_id, operation, inputs, parameters)?;
        self.backend.load().get(&self.versioned_key(&key)).await
    }

    /// Store a value, honoring policy gates. A disallowed namespace or
    /// model/operation is a no-op success (spec §4.7/§4.8).
    pub async fn set<I: Serialize, P: Serialize>(
        &self,
        model_id: &str,
        operation: &str,
        inputs: &I,
        parameters: &P,
        value: Value,
        ttl: Option<std::time::Duration>,
    ) -> Result<bool> {
        let config = self.config.read().clone();
        if !should_cache(&config, model_id, operation, self.namespace_allowed(model_id)) {
            return Ok(true);
        }
        let key = CacheKey::build(model_id, operation, inputs, parameters)?;
        let ttl = ttl.or(Some(config.default_ttl));
        self.backend.load().set(&self.versioned_key(&key), value, ttl).await
    }

    /// Delete a cached entry.
    pub async fn delete<I: Serialize, P: Serialize>(
        &self,
        model_id: &str,
        operation: &str,
        inputs: &I,
        parameters: &P,
    ) -> Result<bool> {
        let key = CacheKey::build(model_id, operation, inputs, parameters)?;
        self.backend.load().delete(&self.versioned_key(&key)).await
    }

    /// Whether a cached entry exists.
    pub async fn exists<I: Serialize, P: Serialize>(
        &self,
        model_id: &str,
        operation: &str,
        inputs: &I,
        parameters: &P,
    ) -> Result<bool> {
        let key = CacheKey::build(model_id, operation, inputs, parameters)?;
        self.backend.load().exists(&self.versioned_key(&key)).await
    }

    /// Clear the entire backend.
    pub async fn clear(&self) -> Result<()> {
        self.backend.load().clear().await
    }

    /// Delete every stored key whose structured `model_id` equals `ns`.
    /// Empty namespace is a no-op success (spec §4.7).
    pub async fn clear_namespace(&self, ns: &str) -> Result<usize> {
        let backend = self.backend.load_full();
        let mut removed = 0;
        for raw in backend.keys(None).await? {
            // Stored keys carry the `v:{version}:` prefix; strip it before parsing.
            let Some(without_version) = strip_version_prefix(&raw) else {
                continue;
            };
            if let Ok(parsed) = CacheKey::parse(without_version) {
                if parsed.model_id == ns && backend.delete(&raw).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// List stored keys (version prefix intact), optionally filtered.
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.backend.load().keys(pattern).await
    }

    /// Live entry count.
    pub async fn size(&self) -> Result<usize> {
        self.backend.load().size().await
    }

    /// Backend counters.
    pub async fn stats(&self) -> Result<Stats> {
        self.backend.load().stats().await
    }

    /// Replace the live configuration, constructing a fresh backend.
    /// In-flight operations against the old backend complete normally;
    /// they simply will not observe whatever the new backend holds.
    pub async fn set_config(&self, config: CacheConfig) {
        let new_backend = Self::build_backend(&config).await;
        self.backend.store(new_backend);
        *self.config.write() = config;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Generation counter, bumped on every `set_config` call. Exposed for
    /// tests that need to observe a configuration swap happened.
    #[must_use]
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::SeqCst)
    }

    /// The Rust analog of the `@cached` decorator: wraps `compute` so its
    /// result is looked up by `(model_id, operation, inputs, source)` and
    /// stored back on a miss. `force_refresh` bypasses the read but still
    /// stores the recomputed value (spec §4.7 `cached` wrapper).
    pub async fn cached_call<I, F, Fut>(
        &self,
        model_id: &str,
        operation: &str,
        inputs: &I,
        source: &str,
        force_refresh: bool,
        compute: F,
    ) -> Result<Value>
    where
        I: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let source_digest = self.versions.code_digest(operation, source);
        if !force_refresh {
            if let Some(value) = self.get(model_id, operation, inputs, &source_digest).await? {
                return Ok(value);
            }
        }
        let value = compute().await?;
        self.set(model_id, operation, inputs, &source_digest, value.clone(), None)
            .await?;
        Ok(value)
    }
}

fn strip_version_prefix(raw: &str) -> Option<&str> {
    let rest = raw.strip_prefix("v:")?;
    let (_, after_version) = rest.split_once(':')?;
    Some(after_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackendKind;
    use serde_json::json;

    async fn manager_with(config: CacheConfig) -> Manager {
        Manager::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let manager = manager_with(CacheConfig::default()).await;
        manager
            .set("model", "op", &json!(["x"]), &json!({}), json!(42), None)
            .await
            .unwrap();
        let got = manager.get("model", "op", &json!(["x"]), &json!({})).await.unwrap();
        assert_eq!(got, Some(json!(42)));
    }

    #[tokio::test]
    async fn namespace_hook_vetoes_reads_and_writes() {
        let manager = manager_with(CacheConfig::default()).await;
        manager.set_namespace_hook(Some(Arc::new(|ns: &str| ns != "blocked")));
        manager
            .set("blocked", "op", &json!(["x"]), &json!({}), json!(1), None)
            .await
            .unwrap();
        assert_eq!(
            manager.get("blocked", "op", &json!(["x"]), &json!({})).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn bumping_namespace_version_invalidates_old_keys() {
        let manager = manager_with(CacheConfig::default()).await;
        manager
            .set("model", "op", &json!(["x"]), &json!({}), json!(1), None)
            .await
            .unwrap();
        manager.bump_namespace_version("model");
        assert_eq!(
            manager.get("model", "op", &json!(["x"]), &json!({})).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn clear_namespace_only_removes_matching_model_id() {
        let manager = manager_with(CacheConfig::default()).await;
        manager
            .set("a", "op", &json!(["x"]), &json!({}), json!(1), None)
            .await
            .unwrap();
        manager
            .set("b", "op", &json!(["x"]), &json!({}), json!(2), None)
            .await
            .unwrap();
        let removed = manager.clear_namespace("a").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(manager.get("a", "op", &json!(["x"]), &json!({})).await.unwrap(), None);
        assert_eq!(
            manager.get("b", "op", &json!(["x"]), &json!({})).await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn cached_call_computes_once_then_reuses() {
        let manager = manager_with(CacheConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let source = "fn compute() {}";

        for _ in 0..3 {
            let calls = calls.clone();
            let value = manager
                .cached_call("model", "op", &json!(["x"]), source, false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("computed"))
                })
                .await
                .unwrap();
            assert_eq!(value, json!("computed"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_recomputes_and_overwrites() {
        let manager = manager_with(CacheConfig::default()).await;
        let source = "fn compute() {}";
        manager
            .cached_call("model", "op", &json!(["x"]), source, false, || async { Ok(json!(1)) })
            .await
            .unwrap();
        let refreshed = manager
            .cached_call("model", "op", &json!(["x"]), source, true, || async { Ok(json!(2)) })
            .await
            .unwrap();
        assert_eq!(refreshed, json!(2));
    }

    #[tokio::test]
    async fn set_config_swaps_the_backend() {
        let manager = manager_with(CacheConfig::default()).await;
        manager
            .set("model", "op", &json!(["x"]), &json!({}), json!(1), None)
            .await
            .unwrap();
        let mut new_config = CacheConfig::default();
        new_config.backend = CacheBackendKind::Memory;
        manager.set_config(new_config).await;
        assert_eq!(manager.generation(), 1);
        assert_eq!(manager.get("model", "op", &json!(["x"]), &json!({})).await.unwrap(), None);
    }
}
