//! Namespace version manager (C7).
//!
//! Keys stored through a [`crate::cache::Manager`] are prefixed with
//! `v:{version}:` where `version` comes from here. Bumping a namespace's
//! version invalidates every key written under the old prefix without
//! having to enumerate and delete them.

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// A namespace's current version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version {
    /// Monotonically increasing integer version (`v1`, `v2`, ...)
    Sequential(u64),
    /// Version pinned to a source-code digest (`code-{digest}`)
    Code(String),
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential(n) => write!(f, "v{n}"),
            Self::Code(digest) => write!(f, "code-{digest}"),
        }
    }
}

/// Tracks namespace versions and memoized code-identity digests.
///
/// Never exposes the raw bytes behind a digest — only its hex string.
#[derive(Debug, Default)]
pub struct VersionManager {
    namespaces: DashMap<String, Version>,
    code_digests: DashMap<String, String>,
}

impl VersionManager {
    /// Construct an empty version manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version for `namespace`. With `auto_version`, an unseen
    /// namespace is registered at `v1` and that version returned; without
    /// it, an unseen namespace also starts at `v1` since every namespace
    /// must have *some* version the first time a key is built.
    pub fn namespace_version(&self, namespace: &str) -> Version {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert(Version::Sequential(1))
            .clone()
    }

    /// Bump `namespace` to the next sequential integer version, or to
    /// `v1` if it has never been seen.
    pub fn bump_sequential(&self, namespace: &str) -> Version {
        let next = match self.namespaces.get(namespace).map(|v| v.clone()) {
            Some(Version::Sequential(n)) => Version::Sequential(n + 1),
            Some(Version::Code(_)) | None => Version::Sequential(1),
        };
        self.namespaces.insert(namespace.to_string(), next.clone());
        next
    }

    /// Bump `namespace` to a code-identity version derived from `source`.
    pub fn bump_code(&self, namespace: &str, source: &str) -> Version {
        let digest = digest_source(source);
        let version = Version::Code(digest);
        self.namespaces.insert(namespace.to_string(), version.clone());
        version
    }

    /// Memoized digest of a function or class's source text, cached by
    /// `identity` (e.g. a fully-qualified name) so repeated lookups for
    /// the same code identity are O(1).
    pub fn code_digest(&self, identity: &str, source: &str) -> String {
        self.code_digests
            .entry(identity.to_string())
            .or_insert_with(|| digest_source(source))
            .clone()
    }
}

/// Digest a function/class's source text.
#[must_use]
pub fn digest_source(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// Digest a data model's attribute name-and-type schema, incorporating
/// field order (schema changes are a reason to bump, field reorderings
/// included).
#[must_use]
pub fn digest_data_model(name: &str, fields: &[(&str, &str)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    for (field_name, field_type) in fields {
        hasher.update(b"\0");
        hasher.update(field_name.as_bytes());
        hasher.update(b":");
        hasher.update(field_type.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_namespace_starts_at_v1() {
        let manager = VersionManager::new();
        assert_eq!(manager.namespace_version("ns"), Version::Sequential(1));
    }

    #[test]
    fn bump_sequential_increments() {
        let manager = VersionManager::new();
        manager.namespace_version("ns");
        assert_eq!(manager.bump_sequential("ns"), Version::Sequential(2));
        assert_eq!(manager.bump_sequential("ns"), Version::Sequential(3));
    }

    #[test]
    fn bump_code_switches_to_code_identity() {
        let manager = VersionManager::new();
        let version = manager.bump_code("ns", "def f(): pass");
        assert!(matches!(version, Version::Code(_)));
        assert_eq!(version.to_string(), format!("code-{}", digest_source("def f(): pass")));
    }

    #[test]
    fn code_digest_is_memoized_per_identity() {
        let manager = VersionManager::new();
        let first = manager.code_digest("mymod.f", "source-a");
        let second = manager.code_digest("mymod.f", "source-b");
        assert_eq!(first, second, "memoized digest must not change on restated source");
    }

    #[test]
    fn data_model_digest_is_sensitive_to_field_order() {
        let a = digest_data_model("User", &[("id", "u64"), ("name", "String")]);
        let b = digest_data_model("User", &[("name", "String"), ("id", "u64")]);
        assert_ne!(a, b);
    }
}
