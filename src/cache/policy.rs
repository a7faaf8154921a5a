//! Caching policy helpers shared by [`super::manager::Manager`].
//!
//! `should_cache` combines the global policy level, the namespace hook,
//! and the model/operation allowlists into one admission check so the
//! manager's read/write paths stay readable.

use crate::config::{CacheConfig, CachingPolicyLevel};

/// Whether a `(model_id, operation)` pair should be cached under `config`,
/// given the current namespace hook result.
#[must_use]
pub fn should_cache(config: &CacheConfig, model_id: &str, operation: &str, namespace_allowed: bool) -> bool {
    if !config.enabled || config.policy_level == CachingPolicyLevel::Disabled {
        return false;
    }
    if !namespace_allowed {
        return false;
    }
    if !config.model_allowlist.is_empty() && !config.model_allowlist.contains(model_id) {
        return false;
    }
    if !config.operation_allowlist.is_empty() && !config.operation_allowlist.contains(operation) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_level_blocks_everything() {
        let mut config = CacheConfig::default();
        config.policy_level = CachingPolicyLevel::Disabled;
        assert!(!should_cache(&config, "m", "op", true));
    }

    #[test]
    fn namespace_hook_can_veto() {
        let config = CacheConfig::default();
        assert!(!should_cache(&config, "m", "op", false));
    }

    #[test]
    fn allowlists_restrict_model_and_operation() {
        let mut config = CacheConfig::default();
        config.model_allowlist.insert("allowed-model".to_string());
        assert!(!should_cache(&config, "other-model", "op", true));
        assert!(should_cache(&config, "allowed-model", "op", true));
    }
}
