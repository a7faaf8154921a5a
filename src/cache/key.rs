//! Canonical cache key codec (C6).
//!
//! A key is four `:`-joined segments: `model_id:operation:input_hash:
//! parameters_hash`. Each hash is a hex-encoded SHA-256 digest of the
//! canonical serialization of its input — canonical meaning object keys
//! sorted recursively, so two semantically-equal inputs always fingerprint
//! identically regardless of how they were originally constructed.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const SEPARATOR: char = ':';

/// A parsed, structured cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Model or namespace identifier
    pub model_id: String,
    /// Operation name within that namespace
    pub operation: String,
    /// Hex digest of the canonicalized input
    pub input_hash: String,
    /// Hex digest of the canonicalized parameters
    pub parameters_hash: String,
}

impl CacheKey {
    /// Build a key from raw components, hashing `inputs` and `parameters`
    /// via their canonical serialization.
    pub fn build<I, P>(model_id: &str, operation: &str, inputs: &I, parameters: &P) -> Result<Self>
    where
        I: Serialize,
        P: Serialize,
    {
        Ok(Self {
            model_id: model_id.to_string(),
            operation: operation.to_string(),
            input_hash: fingerprint(inputs)?,
            parameters_hash: fingerprint(parameters)?,
        })
    }

    /// Build a key from already-hashed segments, e.g. when reconstructing
    /// from a stored stats/metadata record.
    #[must_use]
    pub fn from_parts(
        model_id: impl Into<String>,
        operation: impl Into<String>,
        input_hash: impl Into<String>,
        parameters_hash: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            operation: operation.into(),
            input_hash: input_hash.into(),
            parameters_hash: parameters_hash.into(),
        }
    }

    /// Parse a `model_id:operation:input_hash:parameters_hash` string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] unless the string splits into exactly
    /// four segments on `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        let [model_id, operation, input_hash, parameters_hash] = parts.as_slice() else {
            return Err(Error::InvalidKey(raw.to_string()));
        };
        Ok(Self::from_parts(
            *model_id,
            *operation,
            *input_hash,
            *parameters_hash,
        ))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.model_id, self.operation, self.input_hash, self.parameters_hash
        )
    }
}

/// Recursively canonicalize a JSON value: object keys sorted, arrays left
/// in place (order is part of their identity), scalars untouched.
fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

/// Hash the canonical form of `value`: hex-encoded SHA-256 of its
/// canonicalized JSON serialization.
///
/// # Errors
///
/// Returns [`Error::Json`] if `value` cannot be serialized to JSON.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let raw = serde_json::to_value(value)?;
    let canonical = canonicalize(raw);
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_order_independent_for_object_keys() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_is_order_dependent_for_arrays() {
        let a = json!(["x", "y"]);
        let b = json!(["y", "x"]);
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let key = CacheKey::build(
            "gpt-4",
            "completion",
            &json!(["hello"]),
            &json!({"temperature": 0.0}),
        )
        .unwrap();
        let parsed = CacheKey::parse(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn rejects_malformed_key_strings() {
        assert!(matches!(
            CacheKey::parse("only:three:parts"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            CacheKey::parse("way:too:many:parts:here"),
            Err(Error::InvalidKey(_))
        ));
    }
}
