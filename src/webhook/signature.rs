//! HMAC signature codec (C9).
//!
//! Grounded on the inbound-webhook verifier in the gateway's
//! `validate_signature` — this module is its outbound mirror, used both
//! to sign deliveries and to let a receiver-side test harness verify
//! them. Extended with timestamp-bound and nonce-bound modes named in
//! the delivery engine's spec.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn now_or_zero() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Hex-encoded HMAC-SHA256 digest of `payload` keyed by `secret`.
#[must_use]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a raw (non-timestamped) signature in constant time.
#[must_use]
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex_decode(&sign(secret, payload)) else {
        return false;
    };
    let Ok(given) = hex_decode(signature) else {
        return false;
    };
    constant_time_eq(&expected, &given)
}

/// Build a timestamp-bound header: `t={unix},v1={hmac({unix}:{payload})}`.
#[must_use]
pub fn sign_with_timestamp(secret: &str, payload: &[u8]) -> String {
    let ts = now_or_zero();
    let signed_over = timestamped_message(ts, payload);
    format!("t={ts},v1={}", sign(secret, &signed_over))
}

/// Verify a `t=..,v1=..` header, rejecting if the timestamp is missing,
/// malformed, or older than `max_age_secs`.
#[must_use]
pub fn verify_with_timestamp(secret: &str, payload: &[u8], header: &str, max_age_secs: i64) -> bool {
    let Some((ts, digest)) = parse_timestamped_header(header) else {
        return false;
    };
    let now = now_or_zero();
    if now.saturating_sub(ts) > max_age_secs || ts > now {
        return false;
    }
    let signed_over = timestamped_message(ts, payload);
    verify(secret, &signed_over, &digest)
}

fn timestamped_message(ts: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = ts.to_string().into_bytes();
    out.push(b':');
    out.extend_from_slice(payload);
    out
}

fn parse_timestamped_header(header: &str) -> Option<(i64, String)> {
    let mut ts = None;
    let mut digest = None;
    for part in header.split(',') {
        let (key, value) = part.split_once('=')?;
        match key {
            "t" => ts = value.parse::<i64>().ok(),
            "v1" => digest = Some(value.to_string()),
            _ => {}
        }
    }
    Some((ts?, digest?))
}

/// A replay guard for nonce-bound signatures: true if `nonce` has not
/// been seen before (and is now recorded as seen).
pub trait NonceStore: Send + Sync {
    /// Record `nonce` as seen, returning whether it was fresh.
    fn observe(&self, nonce: &str) -> bool;
}

/// Verify a payload carrying a `nonce` field, rejecting replays via
/// `store`. The signature itself is the plain HMAC over `payload`.
#[must_use]
pub fn verify_with_nonce(
    secret: &str,
    payload: &[u8],
    signature: &str,
    nonce: &str,
    store: &dyn NonceStore,
) -> bool {
    if !verify(secret, payload, signature) {
        return false;
    }
    store.observe(nonce)
}

fn hex_decode(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct InMemoryNonceStore(Mutex<HashSet<String>>);

    impl NonceStore for InMemoryNonceStore {
        fn observe(&self, nonce: &str) -> bool {
            self.0.lock().unwrap().insert(nonce.to_string())
        }
    }

    #[test]
    fn verify_accepts_a_matching_signature() {
        let sig = sign("s", b"{\"id\":\"e1\"}");
        assert!(verify("s", b"{\"id\":\"e1\"}", &sig));
    }

    #[test]
    fn verify_rejects_a_changed_payload_byte() {
        let sig = sign("s", b"{\"id\":\"e1\"}");
        assert!(!verify("s", b"{\"id\":\"e2\"}", &sig));
    }

    #[test]
    fn verify_rejects_a_different_secret() {
        let sig = sign("s", b"{\"id\":\"e1\"}");
        assert!(!verify("other", b"{\"id\":\"e1\"}", &sig));
    }

    #[test]
    fn verify_rejects_malformed_signature_without_panicking() {
        assert!(!verify("s", b"payload", "not-hex!!"));
        assert!(!verify("s", b"payload", ""));
    }

    #[test]
    fn timestamped_header_round_trips() {
        let header = sign_with_timestamp("s", b"payload");
        assert!(verify_with_timestamp("s", b"payload", &header, 300));
    }

    #[test]
    fn timestamped_header_rejects_beyond_max_age() {
        let header = format!("t=1,v1={}", sign("s", &timestamped_message(1, b"payload")));
        assert!(!verify_with_timestamp("s", b"payload", &header, 300));
    }

    #[test]
    fn nonce_store_rejects_replay() {
        let store = InMemoryNonceStore(Mutex::new(HashSet::new()));
        let sig = sign("s", b"payload");
        assert!(verify_with_nonce("s", b"payload", &sig, "nonce-1", &store));
        assert!(!verify_with_nonce("s", b"payload", &sig, "nonce-1", &store));
    }
}
