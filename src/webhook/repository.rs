//! Webhook repository (C12): durable JSON-file-per-record storage for
//! webhooks, deliveries, and attempts, with an in-memory subscriber
//! index rebuilt on load.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::RwLock;
use pbkdf2::pbkdf2_hmac_array;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::WebhookConfig;
use crate::{Error, Result};

use super::{Attempt, AttemptStatus, Delivery, DeliveryStatus, Webhook, new_id, now_unix};

const PBKDF2_ROUNDS: u32 = 100_000;

/// Fields accepted by [`Repository::update_webhook`]; absent fields are
/// left unchanged.
#[derive(Debug, Default)]
pub struct WebhookUpdate {
    /// New URL
    pub url: Option<String>,
    /// New event subscriptions
    pub events: Option<Vec<String>>,
    /// New description
    pub description: Option<Option<String>>,
    /// New active flag
    pub active: Option<bool>,
    /// New secret (replaces `secret_hash`)
    pub secret: Option<String>,
}

struct Dirs {
    webhooks: PathBuf,
    deliveries: PathBuf,
    attempts: PathBuf,
}

/// Durable store for webhooks, deliveries, and attempts.
pub struct Repository {
    dirs: Dirs,
    webhooks: RwLock<HashMap<String, Webhook>>,
    deliveries: RwLock<HashMap<String, Delivery>>,
    attempts: RwLock<HashMap<String, Vec<String>>>,
    attempt_records: RwLock<HashMap<String, Attempt>>,
    /// event type → subscribed webhook ids
    subscriber_index: RwLock<HashMap<String, HashSet<String>>>,
    /// Encrypted-secret opt-in mode (see [`Self::open_with_config`])
    encrypt_secrets: bool,
    /// Passphrase the encrypted-secret mode stretches into an AES-256 key
    encryption_key: String,
}

impl Repository {
    /// Open (creating if absent) a repository rooted at `root`, loading
    /// every existing record and rebuilding the subscriber index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory tree cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let dirs = Dirs {
            webhooks: root.join("webhooks"),
            deliveries: root.join("deliveries"),
            attempts: root.join("attempts"),
        };
        fs::create_dir_all(&dirs.webhooks)?;
        fs::create_dir_all(&dirs.deliveries)?;
        fs::create_dir_all(&dirs.attempts)?;

        let webhooks = load_records::<Webhook>(&dirs.webhooks);
        let deliveries = load_records::<Delivery>(&dirs.deliveries);
        let attempt_records = load_records::<Attempt>(&dirs.attempts);

        let mut subscriber_index: HashMap<String, HashSet<String>> = HashMap::new();
        for (id, webhook) in &webhooks {
            for event in &webhook.events {
                subscriber_index.entry(event.clone()).or_default().insert(id.clone());
            }
        }

        let mut attempts: HashMap<String, Vec<String>> = HashMap::new();
        for attempt in attempt_records.values() {
            attempts.entry(attempt.delivery_id.clone()).or_default().push(attempt.id.clone());
        }

        Ok(Self {
            dirs,
            webhooks: RwLock::new(webhooks),
            deliveries: RwLock::new(deliveries),
            attempts: RwLock::new(attempts),
            attempt_records: RwLock::new(attempt_records),
            subscriber_index: RwLock::new(subscriber_index),
            encrypt_secrets: false,
            encryption_key: String::new(),
        })
    }

    /// Open a repository with the encrypted-secret opt-in mode wired from
    /// `config` (spec §9: store secrets encrypted at rest and sign with the
    /// decrypted value rather than the default hashed-secret signing).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory tree cannot be created.
    pub fn open_with_config(root: impl AsRef<Path>, config: &WebhookConfig) -> Result<Self> {
        let mut repo = Self::open(root)?;
        repo.encrypt_secrets = config.encrypt_secrets;
        repo.encryption_key = config.secret_encryption_key.clone();
        Ok(repo)
    }

    fn webhook_path(&self, id: &str) -> PathBuf {
        self.dirs.webhooks.join(format!("{id}.json"))
    }

    fn delivery_path(&self, id: &str) -> PathBuf {
        self.dirs.deliveries.join(format!("{id}.json"))
    }

    fn attempt_path(&self, id: &str) -> PathBuf {
        self.dirs.attempts.join(format!("{id}.json"))
    }

    /// Create a webhook. By default stores only `hash(secret)` — never the
    /// raw secret (spec §4.12); when `encrypt_secrets` is on, also stores
    /// the secret encrypted at rest (see [`Self::open_with_config`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] / [`Error::Json`] if the record cannot be
    /// persisted.
    pub fn create_webhook(
        &self,
        url: impl Into<String>,
        events: Vec<String>,
        description: Option<String>,
        active: bool,
        secret: Option<&str>,
    ) -> Result<Webhook> {
        let (secret_hash, encrypted_secret) = self.encode_secret(secret)?;
        let now = now_unix();
        let webhook = Webhook {
            id: new_id(),
            url: url.into(),
            events: events.clone(),
            description,
            active,
            secret_hash,
            encrypted_secret,
            headers: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.persist_webhook(&webhook)?;
        for event in &events {
            self.subscriber_index.write().entry(event.clone()).or_default().insert(webhook.id.clone());
        }
        self.webhooks.write().insert(webhook.id.clone(), webhook.clone());
        Ok(webhook)
    }

    fn persist_webhook(&self, webhook: &Webhook) -> Result<()> {
        write_atomic(&self.webhook_path(&webhook.id), webhook)
    }

    /// Apply a partial update to an existing webhook, maintaining the
    /// subscriber-index delta when `events` changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` does not exist.
    pub fn update_webhook(&self, id: &str, update: WebhookUpdate) -> Result<Webhook> {
        let mut webhooks = self.webhooks.write();
        let webhook = webhooks.get_mut(id).ok_or_else(|| Error::NotFound(id.to_string()))?;

        if let Some(events) = update.events {
            let mut index = self.subscriber_index.write();
            for old_event in &webhook.events {
                if let Some(set) = index.get_mut(old_event) {
                    set.remove(id);
                }
            }
            for new_event in &events {
                index.entry(new_event.clone()).or_default().insert(id.to_string());
            }
            webhook.events = events;
        }
        if let Some(url) = update.url {
            webhook.url = url;
        }
        if let Some(description) = update.description {
            webhook.description = description;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        let new_secret = update.secret;
        webhook.updated_at = now_unix();
        let mut snapshot = webhook.clone();
        drop(webhooks);

        if let Some(secret) = new_secret {
            let (secret_hash, encrypted_secret) = self.encode_secret(Some(&secret))?;
            snapshot.secret_hash = secret_hash;
            snapshot.encrypted_secret = encrypted_secret;
            self.webhooks.write().insert(snapshot.id.clone(), snapshot.clone());
        }

        self.persist_webhook(&snapshot)?;
        Ok(snapshot)
    }

    /// Delete a webhook and drop it from the subscriber index.
    pub fn delete_webhook(&self, id: &str) -> Result<bool> {
        let Some(webhook) = self.webhooks.write().remove(id) else {
            return Ok(false);
        };
        let mut index = self.subscriber_index.write();
        for event in &webhook.events {
            if let Some(set) = index.get_mut(event) {
                set.remove(id);
            }
        }
        drop(index);
        let _ = fs::remove_file(self.webhook_path(id));
        Ok(true)
    }

    /// Fetch a webhook by id.
    #[must_use]
    pub fn get_webhook(&self, id: &str) -> Option<Webhook> {
        self.webhooks.read().get(id).cloned()
    }

    /// Active webhooks subscribed to `event`.
    #[must_use]
    pub fn webhooks_for_event(&self, event: &str) -> Vec<Webhook> {
        let Some(ids) = self.subscriber_index.read().get(event).cloned() else {
            return Vec::new();
        };
        let webhooks = self.webhooks.read();
        ids.into_iter()
            .filter_map(|id| webhooks.get(&id).cloned())
            .filter(|w| w.active)
            .collect()
    }

    /// Create a delivery record in `pending` status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `webhook_id` does not exist.
    pub fn create_delivery(
        &self,
        webhook_id: &str,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Delivery> {
        if self.webhooks.read().get(webhook_id).is_none() {
            return Err(Error::NotFound(webhook_id.to_string()));
        }
        let now = now_unix();
        let delivery = Delivery {
            id: new_id(),
            webhook_id: webhook_id.to_string(),
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            idempotency_key: None,
            created_at: now,
            updated_at: now,
        };
        write_atomic(&self.delivery_path(&delivery.id), &delivery)?;
        self.deliveries.write().insert(delivery.id.clone(), delivery.clone());
        Ok(delivery)
    }

    /// Persist a caller-mutated delivery record (status/attempt_count
    /// changes applied by the delivery engine).
    pub fn save_delivery(&self, delivery: &Delivery) -> Result<()> {
        write_atomic(&self.delivery_path(&delivery.id), delivery)?;
        self.deliveries.write().insert(delivery.id.clone(), delivery.clone());
        Ok(())
    }

    /// Fetch a delivery by id.
    #[must_use]
    pub fn get_delivery(&self, id: &str) -> Option<Delivery> {
        self.deliveries.read().get(id).cloned()
    }

    /// Deliveries for a webhook, optionally filtered by status, newest
    /// first.
    #[must_use]
    pub fn deliveries_for_webhook(&self, webhook_id: &str, status: Option<DeliveryStatus>) -> Vec<Delivery> {
        let mut items: Vec<Delivery> = self
            .deliveries
            .read()
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    /// Create an attempt record in `pending` status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `delivery_id` does not exist.
    pub fn create_attempt(&self, delivery_id: &str) -> Result<Attempt> {
        if self.deliveries.read().get(delivery_id).is_none() {
            return Err(Error::NotFound(delivery_id.to_string()));
        }
        let attempt = Attempt {
            id: new_id(),
            delivery_id: delivery_id.to_string(),
            status: AttemptStatus::Pending,
            response_code: None,
            response_body: None,
            error: None,
            created_at: now_unix(),
        };
        write_atomic(&self.attempt_path(&attempt.id), &attempt)?;
        self.attempt_records.write().insert(attempt.id.clone(), attempt.clone());
        self.attempts.write().entry(delivery_id.to_string()).or_default().push(attempt.id.clone());
        Ok(attempt)
    }

    /// Update an attempt's outcome; propagates status to the parent
    /// delivery (spec §4.12).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `attempt_id` does not exist.
    pub fn update_attempt(
        &self,
        attempt_id: &str,
        status: AttemptStatus,
        response_code: Option<u16>,
        response_body: Option<String>,
        error: Option<String>,
    ) -> Result<Attempt> {
        let mut records = self.attempt_records.write();
        let attempt = records.get_mut(attempt_id).ok_or_else(|| Error::NotFound(attempt_id.to_string()))?;
        attempt.status = status;
        if response_code.is_some() {
            attempt.response_code = response_code;
        }
        if response_body.is_some() {
            attempt.response_body = response_body;
        }
        if error.is_some() {
            attempt.error = error;
        }
        let snapshot = attempt.clone();
        drop(records);
        write_atomic(&self.attempt_path(attempt_id), &snapshot)?;
        self.propagate_attempt_status(&snapshot.delivery_id, snapshot.status)?;
        Ok(snapshot)
    }

    /// Reflect an attempt's outcome onto its parent delivery: a successful
    /// attempt closes the delivery out, a failed one marks it as retrying.
    /// A pending attempt has nothing to propagate. The delivery engine's
    /// own final status write (once its attempt loop concludes) always
    /// takes precedence over this interim update.
    fn propagate_attempt_status(&self, delivery_id: &str, status: AttemptStatus) -> Result<()> {
        let new_status = match status {
            AttemptStatus::Success => DeliveryStatus::Success,
            AttemptStatus::Failed => DeliveryStatus::Retrying,
            AttemptStatus::Pending => return Ok(()),
        };
        let mut deliveries = self.deliveries.write();
        let Some(delivery) = deliveries.get_mut(delivery_id) else {
            return Ok(());
        };
        delivery.status = new_status;
        delivery.updated_at = now_unix();
        let snapshot = delivery.clone();
        drop(deliveries);
        write_atomic(&self.delivery_path(delivery_id), &snapshot)
    }

    /// Attempts recorded for a delivery, oldest first.
    #[must_use]
    pub fn attempts_for_delivery(&self, delivery_id: &str) -> Vec<Attempt> {
        let Some(ids) = self.attempts.read().get(delivery_id).cloned() else {
            return Vec::new();
        };
        let records = self.attempt_records.read();
        ids.into_iter().filter_map(|id| records.get(&id).cloned()).collect()
    }

    /// Every delivery not yet in a terminal state, used to rehydrate the
    /// in-memory queue after a restart.
    #[must_use]
    pub fn all_unterminated_deliveries(&self) -> Vec<Delivery> {
        self.deliveries.read().values().filter(|d| !d.status.is_terminal()).cloned().collect()
    }

    /// Sign `payload` with webhook `id`'s stored secret. By default signs
    /// with the *hashed* secret (see DESIGN.md); when `encrypt_secrets` is
    /// on (see [`Self::open_with_config`]), decrypts the stored secret and
    /// signs with the raw value instead. Returns `Ok(None)` if the webhook
    /// has no secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the stored encrypted secret cannot be
    /// decrypted (corrupt record or wrong `secret_encryption_key`).
    pub fn sign_payload(&self, webhook_id: &str, payload: &[u8]) -> Result<Option<String>> {
        let Some(webhook) = self.get_webhook(webhook_id) else {
            return Ok(None);
        };
        if self.encrypt_secrets {
            let Some(encrypted) = webhook.encrypted_secret else {
                return Ok(None);
            };
            let secret = decrypt_secret(&encrypted, &self.encryption_key)?;
            return Ok(Some(super::signature::sign(&secret, payload)));
        }
        let Some(secret_hash) = webhook.secret_hash else {
            return Ok(None);
        };
        Ok(Some(super::signature::sign(&secret_hash, payload)))
    }

    /// Encode a raw secret into `(secret_hash, encrypted_secret)` per the
    /// configured mode: the encrypted form is only populated when
    /// `encrypt_secrets` is on, matching [`Self::sign_payload`]'s branching.
    fn encode_secret(&self, secret: Option<&str>) -> Result<(Option<String>, Option<String>)> {
        let Some(secret) = secret else {
            return Ok((None, None));
        };
        let secret_hash = Some(hash_secret(secret));
        if self.encrypt_secrets {
            let encrypted = encrypt_secret(secret, &self.encryption_key)?;
            Ok((secret_hash, Some(encrypted)))
        } else {
            Ok((secret_hash, None))
        }
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn derive_key(passphrase: &str, salt: &[u8; 16]) -> [u8; 32] {
    pbkdf2_hmac_array::<Sha256, 32>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS)
}

/// Encrypt `secret` under `passphrase`, encoding the result as
/// `hex(salt):hex(nonce):hex(ciphertext)`.
fn encrypt_secret(secret: &str, passphrase: &str) -> Result<String> {
    let salt: [u8; 16] = rand::rng().random();
    let nonce_bytes: [u8; 12] = rand::rng().random();
    let key_bytes = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, secret.as_bytes())
        .map_err(|e| Error::Internal(format!("failed to encrypt webhook secret: {e}")))?;
    Ok(format!("{}:{}:{}", hex::encode(salt), hex::encode(nonce_bytes), hex::encode(ciphertext)))
}

/// Decrypt a value produced by [`encrypt_secret`].
fn decrypt_secret(encoded: &str, passphrase: &str) -> Result<String> {
    let mut parts = encoded.splitn(3, ':');
    let (Some(salt_hex), Some(nonce_hex), Some(ciphertext_hex)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Internal("malformed encrypted webhook secret".to_string()));
    };
    let salt: [u8; 16] = hex::decode(salt_hex)
        .map_err(|e| Error::Internal(format!("invalid encrypted secret salt: {e}")))?
        .try_into()
        .map_err(|_| Error::Internal("encrypted secret salt has the wrong length".to_string()))?;
    let nonce_bytes =
        hex::decode(nonce_hex).map_err(|e| Error::Internal(format!("invalid encrypted secret nonce: {e}")))?;
    let ciphertext =
        hex::decode(ciphertext_hex).map_err(|e| Error::Internal(format!("invalid encrypted secret body: {e}")))?;

    let key_bytes = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|e| Error::Internal(format!("failed to decrypt webhook secret: {e}")))?;
    String::from_utf8(plaintext).map_err(|e| Error::Internal(format!("decrypted secret was not utf-8: {e}")))
}

fn load_records<T: serde::de::DeserializeOwned>(dir: &Path) -> HashMap<String, T> {
    let mut out = HashMap::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match fs::read(&path).ok().and_then(|raw| serde_json::from_slice::<T>(&raw).ok()) {
            Some(record) => {
                out.insert(id.to_string(), record);
            }
            None => warn!(path = %path.display(), "skipping unreadable repository record"),
        }
    }
    out
}

fn write_atomic<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record)?;
    let mut tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap())?;
    std::io::Write::write_all(&mut tmp, &bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn create_then_get_webhook_round_trips() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo
            .create_webhook("https://example.com", vec!["order.created".into()], None, true, Some("s3cret"))
            .unwrap();
        let fetched = repo.get_webhook(&webhook.id).unwrap();
        assert_eq!(fetched.url, "https://example.com");
        assert!(fetched.secret_hash.is_some());
    }

    #[test]
    fn webhooks_for_event_only_returns_active_subscribers() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let active = repo.create_webhook("https://a", vec!["e".into()], None, true, None).unwrap();
        let inactive = repo.create_webhook("https://b", vec!["e".into()], None, false, None).unwrap();
        let subscribers = repo.webhooks_for_event("e");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].id, active.id);
        assert_ne!(subscribers[0].id, inactive.id);
    }

    #[test]
    fn update_webhook_moves_subscriber_index_entries() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo.create_webhook("https://a", vec!["old".into()], None, true, None).unwrap();
        repo.update_webhook(&webhook.id, WebhookUpdate { events: Some(vec!["new".into()]), ..Default::default() }).unwrap();
        assert!(repo.webhooks_for_event("old").is_empty());
        assert_eq!(repo.webhooks_for_event("new").len(), 1);
    }

    #[test]
    fn delete_webhook_removes_it_from_subscriber_index() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo.create_webhook("https://a", vec!["e".into()], None, true, None).unwrap();
        assert!(repo.delete_webhook(&webhook.id).unwrap());
        assert!(repo.webhooks_for_event("e").is_empty());
        assert!(repo.get_webhook(&webhook.id).is_none());
    }

    #[test]
    fn create_attempt_propagates_status_to_delivery_via_update() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo.create_webhook("https://a", vec!["e".into()], None, true, None).unwrap();
        let delivery = repo.create_delivery(&webhook.id, "e", json!({})).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Pending);

        let attempt = repo.create_attempt(&delivery.id).unwrap();
        let updated = repo
            .update_attempt(&attempt.id, AttemptStatus::Success, Some(200), Some("ok".into()), None)
            .unwrap();
        assert_eq!(updated.response_code, Some(200));
        assert_eq!(repo.attempts_for_delivery(&delivery.id).len(), 1);
        assert_eq!(repo.get_delivery(&delivery.id).unwrap().status, DeliveryStatus::Success);
    }

    #[test]
    fn failed_attempt_propagates_retrying_status_to_delivery() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo.create_webhook("https://a", vec!["e".into()], None, true, None).unwrap();
        let delivery = repo.create_delivery(&webhook.id, "e", json!({})).unwrap();
        let attempt = repo.create_attempt(&delivery.id).unwrap();
        repo.update_attempt(&attempt.id, AttemptStatus::Failed, Some(500), None, Some("boom".into())).unwrap();
        assert_eq!(repo.get_delivery(&delivery.id).unwrap().status, DeliveryStatus::Retrying);
    }

    #[test]
    fn sign_payload_is_none_without_a_secret() {
        let dir = tempdir().unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let webhook = repo.create_webhook("https://a", vec![], None, true, None).unwrap();
        assert!(repo.sign_payload(&webhook.id, b"{}").unwrap().is_none());
    }

    #[test]
    fn encrypted_secret_mode_stores_ciphertext_and_signs_with_the_raw_secret() {
        let dir = tempdir().unwrap();
        let mut config = crate::config::WebhookConfig::default();
        config.encrypt_secrets = true;
        config.secret_encryption_key = "correct horse battery staple".to_string();
        let repo = Repository::open_with_config(dir.path(), &config).unwrap();

        let webhook = repo.create_webhook("https://a", vec![], None, true, Some("s3cret")).unwrap();
        let encrypted = webhook.encrypted_secret.clone().unwrap();
        assert!(!encrypted.contains("s3cret"));
        assert!(webhook.secret_hash.is_some());

        let payload = b"{}";
        let sig = repo.sign_payload(&webhook.id, payload).unwrap().unwrap();
        assert!(super::super::signature::verify("s3cret", payload, &sig));
        assert!(!super::super::signature::verify(&webhook.secret_hash.unwrap(), payload, &sig));
    }

    #[test]
    fn encrypted_secret_mode_rejects_the_wrong_passphrase() {
        let dir = tempdir().unwrap();
        let mut config = crate::config::WebhookConfig::default();
        config.encrypt_secrets = true;
        config.secret_encryption_key = "right-key".to_string();
        let repo = Repository::open_with_config(dir.path(), &config).unwrap();
        let webhook = repo.create_webhook("https://a", vec![], None, true, Some("s3cret")).unwrap();

        let mut wrong_config = config;
        wrong_config.secret_encryption_key = "wrong-key".to_string();
        let wrong_repo = Repository::open_with_config(dir.path(), &wrong_config).unwrap();
        assert!(wrong_repo.sign_payload(&webhook.id, b"{}").is_err());
    }

    #[test]
    fn repository_survives_reopening() {
        let dir = tempdir().unwrap();
        let id = {
            let repo = Repository::open(dir.path()).unwrap();
            repo.create_webhook("https://a", vec!["e".into()], None, true, None).unwrap().id
        };
        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.get_webhook(&id).is_some());
        assert_eq!(repo.webhooks_for_event("e").len(), 1);
    }
}
