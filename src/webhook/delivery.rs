//! Delivery engine (C13) — the hardest subsystem.
//!
//! A bounded priority queue (a binary heap behind a `parking_lot::Mutex`
//! plus a `tokio::sync::Notify`, the standard async priority-queue shape)
//! feeds `max_workers` cooperating workers. Retries walk `backon`'s
//! exponential backoff iterator by hand so each delay can be raced
//! against a cancellation token instead of just slept through.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};
use std::time::Instant;

use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::WebhookConfig;
use crate::{Error, Result};

use super::repository::Repository;
use super::{Attempt, AttemptStatus, DeadLetterEntry, Delivery, DeliveryStatus, EventEnvelope, Priority, now_unix};

#[derive(Debug, Clone)]
struct QueuedJob {
    priority: Priority,
    seq: u64,
    delivery_id: String,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority).then_with(|| Reverse(self.seq).cmp(&Reverse(other.seq)))
    }
}

struct Queue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    capacity: usize,
    seq: AtomicU64,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity,
            seq: AtomicU64::new(0),
        }
    }

    fn push(&self, priority: Priority, delivery_id: String) -> Result<()> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        heap.push(QueuedJob { priority, seq, delivery_id });
        drop(heap);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<QueuedJob> {
        self.heap.lock().pop()
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    action: &'static str,
    delivery_id: String,
    priority: Option<Priority>,
    webhook_id: Option<String>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
}

struct BatchBuffer {
    events: Vec<EventEnvelope>,
    flush_scheduled: bool,
}

/// Bounded priority queue + worker pool driving webhook deliveries.
pub struct Engine {
    repository: Arc<Repository>,
    http: Client,
    config: WebhookConfig,
    queue: Arc<Queue>,
    cancellation: CancellationToken,
    dlq: DashMap<String, DeadLetterEntry>,
    idempotency: DashMap<String, String>,
    debounce_tokens: DashMap<String, CancellationToken>,
    batch_buffers: DashMap<String, Mutex<BatchBuffer>>,
    journal: Option<Mutex<std::fs::File>>,
    self_ref: OnceLock<Weak<Engine>>,
}

impl Engine {
    /// Construct and start the engine: opens the journal (if configured),
    /// rehydrates any pending/retrying deliveries found in `repository`,
    /// and spawns `max_workers` worker tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the queue journal cannot be opened.
    pub async fn start(config: WebhookConfig, repository: Arc<Repository>) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(config.attempt_timeout)
            .build()
            .map_err(Error::Http)?;

        let journal = if config.persist_queue {
            let path = PathBuf::from(&config.queue_file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            Some(Mutex::new(file))
        } else {
            None
        };

        let engine = Arc::new(Self {
            queue: Arc::new(Queue::new(config.queue_capacity)),
            repository,
            http,
            dlq: DashMap::new(),
            idempotency: DashMap::new(),
            debounce_tokens: DashMap::new(),
            batch_buffers: DashMap::new(),
            cancellation: CancellationToken::new(),
            journal,
            self_ref: OnceLock::new(),
            config,
        });
        let _ = engine.self_ref.set(Arc::downgrade(&engine));

        engine.rehydrate_pending();

        for _ in 0..engine.config.max_workers.max(1) {
            let worker_engine = Arc::clone(&engine);
            tokio::spawn(async move { worker_engine.worker_loop().await });
        }

        Ok(engine)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("engine is always constructed behind an Arc via start()")
    }

    fn rehydrate_pending(&self) {
        for delivery in self.repository.all_unterminated_deliveries() {
            if let Err(err) = self.queue.push(Priority::Low, delivery.id.clone()) {
                warn!(delivery_id = %delivery.id, error = %err, "could not rehydrate pending delivery, queue full at startup");
            }
        }
    }

    /// Stop accepting new dispatch and signal every worker to finish its
    /// current in-flight attempt, then return. Scheduled retries are
    /// cancelled; their deliveries are left in their current (persisted)
    /// state.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    fn journal_write(&self, entry: &JournalEntry) {
        let Some(journal) = &self.journal else { return };
        let Ok(mut line) = serde_json::to_vec(entry) else { return };
        line.push(b'\n');
        let mut file = journal.lock();
        let _ = file.write_all(&line);
        let _ = file.flush();
    }

    /// Non-blocking enqueue. Returns the `pending` delivery record
    /// immediately, or [`Error::QueueFull`] if the queue is at capacity.
    /// Routes through batching/debouncing if the event type or an
    /// explicit `debounce_key` is so configured.
    pub async fn queue_event(
        &self,
        webhook_id: &str,
        event_type: &str,
        data: serde_json::Value,
        priority: Priority,
        idempotency_key: Option<String>,
        debounce_key: Option<&str>,
    ) -> Result<Delivery> {
        if let Some(key) = debounce_key.filter(|_| self.config.debounced_event_types.contains(event_type)) {
            self.debounce(key, webhook_id, event_type, data);
            // A debounced call has no delivery yet to return; callers treat
            // this as fire-and-forget and should not expect a terminal record.
            return self.repository.create_delivery(webhook_id, event_type, serde_json::Value::Null).map(|mut d| {
                d.status = DeliveryStatus::Pending;
                d
            });
        }

        if self.config.batched_event_types.contains(event_type) {
            return self.buffer_for_batch(webhook_id, event_type, data).await;
        }

        self.dispatch(webhook_id, event_type, data, priority, idempotency_key).await
    }

    async fn dispatch(
        &self,
        webhook_id: &str,
        event_type: &str,
        data: serde_json::Value,
        priority: Priority,
        idempotency_key: Option<String>,
    ) -> Result<Delivery> {
        if let Some(key) = &idempotency_key {
            let idem_key = format!("{webhook_id}:{key}");
            if let Some(existing_id) = self.idempotency.get(&idem_key) {
                if let Some(existing) = self.repository.get_delivery(existing_id.value()) {
                    return Ok(existing);
                }
            }
        }

        let envelope = EventEnvelope::new(event_type, data);
        let mut delivery = self
            .repository
            .create_delivery(webhook_id, event_type, serde_json::to_value(&envelope)?)?;
        delivery.idempotency_key = idempotency_key.clone();
        self.repository.save_delivery(&delivery)?;

        if let Some(key) = idempotency_key {
            self.idempotency.insert(format!("{webhook_id}:{key}"), delivery.id.clone());
        }

        self.journal_write(&JournalEntry {
            action: "enqueue",
            delivery_id: delivery.id.clone(),
            priority: Some(priority),
            webhook_id: Some(webhook_id.to_string()),
            event_type: Some(event_type.to_string()),
            payload: Some(delivery.payload.clone()),
        });

        self.queue.push(priority, delivery.id.clone())?;
        Ok(delivery)
    }

    async fn buffer_for_batch(&self, webhook_id: &str, event_type: &str, data: serde_json::Value) -> Result<Delivery> {
        let buffer_key = format!("{webhook_id}:{event_type}");
        let envelope = EventEnvelope::new(event_type, data);

        let should_flush_now = {
            let entry = self
                .batch_buffers
                .entry(buffer_key.clone())
                .or_insert_with(|| Mutex::new(BatchBuffer { events: Vec::new(), flush_scheduled: false }));
            let mut buffer = entry.lock();
            buffer.events.push(envelope);
            let at_capacity = buffer.events.len() >= self.config.batch_size;
            if !buffer.flush_scheduled && !at_capacity {
                buffer.flush_scheduled = true;
                let engine = self.arc();
                let key = buffer_key.clone();
                let window = self.config.batch_window;
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    engine.flush_batch(&key).await;
                });
            }
            at_capacity
        };

        if should_flush_now {
            self.flush_batch(&buffer_key).await;
        }

        // A batched event doesn't get its own delivery; return a
        // placeholder pending record describing the buffering.
        let (webhook_id, event_type) = buffer_key.rsplit_once(':').unwrap_or((webhook_id, event_type));
        self.repository.create_delivery(webhook_id, event_type, serde_json::Value::Null)
    }

    async fn flush_batch(&self, buffer_key: &str) {
        let Some(entry) = self.batch_buffers.get(buffer_key) else { return };
        let events = {
            let mut buffer = entry.lock();
            buffer.flush_scheduled = false;
            std::mem::take(&mut buffer.events)
        };
        drop(entry);
        if events.is_empty() {
            return;
        }
        let Some((webhook_id, _)) = buffer_key.rsplit_once(':') else { return };
        let payload = serde_json::json!({ "type": "batch", "events": events });
        if let Err(err) = self.dispatch(webhook_id, "batch", payload, Priority::Low, None).await {
            warn!(webhook_id, error = %err, "failed to dispatch flushed batch");
        }
    }

    fn debounce(&self, debounce_key: &str, webhook_id: &str, event_type: &str, data: serde_json::Value) {
        let new_token = CancellationToken::new();
        if let Some((_, old_token)) = self.debounce_tokens.remove(debounce_key) {
            old_token.cancel();
        }
        self.debounce_tokens.insert(debounce_key.to_string(), new_token.clone());

        let engine = self.arc();
        let key = debounce_key.to_string();
        let webhook_id = webhook_id.to_string();
        let event_type = event_type.to_string();
        let window = self.config.debounce_window;
        tokio::spawn(async move {
            tokio::select! {
                () = new_token.cancelled() => {}
                () = tokio::time::sleep(window) => {
                    engine.debounce_tokens.remove(&key);
                    if let Err(err) = engine.dispatch(&webhook_id, &event_type, data, Priority::Low, None).await {
                        warn!(webhook_id = %webhook_id, error = %err, "debounced dispatch failed");
                    }
                }
            }
        });
    }

    /// Synchronous variant: performs the full attempt sequence in-line
    /// and returns the terminal delivery record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`]/[`Error::Inactive`]/[`Error::NotSubscribed`]
    /// synchronously — these are programmer errors, never retried.
    pub async fn deliver_event(
        &self,
        webhook_id: &str,
        event_type: &str,
        data: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Delivery> {
        if let Some(key) = &idempotency_key {
            let idem_key = format!("{webhook_id}:{key}");
            if let Some(existing_id) = self.idempotency.get(&idem_key) {
                if let Some(existing) = self.repository.get_delivery(existing_id.value()) {
                    return Ok(existing);
                }
            }
        }

        let webhook = self
            .repository
            .get_webhook(webhook_id)
            .ok_or_else(|| Error::NotFound(webhook_id.to_string()))?;
        if !webhook.active {
            return Err(Error::Inactive(webhook_id.to_string()));
        }
        if !webhook.receives(event_type) {
            return Err(Error::NotSubscribed { webhook_id: webhook_id.to_string(), event_type: event_type.to_string() });
        }

        let envelope = EventEnvelope::new(event_type, data);
        let mut delivery = self
            .repository
            .create_delivery(webhook_id, event_type, serde_json::to_value(&envelope)?)?;
        delivery.idempotency_key = idempotency_key.clone();
        self.repository.save_delivery(&delivery)?;
        if let Some(key) = idempotency_key {
            self.idempotency.insert(format!("{webhook_id}:{key}"), delivery.id.clone());
        }

        self.run_attempt_loop(delivery.id.clone()).await;
        Ok(self.repository.get_delivery(&delivery.id).unwrap_or(delivery))
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let job = self.queue.pop();
            match job {
                Some(job) => {
                    self.journal_write(&JournalEntry {
                        action: "dequeue",
                        delivery_id: job.delivery_id.clone(),
                        priority: None,
                        webhook_id: None,
                        event_type: None,
                        payload: None,
                    });
                    self.run_attempt_loop(job.delivery_id).await;
                }
                None => {
                    tokio::select! {
                        () = self.cancellation.cancelled() => return,
                        () = self.queue.notify.notified() => {}
                    }
                }
            }
            if self.cancellation.is_cancelled() && self.queue.len() == 0 {
                return;
            }
        }
    }

    /// Runs the attempt loop for an already-created delivery; programmer
    /// errors (missing/inactive/unsubscribed webhook) are logged and
    /// skipped rather than propagated, since this path has no synchronous
    /// caller (spec §4.13 failure taxonomy, queue-driven path).
    async fn run_attempt_loop(&self, delivery_id: String) {
        let Some(mut delivery) = self.repository.get_delivery(&delivery_id) else {
            warn!(delivery_id = %delivery_id, "delivery vanished before its attempt loop ran");
            return;
        };

        let Some(webhook) = self.repository.get_webhook(&delivery.webhook_id) else {
            warn!(delivery_id = %delivery_id, webhook_id = %delivery.webhook_id, "webhook not found for delivery, skipping");
            return;
        };
        if !webhook.active {
            warn!(delivery_id = %delivery_id, webhook_id = %webhook.id, "webhook inactive, skipping delivery");
            return;
        }
        if delivery.event_type != "batch" && !webhook.receives(&delivery.event_type) {
            warn!(delivery_id = %delivery_id, webhook_id = %webhook.id, event_type = %delivery.event_type, "webhook no longer subscribed, skipping delivery");
            return;
        }

        let deadline = Instant::now() + self.config.delivery_deadline;
        let payload_bytes = serde_json::to_vec(&delivery.payload).unwrap_or_default();
        let signature = match self.repository.sign_payload(&webhook.id, &payload_bytes) {
            Ok(signature) => signature,
            Err(err) => {
                warn!(delivery_id = %delivery_id, webhook_id = %webhook.id, error = %err, "failed to sign payload, sending unsigned");
                None
            }
        };

        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.base_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times((self.config.max_attempts.saturating_sub(1)) as usize)
            .build();

        let mut attempts_made = 0u32;
        let mut last_error: Option<Error> = None;
        let mut outcome = None;

        loop {
            if Instant::now() >= deadline {
                outcome = Some(DeliveryStatus::Failed);
                break;
            }
            attempts_made += 1;
            match self.run_one_attempt(&webhook, &delivery.id, &payload_bytes, signature.as_deref()).await {
                Ok(()) => {
                    outcome = Some(DeliveryStatus::Success);
                    break;
                }
                Err(err) if err.is_transient() => {
                    let Some(delay) = backoff.next() else {
                        last_error = Some(err);
                        break;
                    };
                    warn!(delivery_id = %delivery.id, error = %err, delay = ?delay, "webhook attempt failed, retrying");
                    last_error = Some(err);
                    tokio::select! {
                        () = self.cancellation.cancelled() => {
                            outcome = Some(DeliveryStatus::Failed);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    if outcome.is_some() {
                        break;
                    }
                }
                Err(err) => {
                    last_error = Some(err);
                    break;
                }
            }
        }

        delivery = self.repository.get_delivery(&delivery.id).unwrap_or(delivery);
        delivery.attempt_count = attempts_made;

        match outcome {
            Some(status) => delivery.status = status,
            None if Instant::now() >= deadline => delivery.status = DeliveryStatus::Failed,
            None => {
                warn!(delivery_id = %delivery.id, error = ?last_error, "webhook delivery exhausted retries");
                delivery.status = DeliveryStatus::MaxRetriesExceeded;
                if self.config.dlq_enabled {
                    self.dlq.insert(
                        delivery.id.clone(),
                        DeadLetterEntry { delivery_id: delivery.id.clone(), dead_lettered_at: now_unix() },
                    );
                }
            }
        }
        delivery.updated_at = now_unix();
        let _ = self.repository.save_delivery(&delivery);

        self.journal_write(&JournalEntry {
            action: "complete",
            delivery_id: delivery.id.clone(),
            priority: None,
            webhook_id: None,
            event_type: None,
            payload: None,
        });
    }

    async fn run_one_attempt(
        &self,
        webhook: &super::Webhook,
        delivery_id: &str,
        payload_bytes: &[u8],
        signature: Option<&str>,
    ) -> Result<()> {
        let attempt = self.repository.create_attempt(delivery_id)?;

        let mut request = self
            .http
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .header("X-Webhook-ID", webhook.id.as_str())
            .body(payload_bytes.to_vec());

        if let Some(sig) = signature {
            request = request.header("X-Webhook-Signature", sig);
        }
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }

        let outcome = request.send().await;
        self.record_attempt_outcome(&attempt, outcome).await
    }

    async fn record_attempt_outcome(
        &self,
        attempt: &Attempt,
        outcome: std::result::Result<reqwest::Response, reqwest::Error>,
    ) -> Result<()> {
        match outcome {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let truncated = truncate_utf8(&body, self.config.max_response_body_bytes);
                let success = status.as_u16() >= 200 && status.as_u16() < 300;
                self.repository.update_attempt(
                    &attempt.id,
                    if success { AttemptStatus::Success } else { AttemptStatus::Failed },
                    Some(status.as_u16()),
                    Some(truncated),
                    None,
                )?;
                if success {
                    Ok(())
                } else {
                    Err(classify_http_failure(status.as_u16()))
                }
            }
            Err(err) => {
                self.repository.update_attempt(&attempt.id, AttemptStatus::Failed, None, None, Some(err.to_string()))?;
                Err(Error::Http(err))
            }
        }
    }

    /// Active webhooks subscribed to `event_type`, used by the emitter to
    /// fan an emitted event out to every interested destination.
    #[must_use]
    pub fn subscribers_for_event(&self, event_type: &str) -> Vec<super::Webhook> {
        self.repository.webhooks_for_event(event_type)
    }

    /// Number of entries currently dead-lettered.
    #[must_use]
    pub fn dead_letter_queue_size(&self) -> usize {
        self.dlq.len()
    }

    /// Re-enqueue every dead-lettered delivery as a fresh attempt
    /// sequence and return how many were reprocessed.
    pub async fn reprocess_dead_letter_queue(&self) -> usize {
        let entries: Vec<DeadLetterEntry> = self.dlq.iter().map(|e| e.value().clone()).collect();
        let mut reprocessed = 0;
        for entry in entries {
            self.dlq.remove(&entry.delivery_id);
            self.run_attempt_loop(entry.delivery_id.clone()).await;
            reprocessed += 1;
        }
        reprocessed
    }
}

/// Truncate `s` to at most `max_bytes`, backing off to the nearest
/// preceding UTF-8 character boundary.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Transient (5xx, 429) vs. permanent (other 4xx) HTTP failure
/// classification.
fn classify_http_failure(status: u16) -> Error {
    if status >= 500 || status == 429 {
        Error::Transient(format!("HTTP {status}"))
    } else {
        Error::Permanent(format!("HTTP {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_job_orders_high_priority_first_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueuedJob { priority: Priority::Low, seq: 0, delivery_id: "a".into() });
        heap.push(QueuedJob { priority: Priority::High, seq: 1, delivery_id: "b".into() });
        heap.push(QueuedJob { priority: Priority::Low, seq: 2, delivery_id: "c".into() });
        assert_eq!(heap.pop().unwrap().delivery_id, "b");
        assert_eq!(heap.pop().unwrap().delivery_id, "a");
        assert_eq!(heap.pop().unwrap().delivery_id, "c");
    }

    #[test]
    fn queue_rejects_past_capacity() {
        let queue = Queue::new(1);
        queue.push(Priority::Low, "a".into()).unwrap();
        assert!(matches!(queue.push(Priority::Low, "b".into()), Err(Error::QueueFull)));
    }
}
