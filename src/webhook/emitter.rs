//! Event emitter (C14).
//!
//! Fans one logical event out two ways: synchronously to in-process
//! listeners registered via [`Emitter::on`]/[`Emitter::once`], in
//! registration order, and asynchronously to every webhook subscribed to
//! the event type via [`delivery::Engine::queue_event`]. A listener
//! failure is logged and does not stop the remaining listeners or the
//! webhook fan-out from running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::Result;

use super::delivery::Engine;
use super::{Priority, now_unix};

/// A registered in-process listener.
pub type Listener = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

struct Registration {
    id: u64,
    listener: Listener,
    once: bool,
}

/// Handle returned by [`Emitter::on`]/[`Emitter::once`]; dropping it does
/// not unsubscribe — call [`Unsubscribe::cancel`] explicitly.
#[must_use = "dropping an Unsubscribe handle does not remove the listener"]
pub struct Unsubscribe {
    event_type: String,
    id: u64,
    listeners: Arc<RwLock<HashMap<String, Vec<Registration>>>>,
}

impl Unsubscribe {
    /// Remove the listener this handle refers to.
    pub fn cancel(self) {
        let mut listeners = self.listeners.write();
        if let Some(regs) = listeners.get_mut(&self.event_type) {
            regs.retain(|r| r.id != self.id);
        }
    }
}

/// Local listener registry plus webhook fan-out via a [`delivery::Engine`].
pub struct Emitter {
    listeners: Arc<RwLock<HashMap<String, Vec<Registration>>>>,
    next_id: AtomicU64,
    engine: Arc<Engine>,
}

impl Emitter {
    /// Construct an emitter that fans webhook-bound events out through
    /// `engine`.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            engine,
        }
    }

    /// Register a listener invoked on every future `emit` of `event_type`.
    pub fn on(&self, event_type: impl Into<String>, listener: Listener) -> Unsubscribe {
        self.register(event_type.into(), listener, false)
    }

    /// Register a listener invoked at most once, then automatically
    /// removed.
    pub fn once(&self, event_type: impl Into<String>, listener: Listener) -> Unsubscribe {
        self.register(event_type.into(), listener, true)
    }

    fn register(&self, event_type: String, listener: Listener, once: bool) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .write()
            .entry(event_type.clone())
            .or_default()
            .push(Registration { id, listener, once });
        Unsubscribe { event_type, id, listeners: Arc::clone(&self.listeners) }
    }

    /// Invoke every local listener for `event_type` in registration
    /// order, then queue a delivery for every active webhook subscribed
    /// to it. Local listener panics/failures are not possible here (the
    /// listener signature has no `Result`); a listener that wants to
    /// report failure should log internally.
    pub async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        self.run_local_listeners(event_type, &data);
        self.dispatch_to_webhooks(event_type, data).await
    }

    fn run_local_listeners(&self, event_type: &str, data: &serde_json::Value) {
        let to_run: Vec<Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>> = {
            let mut listeners = self.listeners.write();
            let Some(regs) = listeners.get_mut(event_type) else {
                return;
            };
            let snapshot = regs.iter().map(|r| Arc::clone(&r.listener)).collect();
            regs.retain(|r| !r.once);
            snapshot
        };
        for listener in to_run {
            listener(event_type, data);
        }
    }

    async fn dispatch_to_webhooks(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        for webhook in self.engine.subscribers_for_event(event_type) {
            if let Err(err) = self
                .engine
                .queue_event(&webhook.id, event_type, data.clone(), Priority::Low, None, None)
                .await
            {
                warn!(webhook_id = %webhook.id, event_type = %event_type, error = %err, "failed to queue webhook delivery for emitted event");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::webhook::repository::Repository;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    async fn test_engine() -> Arc<Engine> {
        let dir = tempdir().unwrap();
        let repo = Arc::new(Repository::open(dir.path()).unwrap());
        let mut config = WebhookConfig::default();
        config.persist_queue = false;
        Engine::start(config, repo).await.unwrap()
    }

    #[tokio::test]
    async fn local_listeners_run_in_registration_order() {
        let engine = test_engine().await;
        let emitter = Emitter::new(engine);
        let order = Arc::new(RwLock::new(Vec::new()));

        let o1 = Arc::clone(&order);
        emitter.on("e", Arc::new(move |_, _| o1.write().push(1)));
        let o2 = Arc::clone(&order);
        emitter.on("e", Arc::new(move |_, _| o2.write().push(2)));

        emitter.emit("e", serde_json::json!({})).await.unwrap();
        assert_eq!(*order.read(), vec![1, 2]);
    }

    #[tokio::test]
    async fn once_listener_fires_a_single_time() {
        let engine = test_engine().await;
        let emitter = Emitter::new(engine);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        emitter.once("e", Arc::new(move |_, _| { c.fetch_add(1, Ordering::SeqCst); }));

        emitter.emit("e", serde_json::json!({})).await.unwrap();
        emitter.emit("e", serde_json::json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_listener_does_not_fire() {
        let engine = test_engine().await;
        let emitter = Emitter::new(engine);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let handle = emitter.on("e", Arc::new(move |_, _| { c.fetch_add(1, Ordering::SeqCst); }));
        handle.cancel();

        emitter.emit("e", serde_json::json!({})).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
