//! Event dispatcher: envelope interpretation and handler routing.
//!
//! The read loop uses [`route_envelope`] to turn a raw text frame into an
//! `(event_type, payload)` pair; workers then hand those pairs to
//! [`Dispatcher::dispatch`], which classifies the inner type, gates it on
//! the processed-identifier store, runs plugin hooks, and finally invokes
//! the registered handlers in registration order.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::domain::event::payload_id;
use crate::domain::{ChannelEvent, Envelope, EventKind};
use crate::error::StreamError;
use crate::service::{PluginManager, ProcessedMeta, ProcessedStore};

/// Future returned by an event handler. Resolving to `Ok(true)` marks the
/// event as handled and stops further handlers on that path.
pub type HandlerFuture = BoxFuture<'static, Result<bool, StreamError>>;

/// Asynchronous event handler callback.
pub type EventHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Callback used to ensure a dedicated chat channel exists for the
/// counterpart carried in a chat payload.
pub type ChatChannelOpener = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Interprets a decoded envelope, returning the inner `(event_type,
/// payload)` pair for channel envelopes and `None` for everything else
/// (which is logged and discarded).
#[must_use]
pub fn route_envelope(envelope: Envelope) -> Option<(String, Value)> {
    if !envelope.is_channel() {
        tracing::debug!(kind = %envelope.kind, "ignoring non-channel envelope");
        return None;
    }
    match serde_json::from_value::<ChannelEvent>(envelope.body) {
        Ok(event) => Some((event.event_type, event.body)),
        Err(err) => {
            tracing::debug!(error = %err, "malformed channel body; skipping");
            None
        }
    }
}

/// Routes classified events to plugin hooks and registered handlers.
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    store: Arc<dyn ProcessedStore>,
    plugins: Arc<PluginManager>,
    chat_opener: OnceLock<ChatChannelOpener>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over the given store and plugin manager.
    #[must_use]
    pub fn new(store: Arc<dyn ProcessedStore>, plugins: Arc<PluginManager>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            store,
            plugins,
            chat_opener: OnceLock::new(),
        }
    }

    /// Installs the chat-channel opener. Called once by the connection
    /// manager during construction; later calls are ignored.
    pub fn set_chat_opener(&self, opener: ChatChannelOpener) {
        let _ = self.chat_opener.set(opener);
    }

    /// Appends a handler for the given event kind. Registration order is
    /// invocation order; duplicate registrations are all called.
    pub async fn register(&self, kind: EventKind, handler: EventHandler) {
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Number of handlers registered for a kind.
    pub async fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .await
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Dispatches one dequeued event.
    pub async fn dispatch(&self, event_type: &str, payload: Value) {
        let Some(kind) = EventKind::classify(event_type) else {
            tracing::debug!(event_type, "unrouted event type");
            return;
        };

        match kind {
            EventKind::Notification => self.dispatch_notification(payload).await,
            EventKind::Mention | EventKind::Note | EventKind::Message => {
                self.dispatch_gated(kind, payload).await;
            }
        }
    }

    /// Notification path: best-effort, no store gate, failures never abort
    /// the remaining handlers.
    async fn dispatch_notification(&self, payload: Value) {
        self.plugins.on_notification(&payload).await;
        let handlers = self.handlers_for(EventKind::Notification).await;
        for handler in handlers {
            if let Err(err) = handler(payload.clone()).await {
                tracing::warn!(error = %err, "notification handler failed");
            }
        }
    }

    /// Mention/note/message path: skip already-processed ids, mark before
    /// handling, let plugins short-circuit, then run handlers until one
    /// reports the event handled.
    async fn dispatch_gated(&self, kind: EventKind, payload: Value) {
        if let Some(id) = payload_id(&payload) {
            if self.store.is_processed(id).await {
                tracing::debug!(%kind, id, "already processed; skipping");
                return;
            }
            let user_id = payload
                .get("userId")
                .or_else(|| payload.get("user").and_then(|u| u.get("id")))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            self.store
                .mark_processed(id, ProcessedMeta::now(kind, user_id))
                .await;
        }

        if kind == EventKind::Message
            && let Some(opener) = self.chat_opener.get()
        {
            opener(payload.clone()).await;
        }

        let hook_results = match kind {
            EventKind::Mention => self.plugins.on_mention(&payload).await,
            EventKind::Message => self.plugins.on_message(&payload).await,
            _ => Vec::new(),
        };
        if PluginManager::any_handled(&hook_results) {
            tracing::debug!(%kind, "event handled by plugin");
            return;
        }

        let handlers = self.handlers_for(kind).await;
        for handler in handlers {
            match handler(payload.clone()).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(%kind, error = %err, "event handler failed");
                }
            }
        }
    }

    async fn handlers_for(&self, kind: EventKind) -> Vec<EventHandler> {
        self.handlers
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::service::{HookResult, MemoryStore, PluginHook};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    fn recording_handler(
        log: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
        handled: bool,
    ) -> EventHandler {
        Arc::new(move |_payload| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().await.push(tag);
                Ok(handled)
            })
        })
    }

    fn failing_handler(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> EventHandler {
        Arc::new(move |_payload| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().await.push(tag);
                Err(StreamError::Decode("handler failure".to_string()))
            })
        })
    }

    fn new_dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(MemoryStore::new()), Arc::new(PluginManager::new()))
    }

    #[test]
    fn non_channel_envelopes_are_discarded() {
        let envelope = Envelope {
            kind: "pong".to_string(),
            body: json!({}),
        };
        assert!(route_envelope(envelope).is_none());
    }

    #[test]
    fn channel_envelope_yields_inner_pair() {
        let envelope = Envelope {
            kind: "channel".to_string(),
            body: json!({"id": "sub-1", "type": "mention", "body": {"id": "n1"}}),
        };
        let Some((event_type, payload)) = route_envelope(envelope) else {
            panic!("expected routed event");
        };
        assert_eq!(event_type, "mention");
        assert_eq!(payload["id"], "n1");
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_until_handled() {
        let dispatcher = new_dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register(EventKind::Mention, recording_handler(Arc::clone(&log), "first", false))
            .await;
        dispatcher
            .register(EventKind::Mention, recording_handler(Arc::clone(&log), "second", true))
            .await;
        dispatcher
            .register(EventKind::Mention, recording_handler(Arc::clone(&log), "third", false))
            .await;

        dispatcher.dispatch("mention", json!({"id": "n1"})).await;
        assert_eq!(*log.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn processed_ids_are_not_redispatched() {
        let dispatcher = new_dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register(EventKind::Mention, recording_handler(Arc::clone(&log), "m", false))
            .await;

        dispatcher.dispatch("mention", json!({"id": "n1"})).await;
        dispatcher.dispatch("mention", json!({"id": "n1"})).await;
        assert_eq!(log.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_later_handlers() {
        let dispatcher = new_dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register(EventKind::Note, failing_handler(Arc::clone(&log), "bad"))
            .await;
        dispatcher
            .register(EventKind::Note, recording_handler(Arc::clone(&log), "good", false))
            .await;

        dispatcher.dispatch("note", json!({"id": "n2"})).await;
        assert_eq!(*log.lock().await, vec!["bad", "good"]);
    }

    #[tokio::test]
    async fn notification_failures_never_abort() {
        let dispatcher = new_dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register(EventKind::Notification, failing_handler(Arc::clone(&log), "bad"))
            .await;
        dispatcher
            .register(
                EventKind::Notification,
                recording_handler(Arc::clone(&log), "good", false),
            )
            .await;

        dispatcher.dispatch("notification", json!({"id": "x1"})).await;
        dispatcher.dispatch("notification", json!({"id": "x2"})).await;
        // Notifications carry no store gate, so both dispatches ran both
        // handlers.
        assert_eq!(*log.lock().await, vec!["bad", "good", "bad", "good"]);
    }

    #[tokio::test]
    async fn plugin_handled_short_circuits_handlers() {
        struct Claiming;
        #[async_trait]
        impl PluginHook for Claiming {
            fn name(&self) -> &str {
                "claiming"
            }
            async fn on_mention(&self, _payload: &Value) -> Result<HookResult, StreamError> {
                Ok(HookResult::handled_with("done"))
            }
        }

        let mut plugins = PluginManager::new();
        plugins.register(Arc::new(Claiming));
        let dispatcher = Dispatcher::new(Arc::new(MemoryStore::new()), Arc::new(plugins));

        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher
            .register(EventKind::Mention, recording_handler(Arc::clone(&log), "m", false))
            .await;

        dispatcher.dispatch("mention", json!({"id": "n1"})).await;
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn chat_event_invokes_opener_before_handlers() {
        let dispatcher = new_dispatcher();
        let opened = Arc::new(Mutex::new(Vec::new()));
        let opened_ref = Arc::clone(&opened);
        dispatcher.set_chat_opener(Arc::new(move |payload| {
            let opened = Arc::clone(&opened_ref);
            Box::pin(async move {
                if let Some(user) = payload.get("userId").and_then(Value::as_str) {
                    opened.lock().await.push(user.to_string());
                }
            })
        }));

        dispatcher
            .dispatch("messagingMessage", json!({"id": "m1", "userId": "u9"}))
            .await;
        assert_eq!(*opened.lock().await, vec!["u9"]);
    }

    #[tokio::test]
    async fn unrouted_types_are_ignored() {
        let dispatcher = new_dispatcher();
        // Must not panic or touch any handler table.
        dispatcher.dispatch("readAllNotifications", json!({})).await;
        assert_eq!(dispatcher.handler_count(EventKind::Mention).await, 0);
    }
}
