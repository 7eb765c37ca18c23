//! Streaming client connection manager.
//!
//! Owns the single WebSocket connection to the instance, the reconnect
//! loop around it, and the per-session wiring between the read loop, the
//! dedup cache, the bounded event queue, and the worker pool. Channel
//! subscriptions are multiplexed over this one connection; see
//! [`crate::stream::registry`] for the bookkeeping rules.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::StreamConfig;
use crate::domain::event::payload_id;
use crate::domain::frame::ClientFrame;
use crate::domain::{ChannelSpec, ChannelType, Envelope, EventKind, QueueItem};
use crate::error::StreamError;
use crate::service::{PluginManager, ProcessedStore};
use crate::stream::chat::ChatChannelTasks;
use crate::stream::dedup::DedupCache;
use crate::stream::dispatch::{Dispatcher, EventHandler, route_envelope};
use crate::stream::queue::{EventQueue, WorkerFn, WorkerPool};
use crate::stream::registry::ChannelRegistry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Builds the `wss://.../streaming?i=<token>` endpoint URL from the
/// configured instance URL, plus a token-free rendering for logs.
///
/// A bare host gets an `https` scheme; anything other than `https` is a
/// configuration error, reported before any socket activity.
fn build_ws_url(instance_url: &str, token: &str) -> Result<(Url, String), StreamError> {
    let trimmed = instance_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(StreamError::Configuration(
            "instance URL is empty".to_string(),
        ));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| StreamError::Configuration(format!("invalid instance URL: {e}")))?;
    if url.scheme() != "https" {
        return Err(StreamError::Configuration(format!(
            "instance URL scheme {:?} is not supported; use https",
            url.scheme()
        )));
    }
    url.set_scheme("wss")
        .map_err(|()| StreamError::Configuration("unable to derive wss URL".to_string()))?;
    let path = format!("{}/streaming", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("i", token);

    let mut safe = url.clone();
    safe.set_query(None);
    Ok((url, safe.to_string()))
}

/// Removes the access token from diagnostic text before it reaches a log
/// or an error message.
fn redact(message: &str, token: &str) -> String {
    if token.is_empty() {
        message.to_string()
    } else {
        message.replace(token, "[redacted]")
    }
}

/// Extracts the chat counterpart's user id from a chat payload.
fn chat_counterpart(payload: &Value) -> Option<&str> {
    payload
        .get("fromUserId")
        .and_then(Value::as_str)
        .or_else(|| payload.get("userId").and_then(Value::as_str))
        .or_else(|| {
            payload
                .get("user")
                .and_then(|user| user.get("id"))
                .and_then(Value::as_str)
        })
}

/// Session state shared with spawned tasks (chat-channel timers, the
/// dispatcher's chat opener).
struct ClientInner {
    config: StreamConfig,
    sink: Mutex<Option<WsSink>>,
    source: Mutex<Option<WsSource>>,
    registry: Mutex<ChannelRegistry>,
    dedup: Mutex<DedupCache>,
    queue: Mutex<EventQueue>,
    chat_tasks: ChatChannelTasks,
    running: AtomicBool,
    should_reconnect: AtomicBool,
    first_connection: AtomicBool,
}

impl ClientInner {
    /// Serializes and sends one frame over the live socket.
    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), StreamError> {
        let text = frame
            .to_json()
            .map_err(|e| StreamError::Decode(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(StreamError::Connection(
                "websocket unavailable".to_string(),
            ));
        };
        sink.send(Message::text(text))
            .await
            .map_err(|e| StreamError::Connection(redact(&e.to_string(), &self.config.access_token)))
    }

    async fn ws_available(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Subscribes to a channel, reusing an existing subscription with the
    /// same name and parameters.
    async fn connect_channel(
        &self,
        name: ChannelType,
        params: Map<String, Value>,
    ) -> Result<String, StreamError> {
        let mut registry = self.registry.lock().await;
        if let Some(id) = registry.find(&name, &params) {
            tracing::debug!(channel = %name, id, "channel already subscribed");
            return Ok(id.to_string());
        }
        if !self.ws_available().await {
            return Err(StreamError::Connection(
                "websocket unavailable; cannot subscribe".to_string(),
            ));
        }
        let id = registry.insert(name.clone(), params.clone());
        let frame = ClientFrame::connect(name.as_str(), id.as_str(), params);
        if let Err(err) = self.send_frame(&frame).await {
            registry.remove(&id);
            return Err(err);
        }
        tracing::info!(channel = %name, id = %id, "channel subscribed");
        Ok(id)
    }

    /// Unsubscribes every subscription with the given name. Frame sends
    /// are best-effort; local state is dropped regardless.
    async fn disconnect_channel(&self, name: &ChannelType) -> usize {
        let ids = { self.registry.lock().await.remove_by_name(name) };
        if self.ws_available().await {
            for id in &ids {
                if let Err(err) = self.send_frame(&ClientFrame::disconnect(id.clone())).await {
                    tracing::warn!(channel = %name, id = %id, error = %err, "unsubscribe frame failed");
                }
            }
        }
        if !ids.is_empty() {
            tracing::info!(channel = %name, count = ids.len(), "channel unsubscribed");
        }
        ids.len()
    }

    /// Unsubscribes a single subscription by id. Unknown ids are a no-op;
    /// the local entry is removed even when the socket is down.
    async fn disconnect_channel_id(&self, id: &str) {
        let existed = { self.registry.lock().await.remove(id) };
        if !existed {
            return;
        }
        if self.ws_available().await {
            if let Err(err) = self.send_frame(&ClientFrame::disconnect(id)).await {
                tracing::debug!(id, error = %err, "unsubscribe frame not sent");
            }
        }
        tracing::debug!(id, "channel subscription removed");
    }

    /// Sends a channel-scoped message to the subscription matching the
    /// given name and parameters. Silently dropped when nothing matches
    /// or the socket is down.
    async fn send_channel_message(
        &self,
        name: &ChannelType,
        event_type: &str,
        body: Map<String, Value>,
        params: &Map<String, Value>,
    ) {
        if name.as_str().is_empty() || event_type.is_empty() {
            return;
        }
        let id = {
            self.registry
                .lock()
                .await
                .find(name, params)
                .map(ToString::to_string)
        };
        let Some(id) = id else {
            tracing::debug!(channel = %name, "no matching subscription; message dropped");
            return;
        };
        if let Err(err) = self
            .send_frame(&ClientFrame::channel_message(id, event_type, body))
            .await
        {
            tracing::warn!(channel = %name, error = %err, "channel message send failed");
        }
    }

    /// Opens a dedicated `chatUser` channel for the payload's counterpart
    /// unless one is already active, and arms its idle teardown timer.
    /// Every delivered chat message restarts the timer, so an active
    /// conversation keeps its channel; only a quiet one is torn down.
    async fn ensure_chat_channel(inner: &Arc<Self>, payload: &Value) {
        let Some(user_id) = chat_counterpart(payload) else {
            tracing::debug!("chat payload carries no counterpart id");
            return;
        };
        let channel_id = match inner.chat_tasks.channel_id(user_id).await {
            Some(existing) => existing,
            None => {
                let mut params = Map::new();
                params.insert("otherId".to_string(), Value::String(user_id.to_string()));
                match inner.connect_channel(ChannelType::ChatUser, params).await {
                    Ok(id) => {
                        tracing::debug!(user = user_id, "chat channel opened");
                        id
                    }
                    Err(err) => {
                        tracing::warn!(user = user_id, error = %err, "failed to open chat channel");
                        return;
                    }
                }
            }
        };

        let task_inner = Arc::clone(inner);
        let task_user = user_id.to_string();
        let task_channel = channel_id.clone();
        let idle = inner.config.chat_channel_idle;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if task_inner.chat_tasks.remove(&task_user).await.is_some() {
                task_inner.disconnect_channel_id(&task_channel).await;
                tracing::debug!(user = %task_user, "idle chat channel closed");
            }
        });
        // Insert aborts the previous timer, refreshing the idle window.
        inner.chat_tasks.insert(user_id, channel_id, handle).await;
    }

    /// Drops both socket halves, closing the sink if one is live.
    async fn close_socket(&self) {
        self.source.lock().await.take();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    /// Drops per-session state after a failed or ended connection so the
    /// next attempt starts clean. Chat tasks are aborted too: their
    /// subscriptions do not exist on the next socket, so keeping them
    /// would block the channels from being re-opened.
    async fn reset_session(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.close_socket().await;
        self.registry.lock().await.clear();
        let stale = self.chat_tasks.abort_all().await;
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "chat channel tasks dropped with the session");
        }
    }
}

impl std::fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInner")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Long-lived streaming client over a single multiplexed WebSocket
/// connection.
///
/// One instance owns the connection lifecycle (connect, bounded retry,
/// reconnect, shutdown), the channel subscription registry, the dedup
/// cache, and the worker pool that drains the event queue into the
/// dispatcher.
pub struct StreamingClient {
    inner: Arc<ClientInner>,
    dispatcher: Arc<Dispatcher>,
    workers: Mutex<WorkerPool>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl std::fmt::Debug for StreamingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingClient")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl StreamingClient {
    /// Creates a client over the given store and plugin manager. No
    /// network activity happens until [`StreamingClient::connect`].
    #[must_use]
    pub fn new(
        config: StreamConfig,
        store: Arc<dyn ProcessedStore>,
        plugins: Arc<PluginManager>,
    ) -> Self {
        let (queue, rx) = EventQueue::bounded(config.queue_capacity, config.queue_put_timeout);
        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_ttl);
        let inner = Arc::new(ClientInner {
            config,
            sink: Mutex::new(None),
            source: Mutex::new(None),
            registry: Mutex::new(ChannelRegistry::new()),
            dedup: Mutex::new(dedup),
            queue: Mutex::new(queue),
            chat_tasks: ChatChannelTasks::new(),
            running: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(false),
            first_connection: AtomicBool::new(true),
        });

        let dispatcher = Arc::new(Dispatcher::new(store, plugins));
        let opener_inner = Arc::clone(&inner);
        dispatcher.set_chat_opener(Arc::new(move |payload| {
            let inner = Arc::clone(&opener_inner);
            Box::pin(async move {
                ClientInner::ensure_chat_channel(&inner, &payload).await;
            })
        }));

        Self {
            inner,
            dispatcher,
            workers: Mutex::new(WorkerPool::new()),
            queue_rx: Mutex::new(Some(rx)),
        }
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Registers a handler for an event kind. Handlers run in
    /// registration order until one reports the event handled.
    pub async fn register_handler(&self, kind: EventKind, handler: EventHandler) {
        self.dispatcher.register(kind, handler).await;
    }

    /// Registers a mention handler.
    pub async fn on_mention(&self, handler: EventHandler) {
        self.register_handler(EventKind::Mention, handler).await;
    }

    /// Registers a chat-message handler.
    pub async fn on_message(&self, handler: EventHandler) {
        self.register_handler(EventKind::Message, handler).await;
    }

    /// Registers a timeline/antenna note handler.
    pub async fn on_note(&self, handler: EventHandler) {
        self.register_handler(EventKind::Note, handler).await;
    }

    /// Registers a notification handler.
    pub async fn on_notification(&self, handler: EventHandler) {
        self.register_handler(EventKind::Notification, handler).await;
    }

    /// Connects to the instance and processes the stream until
    /// [`StreamingClient::disconnect`] is called.
    ///
    /// The `main` channel is always subscribed first; the requested
    /// channels follow, deduplicated against existing subscriptions. With
    /// `reconnect` set, connection and mid-session transport failures are
    /// retried with a fixed backoff; the consecutive-failure counter
    /// resets on every successful connection.
    ///
    /// # Errors
    ///
    /// [`StreamError::Configuration`] if the instance URL is invalid or
    /// not `https` (reported before any socket activity), or
    /// [`StreamError::Connection`] once the retry bound is exhausted.
    pub async fn connect(
        &self,
        channels: &[ChannelSpec],
        reconnect: bool,
    ) -> Result<(), StreamError> {
        let (url, safe_url) =
            build_ws_url(&self.inner.config.instance_url, &self.inner.config.access_token)?;
        let specs: Vec<ChannelSpec> = channels
            .iter()
            .filter(|spec| !spec.is_empty_name())
            .cloned()
            .collect();

        self.inner.should_reconnect.store(true, Ordering::SeqCst);
        let mut attempts: u32 = 0;
        loop {
            if !self.inner.should_reconnect.load(Ordering::SeqCst) {
                return Ok(());
            }
            let outcome = match self.connect_once(&url, &safe_url, &specs).await {
                Ok(()) => {
                    attempts = 0;
                    self.listen().await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    self.inner.reset_session().await;
                    if !self.inner.should_reconnect.load(Ordering::SeqCst) {
                        // Deliberate local shutdown raced the read loop.
                        return Ok(());
                    }
                    attempts += 1;
                    if !reconnect || attempts >= self.inner.config.ws_max_retries {
                        tracing::error!(attempts, error = %err, "websocket connection failed; giving up");
                        return Err(err);
                    }
                    tracing::warn!(
                        attempt = attempts,
                        max = self.inner.config.ws_max_retries,
                        error = %err,
                        "websocket connection lost; reconnecting"
                    );
                    tokio::time::sleep(self.inner.config.reconnect_backoff).await;
                }
                Err(err) => {
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    /// One connection attempt: start workers, open the socket, subscribe
    /// `main` plus the requested channels. Idempotent while running.
    async fn connect_once(
        &self,
        url: &Url,
        safe_url: &str,
        channels: &[ChannelSpec],
    ) -> Result<(), StreamError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("connect requested while already running");
            return Ok(());
        }
        self.start_workers().await;
        self.open_socket(url, safe_url).await?;

        self.inner
            .connect_channel(ChannelType::Main, Map::new())
            .await?;
        for spec in channels {
            self.inner
                .connect_channel(spec.name.clone(), spec.params.clone())
                .await?;
        }

        if self.inner.first_connection.swap(false, Ordering::SeqCst) {
            tracing::info!(instance = %self.inner.config.instance_url, "streaming client connected");
        } else {
            tracing::info!("streaming client reconnected");
        }
        Ok(())
    }

    async fn open_socket(&self, url: &Url, safe_url: &str) -> Result<(), StreamError> {
        tracing::debug!(url = safe_url, "opening websocket");
        let (socket, _response) = connect_async(url.as_str()).await.map_err(|err| {
            StreamError::Connection(redact(&err.to_string(), &self.inner.config.access_token))
        })?;
        let (sink, source) = socket.split();
        *self.inner.sink.lock().await = Some(sink);
        *self.inner.source.lock().await = Some(source);
        Ok(())
    }

    /// Starts the worker pool if it is not already running. After a full
    /// shutdown the queue is rebuilt so the client can be connected again.
    async fn start_workers(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_running() {
            return;
        }
        let rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                let (queue, rx) = EventQueue::bounded(
                    self.inner.config.queue_capacity,
                    self.inner.config.queue_put_timeout,
                );
                *self.inner.queue.lock().await = queue;
                rx
            }
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let work: WorkerFn = Arc::new(move |event_type, payload| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move {
                dispatcher.dispatch(&event_type, payload).await;
            })
        });
        workers.start(self.inner.config.worker_count, rx, work);
    }

    /// Read loop over the live socket. Returns `Ok` on an orderly local
    /// shutdown and [`StreamError::Reconnect`] when the transport fails.
    async fn listen(&self) -> Result<(), StreamError> {
        let Some(mut source) = self.inner.source.lock().await.take() else {
            tracing::debug!("no websocket source to listen on");
            return Ok(());
        };
        let queue = { self.inner.queue.lock().await.clone() };
        let timeout = self.inner.config.receive_timeout;

        while self.inner.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(timeout, source.next()).await {
                Err(_) => {
                    // No traffic inside the window; the connection may
                    // still be healthy.
                    tracing::trace!("receive timeout; continuing");
                }
                Ok(None) => return Err(StreamError::Reconnect("stream ended".to_string())),
                Ok(Some(Err(err))) => {
                    return Err(StreamError::Reconnect(redact(
                        &err.to_string(),
                        &self.inner.config.access_token,
                    )));
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    return Err(StreamError::Reconnect(
                        "server closed the connection".to_string(),
                    ));
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    self.handle_frame(text.as_str(), &queue).await?;
                }
                Ok(Some(Ok(_))) => {}
            }
        }
        Ok(())
    }

    /// Decodes one text frame, gates it through the dedup cache, and
    /// enqueues it for the workers.
    ///
    /// Frames that are not valid JSON indicate a corrupted stream and
    /// request a reconnect; structurally odd but valid JSON is logged
    /// and skipped.
    async fn handle_frame(&self, text: &str, queue: &EventQueue) -> Result<(), StreamError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| StreamError::Reconnect(format!("invalid frame: {err}")))?;
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "unrecognized frame shape; skipping");
                return Ok(());
            }
        };
        let Some((event_type, payload)) = route_envelope(envelope) else {
            return Ok(());
        };
        if let Some(id) = payload_id(&payload)
            && self.inner.dedup.lock().await.check_and_insert(id)
        {
            tracing::debug!(id, "duplicate event; skipping");
            return Ok(());
        }
        let _accepted = queue.push(event_type, payload).await;
        Ok(())
    }

    /// Subscribes to a channel over the live connection.
    ///
    /// Returns the existing subscription id if one with the same name and
    /// parameters is already active.
    ///
    /// # Errors
    ///
    /// [`StreamError::Connection`] if no socket is live or the subscribe
    /// frame cannot be sent.
    pub async fn connect_channel(
        &self,
        name: ChannelType,
        params: Map<String, Value>,
    ) -> Result<String, StreamError> {
        self.inner.connect_channel(name, params).await
    }

    /// Unsubscribes every subscription with the given name, returning how
    /// many were removed.
    pub async fn disconnect_channel(&self, name: &ChannelType) -> usize {
        self.inner.disconnect_channel(name).await
    }

    /// Unsubscribes a single subscription by id. Unknown ids are a no-op.
    pub async fn disconnect_channel_id(&self, id: &str) {
        self.inner.disconnect_channel_id(id).await;
    }

    /// Sends a channel-scoped message to the subscription matching the
    /// given name and parameters. Silently dropped when nothing matches.
    pub async fn send_channel_message(
        &self,
        name: &ChannelType,
        event_type: &str,
        body: Map<String, Value>,
        params: &Map<String, Value>,
    ) {
        self.inner
            .send_channel_message(name, event_type, body, params)
            .await;
    }

    /// Tears the session down: stops the read loop and reconnects, aborts
    /// chat-channel tasks, unsubscribes everything best-effort, closes
    /// the socket, and clears the dedup cache. Workers keep running.
    pub async fn disconnect(&self) {
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);

        let chat_channels = self.inner.chat_tasks.abort_all().await;
        if !chat_channels.is_empty() {
            tracing::debug!(count = chat_channels.len(), "chat channel tasks aborted");
        }

        let ids = {
            let mut registry = self.inner.registry.lock().await;
            let ids = registry.ids();
            registry.clear();
            ids
        };
        if self.inner.ws_available().await {
            for id in &ids {
                if let Err(err) = self.inner.send_frame(&ClientFrame::disconnect(id.clone())).await
                {
                    tracing::debug!(id = %id, error = %err, "unsubscribe frame not sent during shutdown");
                }
            }
        }

        self.inner.close_socket().await;
        self.inner.dedup.lock().await.clear();
        tracing::info!("streaming client disconnected");
    }

    /// Full shutdown: [`StreamingClient::disconnect`] plus a graceful
    /// worker-pool stop (one sentinel per worker, then join).
    pub async fn close(&self) {
        self.disconnect().await;
        let queue = { self.inner.queue.lock().await.clone() };
        self.workers.lock().await.stop(&queue).await;
        tracing::info!("streaming client closed");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::service::{MemoryStore, PluginManager};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio_test::assert_ok;
    use tokio_tungstenite::{accept_async, client_async};

    fn new_client(config: StreamConfig) -> StreamingClient {
        StreamingClient::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(PluginManager::new()),
        )
    }

    /// Loopback WebSocket server accepting one connection. Returns the
    /// address, the frames it received, and a sender for pushing text
    /// frames back to the client.
    async fn spawn_loopback_server() -> (SocketAddr, Arc<Mutex<Vec<Value>>>, mpsc::Sender<String>) {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel::<String>(8);
        let server_frames = Arc::clone(&frames);
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(stream).await else {
                return;
            };
            loop {
                tokio::select! {
                    inbound = ws.next() => match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                                server_frames.lock().await.push(value);
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    outbound = rx.recv() => match outbound {
                        Some(text) => {
                            let _ = ws.send(Message::text(text)).await;
                        }
                        None => break,
                    },
                }
            }
        });
        (addr, frames, tx)
    }

    /// Performs a plain-TCP WebSocket handshake against the loopback
    /// server and installs the socket halves into the client, as
    /// `open_socket` would for a live connection.
    async fn attach_loopback(client: &StreamingClient, addr: SocketAddr) {
        let Ok(tcp) = TcpStream::connect(addr).await else {
            panic!("loopback connect failed");
        };
        let handshake = client_async("ws://streaming.test/streaming", MaybeTlsStream::Plain(tcp));
        let Ok((ws, _response)) = handshake.await else {
            panic!("loopback handshake failed");
        };
        let (sink, source) = ws.split();
        *client.inner.sink.lock().await = Some(sink);
        *client.inner.source.lock().await = Some(source);
        client.inner.running.store(true, Ordering::SeqCst);
    }

    fn count_connect_frames(frames: &[Value], channel: &str) -> usize {
        frames
            .iter()
            .filter(|f| f["type"] == "connect" && f["body"]["channel"] == channel)
            .count()
    }

    #[test]
    fn https_maps_to_wss_streaming_endpoint() {
        let Ok((url, safe)) = build_ws_url("https://misskey.example/", "secret-token") else {
            panic!("url build failed");
        };
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/streaming");
        assert!(url.query().is_some_and(|q| q.contains("i=secret-token")));
        assert!(!safe.contains("secret-token"));
    }

    #[test]
    fn bare_host_defaults_to_https() {
        let Ok((url, _safe)) = build_ws_url("misskey.example", "t") else {
            panic!("url build failed");
        };
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("misskey.example"));
    }

    #[test]
    fn insecure_schemes_are_rejected() {
        for input in ["http://misskey.example", "ws://misskey.example", ""] {
            let result = build_ws_url(input, "t");
            assert!(
                matches!(result, Err(StreamError::Configuration(_))),
                "accepted {input:?}"
            );
        }
    }

    #[test]
    fn redaction_strips_token() {
        assert_eq!(
            redact("handshake to wss://h/streaming?i=tok123 failed", "tok123"),
            "handshake to wss://h/streaming?i=[redacted] failed"
        );
        assert_eq!(redact("plain", ""), "plain");
    }

    #[test]
    fn chat_counterpart_field_fallbacks() {
        assert_eq!(
            chat_counterpart(&serde_json::json!({"fromUserId": "u1"})),
            Some("u1")
        );
        assert_eq!(
            chat_counterpart(&serde_json::json!({"userId": "u2"})),
            Some("u2")
        );
        assert_eq!(
            chat_counterpart(&serde_json::json!({"user": {"id": "u3"}})),
            Some("u3")
        );
        assert_eq!(chat_counterpart(&serde_json::json!({"text": "hi"})), None);
    }

    #[tokio::test]
    async fn insecure_url_fails_before_any_retry() {
        let client = new_client(StreamConfig::new("http://127.0.0.1:1", "t"));
        let result = client.connect(&[], true).await;
        assert!(matches!(result, Err(StreamError::Configuration(_))));
        // No workers were started and nothing was subscribed.
        assert!(!client.workers.lock().await.is_running());
        assert!(client.inner.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn connection_failures_are_bounded_by_max_retries() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_srv = Arc::clone(&accepted);
        // Accept and immediately drop: the TLS handshake can never
        // complete, so every attempt fails.
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    accepted_srv.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let mut config = StreamConfig::new(format!("https://{addr}"), "t");
        config.reconnect_backoff = Duration::from_millis(10);
        config.ws_max_retries = 3;
        let client = new_client(config);

        let result = client.connect(&[], true).await;
        assert!(matches!(result, Err(StreamError::Connection(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        client.close().await;
    }

    #[tokio::test]
    async fn no_reconnect_fails_on_first_error() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_srv = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    accepted_srv.fetch_add(1, Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let mut config = StreamConfig::new(format!("https://{addr}"), "t");
        config.ws_max_retries = 3;
        let client = new_client(config);

        let result = client.connect(&[], false).await;
        assert!(matches!(result, Err(StreamError::Connection(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn subscribe_without_socket_fails_with_connection_error() {
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        let result = client.connect_channel(ChannelType::Main, Map::new()).await;
        assert!(matches!(result, Err(StreamError::Connection(_))));
        assert!(client.inner.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_teardown_is_a_noop() {
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        client.disconnect_channel_id("missing").await;
        assert_eq!(client.disconnect_channel(&ChannelType::Antenna).await, 0);
        client
            .send_channel_message(&ChannelType::Main, "read", Map::new(), &Map::new())
            .await;
    }

    #[tokio::test]
    async fn duplicate_frames_are_dropped_before_the_queue() {
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        let (queue, mut rx) = EventQueue::bounded(8, Duration::from_millis(100));
        let frame = r#"{"type":"channel","body":{"id":"s","type":"mention","body":{"id":"n1"}}}"#;

        assert!(client.handle_frame(frame, &queue).await.is_ok());
        assert!(client.handle_frame(frame, &queue).await.is_ok());
        drop(queue);
        drop(client);

        let mut delivered = 0;
        while let Some(item) = rx.recv().await {
            if matches!(item, QueueItem::Event { .. }) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn invalid_json_frame_requests_reconnect() {
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        let (queue, _rx) = EventQueue::bounded(8, Duration::from_millis(100));

        let result = client.handle_frame("not json", &queue).await;
        assert!(matches!(result, Err(StreamError::Reconnect(_))));

        // Valid JSON with an unexpected shape is skipped, not fatal.
        assert!(client.handle_frame(r#"{"no_type":true}"#, &queue).await.is_ok());
        assert!(client.handle_frame(r#"{"type":"pong"}"#, &queue).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_subscribe_sends_one_connect_frame() {
        let (addr, frames, _tx) = spawn_loopback_server().await;
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        attach_loopback(&client, addr).await;

        let mut params = Map::new();
        params.insert("antennaId".to_string(), Value::String("a1".to_string()));
        let first = assert_ok!(
            client
                .connect_channel(ChannelType::Antenna, params.clone())
                .await
        );
        let second = assert_ok!(client.connect_channel(ChannelType::Antenna, params).await);
        assert_eq!(first, second);

        // Give the server a beat to drain the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = frames.lock().await;
        assert_eq!(count_connect_frames(&frames, "antenna"), 1);
        assert_eq!(frames[0]["body"]["params"]["antennaId"], "a1");
        client.close().await;
    }

    #[tokio::test]
    async fn inbound_envelope_reaches_registered_handler() {
        let (addr, _frames, tx) = spawn_loopback_server().await;
        let mut config = StreamConfig::new("https://misskey.example", "t");
        config.receive_timeout = Duration::from_millis(100);
        let client = Arc::new(new_client(config));
        attach_loopback(&client, addr).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        client
            .on_mention(Arc::new(move |payload: Value| {
                let seen = Arc::clone(&seen_ref);
                Box::pin(async move {
                    if let Some(id) = payload.get("id").and_then(Value::as_str) {
                        seen.lock().await.push(id.to_string());
                    }
                    Ok(true)
                })
            }))
            .await;
        client.start_workers().await;

        let reader = Arc::clone(&client);
        let listen = tokio::spawn(async move { reader.listen().await });

        let envelope =
            json!({"type": "channel", "body": {"id": "s", "type": "mention", "body": {"id": "n1", "text": "hi"}}});
        assert_ok!(tx.send(envelope.to_string()).await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().await.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*seen.lock().await, vec!["n1"]);

        client.inner.running.store(false, Ordering::SeqCst);
        assert_ok!(assert_ok!(listen.await));
        client.close().await;
    }

    #[tokio::test]
    async fn reconnect_cleanup_allows_chat_channels_to_reopen() {
        let (addr, _frames, _tx) = spawn_loopback_server().await;
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        attach_loopback(&client, addr).await;

        let payload = json!({"fromUserId": "u1"});
        ClientInner::ensure_chat_channel(&client.inner, &payload).await;
        assert!(client.inner.chat_tasks.contains("u1").await);

        // Transport failure: the session is reset before the next attempt.
        client.inner.reset_session().await;
        assert!(client.inner.chat_tasks.is_empty().await);
        assert!(client.inner.registry.lock().await.is_empty());

        // A fresh socket must be able to open the same counterpart's
        // channel again.
        let (addr2, frames2, _tx2) = spawn_loopback_server().await;
        attach_loopback(&client, addr2).await;
        ClientInner::ensure_chat_channel(&client.inner, &payload).await;
        assert!(client.inner.chat_tasks.contains("u1").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames2 = frames2.lock().await;
        assert_eq!(count_connect_frames(&frames2, "chatUser"), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn chat_activity_refreshes_idle_timer() {
        let (addr, frames, _tx) = spawn_loopback_server().await;
        let mut config = StreamConfig::new("https://misskey.example", "t");
        config.chat_channel_idle = Duration::from_millis(200);
        let client = new_client(config);
        attach_loopback(&client, addr).await;

        let payload = json!({"fromUserId": "u1"});
        ClientInner::ensure_chat_channel(&client.inner, &payload).await;
        // Steady traffic past the original deadline keeps the channel up.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ClientInner::ensure_chat_channel(&client.inner, &payload).await;
        }
        assert!(client.inner.chat_tasks.contains("u1").await);
        {
            let frames = frames.lock().await;
            assert_eq!(count_connect_frames(&frames, "chatUser"), 1);
        }

        // A quiet stretch longer than the idle window tears it down.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!client.inner.chat_tasks.contains("u1").await);
        assert!(client.inner.registry.lock().await.is_empty());
        client.close().await;
    }

    #[tokio::test]
    async fn close_resets_client_state() {
        let client = new_client(StreamConfig::new("https://misskey.example", "t"));
        client.close().await;
        assert!(client.inner.registry.lock().await.is_empty());
        assert!(client.inner.dedup.lock().await.is_empty());
        assert!(client.inner.chat_tasks.is_empty().await);
        assert!(!client.workers.lock().await.is_running());
    }
}
