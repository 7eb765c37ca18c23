//! Bounded event queue and worker pool.
//!
//! The queue decouples the network-reading path from processing. The read
//! loop is the sole producer; enqueue attempts apply a timeout so that a
//! full queue drops the event instead of stalling frame decoding for every
//! channel on the connection. A fixed number of workers drain the queue
//! concurrently; shutdown enqueues one [`QueueItem::Shutdown`] sentinel per
//! worker and joins them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::domain::QueueItem;

/// Callback invoked by a worker for each dequeued event.
pub type WorkerFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Producer side of the bounded FIFO event queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<QueueItem>,
    put_timeout: Duration,
}

impl EventQueue {
    /// Creates a bounded queue, returning the producer handle and the
    /// receiver to hand to [`WorkerPool::start`].
    #[must_use]
    pub fn bounded(capacity: usize, put_timeout: Duration) -> (Self, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, put_timeout }, rx)
    }

    /// Enqueues an event, waiting at most the configured put timeout when
    /// the queue is full. Returns `false` if the item was dropped.
    pub async fn push(&self, event_type: String, payload: Value) -> bool {
        let item = QueueItem::Event {
            event_type,
            payload,
        };
        match tokio::time::timeout(self.put_timeout, self.tx.send(item)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                tracing::warn!("event queue closed; dropping event");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.put_timeout.as_millis() as u64,
                    "event queue full; dropping event"
                );
                false
            }
        }
    }

    /// Enqueues a shutdown sentinel. Unlike [`EventQueue::push`] this waits
    /// without a timeout: workers are draining during shutdown, so the send
    /// completes once a slot frees up.
    pub async fn push_sentinel(&self) {
        let _ = self.tx.send(QueueItem::Shutdown).await;
    }
}

/// Fixed pool of worker tasks draining the event queue.
#[derive(Debug, Default)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates an empty, stopped pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while worker tasks are alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawns `count` workers sharing the queue receiver. No-op if the
    /// pool is already running.
    pub fn start(&mut self, count: usize, rx: mpsc::Receiver<QueueItem>, work: WorkerFn) {
        if self.is_running() {
            return;
        }
        let shared_rx = Arc::new(Mutex::new(rx));
        for index in 0..count.max(1) {
            let rx = Arc::clone(&shared_rx);
            let work = Arc::clone(&work);
            self.handles.push(tokio::spawn(async move {
                worker_loop(index, rx, work).await;
            }));
        }
        tracing::debug!(workers = count.max(1), "worker pool started");
    }

    /// Releases every blocked worker with a sentinel and joins them.
    pub async fn stop(&mut self, queue: &EventQueue) {
        if self.handles.is_empty() {
            return;
        }
        for _ in 0..self.handles.len() {
            queue.push_sentinel().await;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::debug!("worker pool stopped");
    }
}

async fn worker_loop(index: usize, rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>, work: WorkerFn) {
    loop {
        // Pickup is serialized through the mutex; processing below runs
        // concurrently across workers once the lock is released.
        let item = { rx.lock().await.recv().await };
        match item {
            Some(QueueItem::Event {
                event_type,
                payload,
            }) => {
                work(event_type, payload).await;
            }
            Some(QueueItem::Shutdown) | None => {
                tracing::trace!(worker = index, "worker exiting");
                return;
            }
        }
    }
}
