//! Processed-identifier store.
//!
//! Durable "already handled" bookkeeping lives behind [`ProcessedStore`];
//! the dispatcher checks it before invoking handlers and marks identifiers
//! as soon as handling begins. [`MemoryStore`] is the in-process
//! implementation; durable backends implement the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::EventKind;

/// Metadata recorded alongside a processed identifier.
#[derive(Debug, Clone)]
pub struct ProcessedMeta {
    /// Which handler path processed the event.
    pub kind: EventKind,
    /// Identifier of the user the event came from, when known.
    pub user_id: Option<String>,
    /// When the identifier was marked.
    pub processed_at: DateTime<Utc>,
}

impl ProcessedMeta {
    /// Metadata stamped with the current time.
    #[must_use]
    pub fn now(kind: EventKind, user_id: Option<String>) -> Self {
        Self {
            kind,
            user_id,
            processed_at: Utc::now(),
        }
    }
}

/// Key-existence/insert store for processed event identifiers.
#[async_trait]
pub trait ProcessedStore: Send + Sync {
    /// Returns `true` if the identifier was already marked processed.
    async fn is_processed(&self, id: &str) -> bool;

    /// Marks the identifier as processed with the given metadata.
    /// Idempotent; a second mark overwrites the metadata.
    async fn mark_processed(&self, id: &str, meta: ProcessedMeta);
}

/// In-memory [`ProcessedStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, ProcessedMeta>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of marked identifiers.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` if nothing has been marked.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl ProcessedStore for MemoryStore {
    async fn is_processed(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    async fn mark_processed(&self, id: &str, meta: ProcessedMeta) {
        self.entries.lock().await.insert(id.to_string(), meta);
    }
}
