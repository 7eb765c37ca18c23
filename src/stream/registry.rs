//! Channel subscription bookkeeping.
//!
//! Tracks active logical subscriptions (id → name + parameters) over the
//! single physical connection and enforces the uniqueness invariant: at
//! most one subscription exists per (name, parameters) pair. The registry
//! is pure state; frame sends are performed by the connection manager so
//! the uniqueness logic stays testable without a socket.

use std::collections::HashMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::ChannelType;

/// One active channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    /// Channel name.
    pub name: ChannelType,
    /// Parameters sent with the subscribe frame.
    pub params: Map<String, Value>,
}

/// Registry of active channel subscriptions, keyed by the UUID the client
/// assigned in the subscribe frame.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    subscriptions: HashMap<String, ChannelSubscription>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of an existing subscription with the same name and
    /// parameter set, if any. Parameter comparison is order-irrelevant.
    #[must_use]
    pub fn find(&self, name: &ChannelType, params: &Map<String, Value>) -> Option<&str> {
        self.subscriptions
            .iter()
            .find(|(_, sub)| &sub.name == name && &sub.params == params)
            .map(|(id, _)| id.as_str())
    }

    /// Records a new subscription under a freshly generated UUID and
    /// returns the id.
    pub fn insert(&mut self, name: ChannelType, params: Map<String, Value>) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions
            .insert(id.clone(), ChannelSubscription { name, params });
        id
    }

    /// Removes every subscription with the given name, returning the
    /// removed ids. There may be several matches with different parameters.
    pub fn remove_by_name(&mut self, name: &ChannelType) -> Vec<String> {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| &sub.name == name)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.subscriptions.remove(id);
        }
        ids
    }

    /// Removes exactly one subscription. Returns `true` if it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    /// Returns `true` if the id is currently registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }

    /// All currently registered subscription ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns `true` if no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Returns `true` if any subscription with the given name exists.
    #[must_use]
    pub fn has_channel(&self, name: &ChannelType) -> bool {
        self.subscriptions.values().any(|sub| &sub.name == name)
    }

    /// Drops all subscriptions without sending anything.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}
