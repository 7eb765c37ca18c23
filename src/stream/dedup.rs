//! Bounded, time-expiring set of recently seen event identifiers.
//!
//! The streaming server redelivers events around reconnects and across
//! overlapping channels; this cache is the only gate between the read loop
//! and the queue. Two independent eviction triggers bound memory: a hard
//! capacity (oldest insertion evicted first) and a per-entry TTL (lazy
//! expiry check on access rather than a periodic sweep).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Bounded TTL set of event identifiers.
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<String, Instant>,
    /// Insertion order, oldest at the front. May briefly hold ids whose
    /// map entry was already replaced; `evict_oldest` skips those.
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    /// Creates a cache holding at most `capacity` identifiers, each
    /// expiring `ttl` after insertion.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    /// Returns `true` if `id` was inserted within the TTL window.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|inserted| inserted.elapsed() < self.ttl)
    }

    /// Inserts `id`, refreshing its insertion time if already present.
    /// Evicts expired entries first, then the oldest insertions until the
    /// capacity bound holds.
    pub fn insert(&mut self, id: &str) {
        self.purge_expired();
        if self.entries.insert(id.to_string(), Instant::now()).is_none() {
            self.order.push_back(id.to_string());
        } else {
            // Refresh: drop the stale order slot and re-append.
            self.order.retain(|queued| queued != id);
            self.order.push_back(id.to_string());
        }
        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Checks membership and inserts in one step. Returns `true` if `id`
    /// was already present (a duplicate), `false` if it was newly recorded.
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        let seen = self.contains(id);
        if !seen {
            self.insert(id);
        }
        seen
    }

    /// Number of live (unexpired) identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|inserted| inserted.elapsed() < self.ttl)
            .count()
    }

    /// Returns `true` if no live identifiers remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Called on disconnect and close.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
    }

    fn evict_oldest(&mut self) {
        while let Some(oldest) = self.order.pop_front() {
            if self.entries.remove(&oldest).is_some() {
                return;
            }
        }
    }
}
