//! Topic-based publish/subscribe registry.
//!
//! Used in two places:
//!   - each service's local event table (topic -> listeners)
//!   - each worker's global event sets (topic -> opted-in service routers)
//!
//! Subscribing returns a [`SubscriptionToken`]; removal goes through that
//! token, so subscribers never need to be comparable.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capability for removing exactly one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    topic: String,
    id: u64,
}

impl SubscriptionToken {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Statistics about registry usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub topics: usize,
    pub active_subscribers: usize,
}

/// In-memory topic registry.
#[derive(Debug)]
pub struct Topics<T> {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, T)>>,
}

impl<T> Topics<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            topics: HashMap::new(),
        }
    }

    /// Register `subscriber` under `topic`.
    pub fn subscribe(&mut self, topic: impl Into<String>, subscriber: T) -> SubscriptionToken {
        let topic = topic.into();
        self.next_id += 1;
        let id = self.next_id;

        self.topics
            .entry(topic.clone())
            .or_default()
            .push((id, subscriber));

        tracing::trace!("subscribed id={} topic={}", id, topic);

        SubscriptionToken { topic, id }
    }

    /// Remove the subscription identified by `token`. Returns whether it existed.
    pub fn unsubscribe(&mut self, token: &SubscriptionToken) -> bool {
        let Some(subs) = self.topics.get_mut(&token.topic) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|(id, _)| *id != token.id);
        let removed = subs.len() != before;

        if subs.is_empty() {
            self.topics.remove(&token.topic);
        }

        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            topics: self.topics.len(),
            active_subscribers: self.topics.values().map(Vec::len).sum(),
        }
    }
}

impl<T: Clone> Topics<T> {
    /// Snapshot of the subscribers of `topic`, in subscription order.
    ///
    /// Returned by value so callers can invoke subscribers that mutate the
    /// registry.
    pub fn subscribers(&self, topic: &str) -> Vec<T> {
        self.topics
            .get(topic)
            .map(|subs| subs.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }
}

impl<T> Default for Topics<T> {
    fn default() -> Self {
        Self::new()
    }
}
