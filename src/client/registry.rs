//! Topic → callback bookkeeping for the gateway client.
//!
//! Invariants maintained by [`SubscriptionRegistry`] together with the
//! gateway:
//! - a topic key exists iff the transport holds an active protocol-level
//!   subscription for it;
//! - callback lists are never empty while a key exists (removing the last
//!   callback removes the key, and the caller issues the protocol
//!   unsubscribe).

use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked with the inbound payload rendered as text.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Opaque handle identifying one registered callback.
///
/// Closures have no usable identity in Rust, so removal of "this specific
/// callback" goes through the token handed back by `subscribe()` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// What a removal did to the topic's registry entry.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Removal {
    /// Topic or token was not registered; nothing changed.
    NotRegistered,
    /// Callback(s) removed but others remain; subscription stays live.
    Retained,
    /// Last callback removed and the key dropped; caller must issue the
    /// protocol-level unsubscribe.
    TopicEmptied,
}

/// Mapping from topic to registered callbacks, in registration order.
pub(super) struct SubscriptionRegistry {
    // ---
    next_id: u64,
    topics: HashMap<String, Vec<(SubscriptionToken, MessageCallback)>>,
}

impl SubscriptionRegistry {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            next_id: 0,
            topics: HashMap::new(),
        }
    }

    /// Whether a protocol-level subscription is held for `topic`.
    pub fn contains(&self, topic: &str) -> bool {
        // ---
        self.topics.contains_key(topic)
    }

    /// Append a callback for `topic`, creating the key if needed.
    pub fn insert(&mut self, topic: &str, callback: MessageCallback) -> SubscriptionToken {
        // ---
        self.next_id += 1;
        let token = SubscriptionToken(self.next_id);

        self.topics
            .entry(topic.to_owned())
            .or_default()
            .push((token, callback));

        token
    }

    /// Remove one callback (by token) or all callbacks for `topic`.
    pub fn remove(&mut self, topic: &str, token: Option<SubscriptionToken>) -> Removal {
        // ---
        let Some(callbacks) = self.topics.get_mut(topic) else {
            return Removal::NotRegistered;
        };

        match token {
            Some(token) => {
                let before = callbacks.len();
                callbacks.retain(|(t, _)| *t != token);
                if callbacks.len() == before {
                    return Removal::NotRegistered;
                }
            }
            None => callbacks.clear(),
        }

        if callbacks.is_empty() {
            self.topics.remove(topic);
            Removal::TopicEmptied
        } else {
            Removal::Retained
        }
    }

    /// Snapshot the callbacks for `topic` in registration order.
    ///
    /// Returns `None` for an unknown topic (inbound message dropped).
    pub fn callbacks(&self, topic: &str) -> Option<Vec<MessageCallback>> {
        // ---
        self.topics
            .get(topic)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        // ---
        self.topics.clear();
    }

    /// Number of topics with a live subscription.
    #[cfg(test)]
    pub fn topic_count(&self) -> usize {
        // ---
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn noop() -> MessageCallback {
        // ---
        Arc::new(|_payload: &str| {})
    }

    #[test]
    fn insert_creates_key_once_and_preserves_order() {
        // ---
        let mut registry = SubscriptionRegistry::new();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.insert(
                "devices/1",
                Arc::new(move |_: &str| order.lock().unwrap().push(tag)),
            );
        }
        assert_eq!(registry.topic_count(), 1);

        for cb in registry.callbacks("devices/1").unwrap() {
            cb("payload");
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn remove_by_token_leaves_other_callbacks() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert("t", noop());
        let _b = registry.insert("t", noop());

        assert_eq!(registry.remove("t", Some(a)), Removal::Retained);
        assert_eq!(registry.callbacks("t").unwrap().len(), 1);

        // Same token again is a no-op.
        assert_eq!(registry.remove("t", Some(a)), Removal::NotRegistered);
    }

    #[test]
    fn removing_last_callback_drops_the_key() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert("t", noop());

        assert_eq!(registry.remove("t", Some(a)), Removal::TopicEmptied);
        assert!(!registry.contains("t"));
    }

    #[test]
    fn bulk_remove_drops_the_key() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        registry.insert("t", noop());
        registry.insert("t", noop());

        assert_eq!(registry.remove("t", None), Removal::TopicEmptied);
        assert!(!registry.contains("t"));
    }

    #[test]
    fn unknown_topic_is_not_registered() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.remove("ghost", None), Removal::NotRegistered);
        assert!(registry.callbacks("ghost").is_none());
    }

    #[test]
    fn tokens_are_unique_across_topics() {
        // ---
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert("t1", noop());
        let b = registry.insert("t2", noop());
        assert_ne!(a, b);
    }
}
