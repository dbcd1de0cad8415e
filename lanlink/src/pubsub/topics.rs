use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Message handler, called with the topic and the payload
pub type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Topic filters match by prefix: "/Intel" receives "/Intel/temperature",
/// and the empty filter receives everything.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    topic.starts_with(filter)
}

/// Handlers registered on a subscriber, one per topic filter
#[derive(Default)]
pub struct Subscriptions {
    handlers: RwLock<BTreeMap<String, Handler>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Handler>> {
        self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Handler>> {
        self.handlers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` for `topic`, replacing any previous handler.
    /// Returns true when the topic was not subscribed before.
    pub fn insert(&self, topic: &str, handler: Handler) -> bool {
        self.write().insert(topic.to_string(), handler).is_none()
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.write().remove(topic).is_some()
    }

    pub fn topics(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Invoke every handler whose filter matches `topic`, returning how many
    /// ran. Handlers run outside the lock so they may subscribe themselves.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let matching: Vec<Handler> = self
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in &matching {
            handler(topic, payload);
        }
        matching.len()
    }
}
