//! Subscription registry
//!
//! Tracks the topics the application wants, independent of whether a
//! connection is currently open. Iteration follows insertion order.

use indexmap::IndexSet;
use realtime_core::ControlFrame;

/// Set of desired topics
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    topics: IndexSet<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with startup topics (duplicates collapse)
    pub fn with_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a topic, returns false if it was already present
    pub fn insert(&mut self, topic: &str) -> bool {
        if self.topics.contains(topic) {
            return false;
        }
        self.topics.insert(topic.to_string())
    }

    /// Remove a topic, returns false if it was not present
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.shift_remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// Owned copy of the current topics
    pub fn snapshot(&self) -> Vec<String> {
        self.topics.iter().cloned().collect()
    }

    /// One subscribe frame per topic, replayed on every (re)connect
    pub fn subscribe_frames(&self) -> Vec<ControlFrame> {
        self.topics.iter().map(ControlFrame::subscribe).collect()
    }
}
