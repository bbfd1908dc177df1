//! ---
//! eb_section: "02-messaging-envelope-routing"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Envelope protocol, handler registry and dual-transport router."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use indexmap::IndexSet;

/// Ordered set of topics for one transport. Inserting a present topic is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    topics: IndexSet<String>,
}

impl SubscriptionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic, returning `true` if it was not already present.
    pub fn insert(&mut self, topic: impl Into<String>) -> bool {
        self.topics.insert(topic.into())
    }

    /// Remove a topic, returning `true` if it was present.
    pub fn remove(&mut self, topic: &str) -> bool {
        self.topics.shift_remove(topic)
    }

    /// Whether the topic is in the set.
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Topics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// Number of topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Drop every topic.
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

impl<S: Into<String>> FromIterator<S> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            topics: iter.into_iter().map(Into::into).collect(),
        }
    }
}
