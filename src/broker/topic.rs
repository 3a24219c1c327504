use std::collections::HashSet;

/// Identifies a subscriber by the instance id of its connection.
pub type SubscriberId = String;

/// Represents a declared topic in the broker
/// Contains a name and the set of connections subscribed to it
/// A topic must be declared before anyone can subscribe to it
#[derive(Debug, Default, Clone)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    /// Creates a new topic with no subscribers
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Adds a subscriber to the topic
    /// Returns `false` if it was already subscribed
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.insert(id)
    }

    /// Removes a subscriber from the topic
    /// Returns `false` if it was not subscribed
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscribers.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscribers.contains(id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
