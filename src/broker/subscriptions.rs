//! Two-way subscription index.
//!
//! `topics` maps a topic to its subscribers and `subscribers` maps a connection
//! to its topics. Both live in one struct and every mutation updates both, so
//! holding the broker's single lock is enough to keep them consistent.

use std::collections::{HashMap, HashSet};

use crate::broker::topic::{SubscriberId, Topic};
use crate::transport::SharedConnection;
use crate::utils::error::{Error, Result};

/// A registered connection and the topics it is subscribed to.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection: SharedConnection,
    pub topics: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    topics: HashMap<String, Topic>,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a topic. Returns `false` if it already existed.
    pub fn declare_topic(&mut self, name: &str) -> bool {
        if self.topics.contains_key(name) {
            return false;
        }
        self.topics.insert(name.to_string(), Topic::new(name));
        true
    }

    /// Removes a topic and every membership in it. Returns how many
    /// subscribers were dropped.
    pub fn remove_topic(&mut self, name: &str) -> Result<usize> {
        let topic = self
            .topics
            .remove(name)
            .ok_or_else(|| Error::UnknownTopic(name.to_string()))?;
        for id in &topic.subscribers {
            if let Some(subscriber) = self.subscribers.get_mut(id) {
                subscriber.topics.remove(name);
            }
        }
        Ok(topic.len())
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    /// Declared topic names, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a connection with no subscriptions. Returns `false` if it was
    /// already registered.
    pub fn register(&mut self, connection: SharedConnection) -> bool {
        let id = connection.instance_id().to_string();
        if self.subscribers.contains_key(&id) {
            return false;
        }
        self.subscribers.insert(
            id,
            Subscriber {
                connection,
                topics: HashSet::new(),
            },
        );
        true
    }

    /// Removes a connection from both indices.
    pub fn remove_connection(&mut self, id: &str) -> Option<Subscriber> {
        let subscriber = self.subscribers.remove(id)?;
        for name in &subscriber.topics {
            if let Some(topic) = self.topics.get_mut(name) {
                topic.unsubscribe(id);
            }
        }
        Some(subscriber)
    }

    fn registered(&self, id: &str) -> Result<()> {
        if self.subscribers.contains_key(id) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Subscribes `id` to every topic in `names`, or to none of them if any
    /// topic is undeclared. Re-subscribing is a no-op.
    pub fn subscribe(&mut self, id: &str, names: &[String]) -> Result<()> {
        self.registered(id)?;
        if let Some(unknown) = names.iter().find(|name| !self.topics.contains_key(*name)) {
            return Err(Error::UnknownTopic(unknown.clone()));
        }

        for name in names {
            if let Some(topic) = self.topics.get_mut(name) {
                topic.subscribe(id.to_string());
            }
            if let Some(subscriber) = self.subscribers.get_mut(id) {
                subscriber.topics.insert(name.clone());
            }
        }
        Ok(())
    }

    /// Unsubscribes `id` from every topic in `names`. An undeclared topic or
    /// one `id` is not subscribed to rejects the whole batch.
    pub fn unsubscribe(&mut self, id: &str, names: &[String]) -> Result<()> {
        self.registered(id)?;
        for name in names {
            match self.topics.get(name) {
                None => return Err(Error::UnknownTopic(name.clone())),
                Some(topic) if !topic.contains(id) => {
                    return Err(Error::NotSubscribed(name.clone()));
                }
                Some(_) => {}
            }
        }

        for name in names {
            if let Some(topic) = self.topics.get_mut(name) {
                topic.unsubscribe(id);
            }
            if let Some(subscriber) = self.subscribers.get_mut(id) {
                subscriber.topics.remove(name);
            }
        }
        Ok(())
    }

    /// Current subscribers of `topic`, never including `exclude`.
    pub fn subscribers_of(&self, topic: &str, exclude: &str) -> Result<Vec<SharedConnection>> {
        let topic = self
            .topics
            .get(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        Ok(topic
            .subscribers
            .iter()
            .filter(|id| id.as_str() != exclude)
            .filter_map(|id| self.subscribers.get(id))
            .map(|subscriber| subscriber.connection.clone())
            .collect())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(Topic::len).unwrap_or(0)
    }

    /// Topics `id` is subscribed to, sorted.
    pub fn topics_of(&self, id: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscribers
            .get(id)
            .map(|subscriber| subscriber.topics.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Removes every connection, returning them.
    pub fn drain(&mut self) -> Vec<SharedConnection> {
        for topic in self.topics.values_mut() {
            topic.subscribers.clear();
        }
        self.subscribers
            .drain()
            .map(|(_, subscriber)| subscriber.connection)
            .collect()
    }
}
