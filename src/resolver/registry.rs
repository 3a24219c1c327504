use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ResolverSettings;
use crate::message::{Message, TOPIC_RESOLVE_ASYNC, TOPIC_RESOLVE_SYNC};
use crate::transport::Endpoint;
use crate::utils::error::{Error, Result};
use crate::utils::metrics::{Counters, MetricsSnapshot};

pub(crate) const RESOLVER_COUNTERS: &[&str] = &["resolutions_succeeded", "resolutions_failed"];

/// Which namespace a topic is resolved in. A topic registered for one class
/// is unknown to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicClass {
    Async,
    Sync,
}

impl TopicClass {
    /// Topic of a resolution request for this class.
    pub fn request_topic(self) -> &'static str {
        match self {
            TopicClass::Async => TOPIC_RESOLVE_ASYNC,
            TopicClass::Sync => TOPIC_RESOLVE_SYNC,
        }
    }

    pub fn from_request_topic(topic: &str) -> Option<Self> {
        match topic {
            TOPIC_RESOLVE_ASYNC => Some(TopicClass::Async),
            TOPIC_RESOLVE_SYNC => Some(TopicClass::Sync),
            _ => None,
        }
    }
}

impl std::fmt::Display for TopicClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicClass::Async => f.write_str("async"),
            TopicClass::Sync => f.write_str("sync"),
        }
    }
}

#[derive(Debug, Default)]
struct Resolutions {
    async_topics: HashMap<String, Endpoint>,
    sync_topics: HashMap<String, Endpoint>,
}

impl Resolutions {
    fn class(&self, class: TopicClass) -> &HashMap<String, Endpoint> {
        match class {
            TopicClass::Async => &self.async_topics,
            TopicClass::Sync => &self.sync_topics,
        }
    }

    fn class_mut(&mut self, class: TopicClass) -> &mut HashMap<String, Endpoint> {
        match class {
            TopicClass::Async => &mut self.async_topics,
            TopicClass::Sync => &mut self.sync_topics,
        }
    }
}

/// Topic → broker endpoint registry, one map per [`TopicClass`] behind a single lock.
#[derive(Debug)]
pub struct Resolver {
    resolutions: Mutex<Resolutions>,
    counters: Counters,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            resolutions: Mutex::new(Resolutions::default()),
            counters: Counters::new(RESOLVER_COUNTERS),
        }
    }

    /// Creates a resolver pre-seeded with the configured resolutions.
    pub fn from_settings(settings: &ResolverSettings) -> Self {
        let resolver = Self::new();
        {
            let mut resolutions = resolver.resolutions.lock();
            resolutions.async_topics = settings.async_resolutions.clone();
            resolutions.sync_topics = settings.sync_resolutions.clone();
        }
        resolver
    }

    /// Sets the endpoint serving `topic`, returning the one it replaces.
    pub fn add_resolution(
        &self,
        class: TopicClass,
        topic: impl Into<String>,
        endpoint: Endpoint,
    ) -> Option<Endpoint> {
        let topic = topic.into();
        info!(%class, topic = %topic, endpoint = %endpoint, "resolution added");
        self.resolutions
            .lock()
            .class_mut(class)
            .insert(topic, endpoint)
    }

    pub fn remove_resolution(&self, class: TopicClass, topic: &str) -> Result<Endpoint> {
        let removed = self
            .resolutions
            .lock()
            .class_mut(class)
            .remove(topic)
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;
        info!(%class, topic = %topic, "resolution removed");
        Ok(removed)
    }

    pub fn resolve(&self, class: TopicClass, topic: &str) -> Result<Endpoint> {
        let resolved = self.resolutions.lock().class(class).get(topic).cloned();
        match resolved {
            Some(endpoint) => {
                self.counters.incr("resolutions_succeeded");
                Ok(endpoint)
            }
            None => {
                self.counters.incr("resolutions_failed");
                debug!(%class, topic = %topic, "unknown topic");
                Err(Error::UnknownTopic(topic.to_string()))
            }
        }
    }

    pub fn resolve_async(&self, topic: &str) -> Result<Endpoint> {
        self.resolve(TopicClass::Async, topic)
    }

    pub fn resolve_sync(&self, topic: &str) -> Result<Endpoint> {
        self.resolve(TopicClass::Sync, topic)
    }

    pub fn resolution_count(&self, class: TopicClass) -> usize {
        self.resolutions.lock().class(class).len()
    }

    /// Registered topics of `class`, sorted.
    pub fn topics(&self, class: TopicClass) -> Vec<String> {
        let mut topics: Vec<String> = self.resolutions.lock().class(class).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Answers one resolution request: `success` carrying the endpoint as
    /// JSON, or `failure` carrying the reason.
    pub fn handle_request(&self, request: &Message) -> Message {
        let Some(class) = TopicClass::from_request_topic(&request.topic) else {
            self.counters.incr("resolutions_failed");
            let reason = Error::protocol(format!("unexpected topic '{}'", request.topic));
            return Message::failure(&request.sync_token, reason.to_string());
        };
        let resolved = self
            .resolve(class, &request.payload)
            .and_then(|endpoint| serde_json::to_string(&endpoint).map_err(Error::from));
        match resolved {
            Ok(endpoint) => Message::success(&request.sync_token, endpoint),
            Err(e) => Message::failure(&request.sync_token, e.to_string()),
        }
    }

    pub(crate) fn record_failure(&self) {
        self.counters.incr("resolutions_failed");
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    pub fn take_metrics(&self) -> MetricsSnapshot {
        self.counters.take()
    }
}
