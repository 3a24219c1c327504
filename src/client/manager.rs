use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::client::link::BrokerLink;
use crate::config::Settings;
use crate::message::Message;
use crate::resolver::{TopicClass, resolve};
use crate::transport::{Endpoint, SharedConnector};
use crate::utils::error::{Error, Result};

/// Client-side orchestration of subscriptions across brokers.
///
/// Each topic is resolved to the broker serving it, and one [`BrokerLink`] is
/// kept per broker address and shared by every topic that broker serves.
/// Messages pushed by brokers (publications and sync requests to answer)
/// arrive on the receiver returned by [`SubscriptionManager::new`].
pub struct SubscriptionManager {
    connector: SharedConnector,
    resolver: Endpoint,
    write_timeout: Option<Duration>,
    control_timeout: Option<Duration>,
    incoming: UnboundedSender<Message>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    links: HashMap<String, Arc<BrokerLink>>,
    routes: HashMap<(TopicClass, String), Endpoint>,
    subscriptions: HashMap<(TopicClass, String), String>,
}

impl SubscriptionManager {
    pub fn new(
        connector: SharedConnector,
        resolver: Endpoint,
        settings: &Settings,
    ) -> (Self, UnboundedReceiver<Message>) {
        let (incoming, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            connector,
            resolver,
            write_timeout: settings.connection.write_timeout(),
            control_timeout: settings.resolver.request_timeout(),
            incoming,
            state: Mutex::new(State::default()),
        };
        (manager, receiver)
    }

    /// Resolves `topic`, connects to (or reuses) its broker and subscribes.
    pub async fn subscribe(&self, class: TopicClass, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (class, topic.to_string());
        let active = state
            .subscriptions
            .get(&key)
            .and_then(|address| state.links.get(address))
            .is_some_and(|link| link.is_open());
        if active {
            return Ok(());
        }
        let link = self.link_for(&mut state, class, topic).await?;
        link.subscribe(&[topic.to_string()], self.control_timeout)
            .await?;
        info!(%class, topic = %topic, broker = %link.endpoint(), "subscribed");
        state
            .subscriptions
            .insert(key, link.endpoint().address.clone());
        Ok(())
    }

    pub async fn unsubscribe(&self, class: TopicClass, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (class, topic.to_string());
        let address = state
            .subscriptions
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotSubscribed(topic.to_string()))?;
        if let Some(link) = state.links.get(&address).cloned() {
            if link.is_open() {
                link.unsubscribe(&[topic.to_string()], self.control_timeout)
                    .await?;
            }
        }
        state.subscriptions.remove(&key);
        info!(%class, topic = %topic, "unsubscribed");
        Ok(())
    }

    /// Publishes an asynchronous message on the broker serving `topic`.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let link = {
            let mut state = self.state.lock().await;
            self.link_for(&mut state, TopicClass::Async, topic).await?
        };
        link.send(&Message::new(topic, payload)).await
    }

    /// Sends a synchronous request to the subscribers of `topic` and returns
    /// their replies, one per answering subscriber.
    pub async fn request(
        &self,
        topic: &str,
        payload: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Message>> {
        let link = {
            let mut state = self.state.lock().await;
            self.link_for(&mut state, TopicClass::Sync, topic).await?
        };
        let request = Message::new_sync(topic, payload, Message::new_token());
        let no_responses = Error::NoResponses.to_string();
        match link.request(request, timeout).await {
            Ok(response) => Message::deserialize_batch(&response.payload),
            Err(Error::Remote(reason)) if reason == no_responses => Err(Error::NoResponses),
            Err(e) => Err(e),
        }
    }

    /// Answers a sync request received on the incoming channel.
    pub async fn respond(&self, request: &Message, payload: &str) -> Result<()> {
        if !request.is_sync() || request.response {
            return Err(Error::protocol("only sync requests can be answered"));
        }
        let link = {
            let state = self.state.lock().await;
            let key = (TopicClass::Sync, request.topic.clone());
            state
                .subscriptions
                .get(&key)
                .and_then(|address| state.links.get(address))
                .cloned()
                .ok_or_else(|| Error::NotSubscribed(request.topic.clone()))?
        };
        link.send(&request.reply(payload)).await
    }

    /// Topics currently subscribed in `class`, sorted.
    pub async fn subscriptions(&self, class: TopicClass) -> Vec<String> {
        let state = self.state.lock().await;
        let mut topics: Vec<String> = state
            .subscriptions
            .keys()
            .filter(|(c, _)| *c == class)
            .map(|(_, topic)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Number of open broker links.
    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }

    /// Closes every link and forgets all routes and subscriptions.
    pub async fn close(&self) {
        let links: Vec<Arc<BrokerLink>> = {
            let mut state = self.state.lock().await;
            state.routes.clear();
            state.subscriptions.clear();
            state.links.drain().map(|(_, link)| link).collect()
        };
        for link in links {
            let _ = link.close().await;
        }
    }

    async fn link_for(
        &self,
        state: &mut State,
        class: TopicClass,
        topic: &str,
    ) -> Result<Arc<BrokerLink>> {
        let key = (class, topic.to_string());
        let endpoint = match state.routes.get(&key).cloned() {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = resolve(
                    self.connector.as_ref(),
                    &self.resolver,
                    class,
                    topic,
                    self.control_timeout,
                )
                .await?;
                debug!(%class, topic = %topic, broker = %endpoint, "topic resolved");
                endpoint
            }
        };

        let address = endpoint.address.clone();
        let existing = state
            .links
            .get(&address)
            .filter(|link| link.is_open())
            .cloned();
        let link = match existing {
            Some(link) => link,
            None => {
                // a dropped link loses its broker-side subscriptions
                state.subscriptions.retain(|_, a| *a != address);
                let link = BrokerLink::connect(
                    self.connector.as_ref(),
                    &endpoint,
                    self.incoming.clone(),
                    self.write_timeout,
                )
                .await?;
                let link = Arc::new(link);
                state.links.insert(address.clone(), link.clone());
                link
            }
        };
        state.routes.insert(key, endpoint);
        Ok(link)
    }
}
