use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::subscriptions::Subscriptions;
use crate::config::BrokerSettings;
use crate::correlator::{Correlator, CorrelatorSettings, PendingRequest};
use crate::message::Message;
use crate::transport::SharedConnection;
use crate::utils::error::{Error, Result};
use crate::utils::metrics::{Counters, MetricsSnapshot};

pub(crate) const BROKER_COUNTERS: &[&str] = &[
    "messages_received",
    "messages_propagated",
    "propagation_failures",
    "sync_requests",
    "sync_responses",
    "subscriptions",
    "unsubscriptions",
    "protocol_errors",
];

/// Represents the broker that routes messages between connections
/// It keeps the subscription indices, fans messages out to subscribers
/// and gathers the replies of synchronous requests
///
/// Index reads and write dispatch happen under one lock so every message sees
/// a consistent subscriber snapshot; waiting for writes and replies happens
/// outside of it.
pub struct Broker {
    subscriptions: Mutex<Subscriptions>,
    correlator: Correlator<Message>,
    /// Sync tokens currently being gathered, per sender token.
    in_flight: Mutex<HashSet<String>>,
    propagate_timeout: Option<Duration>,
    sync_timeout: Option<Duration>,
    counters: Counters,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.topics())
            .field("pending_requests", &self.correlator.len())
            .finish()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerSettings::default())
    }
}

/// Removes a sync token from the in-flight set when gathering ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    token: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.token);
    }
}

impl Broker {
    /// Creates a broker with the topics declared in `settings`
    pub fn new(settings: &BrokerSettings) -> Self {
        let mut subscriptions = Subscriptions::new();
        for topic in &settings.topics {
            subscriptions.declare_topic(topic);
        }
        Self {
            subscriptions: Mutex::new(subscriptions),
            correlator: Correlator::new(CorrelatorSettings {
                max_active_requests: settings.max_active_requests,
                ..CorrelatorSettings::default()
            }),
            in_flight: Mutex::new(HashSet::new()),
            propagate_timeout: settings.propagate_timeout(),
            sync_timeout: settings.sync_timeout(),
            counters: Counters::new(BROKER_COUNTERS),
        }
    }

    /// Declares a topic. Returns `false` if it already existed
    pub fn add_topic(&self, topic: &str) -> bool {
        let added = self.subscriptions.lock().declare_topic(topic);
        if added {
            info!(topic = %topic, "topic added");
        }
        added
    }

    /// Removes a topic together with all of its memberships
    pub fn remove_topic(&self, topic: &str) -> Result<usize> {
        let dropped = self.subscriptions.lock().remove_topic(topic)?;
        info!(topic = %topic, dropped, "topic removed");
        Ok(dropped)
    }

    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.lock().topics()
    }

    /// Registers a connection so it can subscribe
    pub fn register(&self, connection: SharedConnection) {
        let id = connection.instance_id().to_string();
        if self.subscriptions.lock().register(connection) {
            debug!(connection = %id, "connection registered");
        }
    }

    pub fn subscribe(&self, connection_id: &str, topics: &[String]) -> Result<()> {
        self.subscriptions.lock().subscribe(connection_id, topics)?;
        self.counters.add("subscriptions", topics.len() as u64);
        debug!(connection = %connection_id, ?topics, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, topics: &[String]) -> Result<()> {
        self.subscriptions.lock().unsubscribe(connection_id, topics)?;
        self.counters.add("unsubscriptions", topics.len() as u64);
        debug!(connection = %connection_id, ?topics, "unsubscribed");
        Ok(())
    }

    pub fn topics_of(&self, connection_id: &str) -> Vec<String> {
        self.subscriptions.lock().topics_of(connection_id)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions.lock().subscriber_count(topic)
    }

    pub fn is_registered(&self, connection_id: &str) -> bool {
        self.subscriptions.lock().is_registered(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.subscriptions.lock().connection_count()
    }

    /// Number of per-subscriber sync requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    /// Sends `message` to every subscriber of its topic except `sender`
    ///
    /// A failed write to one subscriber is logged and counted and never
    /// affects the others. Returns the number of successful deliveries.
    pub async fn propagate_async(&self, sender: &str, message: &Message) -> Result<usize> {
        self.counters.incr("messages_received");
        let frame = Arc::new(Message::new(&message.topic, &message.payload).serialize()?);

        let writes: Vec<(String, JoinHandle<Result<()>>)> = {
            let subscriptions = self.subscriptions.lock();
            subscriptions
                .subscribers_of(&message.topic, sender)?
                .into_iter()
                .map(|target| {
                    let id = target.instance_id().to_string();
                    (id, self.dispatch(target, frame.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (subscriber, write) in writes {
            match Self::settle(write).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.counters.incr("propagation_failures");
                    warn!(subscriber = %subscriber, topic = %message.topic, "failed to propagate message: {e}");
                }
            }
        }
        self.counters.add("messages_propagated", delivered as u64);
        Ok(delivered)
    }

    /// Sends a synchronous request to every subscriber of its topic except
    /// `sender` and gathers one reply per subscriber
    ///
    /// Returns the replies received before the sync timeout, each carrying the
    /// original sync token. Zero replies is [`Error::NoResponses`].
    pub async fn propagate_sync(&self, sender: &str, message: &Message) -> Result<Vec<Message>> {
        self.counters.incr("messages_received");
        self.counters.incr("sync_requests");
        let token = message.sync_token.clone();
        if token.is_empty() {
            return Err(Error::protocol("synchronous message without a sync token"));
        }
        if !self.in_flight.lock().insert(token.clone()) {
            return Err(Error::TokenCollision(token));
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            token: token.clone(),
        };

        type Dispatched = (PendingRequest<Message>, String, JoinHandle<Result<()>>);
        let dispatched: Vec<Dispatched> = {
            let subscriptions = self.subscriptions.lock();
            let targets = subscriptions.subscribers_of(&message.topic, sender)?;
            let mut dispatched = Vec::with_capacity(targets.len());
            for target in targets {
                let subscriber = target.instance_id().to_string();
                // one correlator entry per subscriber, so each reply is attributable
                let routed = format!("{token}:{subscriber}");
                let frame = Message::new_sync(&message.topic, &message.payload, &routed).serialize()?;
                let pending = match self.correlator.new_owned_request(
                    routed.clone(),
                    1,
                    self.sync_timeout,
                    vec![sender.to_string(), subscriber.clone()],
                ) {
                    Ok(pending) => pending,
                    Err(e) => {
                        self.counters.incr("propagation_failures");
                        warn!(subscriber = %subscriber, "cannot register sync request: {e}");
                        continue;
                    }
                };
                dispatched.push((pending, routed, self.dispatch(target, Arc::new(frame))));
            }
            dispatched
        };

        let mut waiting = Vec::with_capacity(dispatched.len());
        for (pending, routed, write) in dispatched {
            match Self::settle(write).await {
                Ok(()) => {
                    self.counters.incr("messages_propagated");
                    waiting.push(pending);
                }
                Err(e) => {
                    self.counters.incr("propagation_failures");
                    let _ = self.correlator.abort(&routed);
                    warn!(token = %routed, topic = %message.topic, "failed to send sync request: {e}");
                }
            }
        }

        let replies: Vec<Message> = join_all(
            waiting
                .into_iter()
                .map(|mut pending| async move { pending.next().await }),
        )
        .await
        .into_iter()
        .flatten()
        .map(|mut reply| {
            reply.sync_token = token.clone();
            reply
        })
        .collect();

        self.counters.add("sync_responses", replies.len() as u64);
        if replies.is_empty() {
            return Err(Error::NoResponses);
        }
        Ok(replies)
    }

    /// Delivers a subscriber's reply to the sync request it answers
    ///
    /// Only the subscriber a request was routed to may answer it.
    pub fn handle_response(&self, responder: &str, message: Message) -> Result<()> {
        let routed = message.sync_token.clone();
        let addressed_to_responder = routed
            .rsplit_once(':')
            .is_some_and(|(_, subscriber)| subscriber == responder);
        if !addressed_to_responder {
            return Err(Error::InvalidToken(routed));
        }
        self.correlator.add_response(&routed, message)
    }

    /// Purges a connection from both indices and fails every sync request it takes part in
    pub fn disconnect(&self, connection_id: &str) -> Option<SharedConnection> {
        let removed = self.subscriptions.lock().remove_connection(connection_id);
        let aborted = self.correlator.abort_owned_by(connection_id);
        if removed.is_some() {
            debug!(connection = %connection_id, aborted, "connection removed from broker");
        }
        removed.map(|subscriber| subscriber.connection)
    }

    /// Purges every connection, returning them so the caller can close them
    pub fn disconnect_all(&self) -> Vec<SharedConnection> {
        let connections = self.subscriptions.lock().drain();
        for connection in &connections {
            self.correlator.abort_owned_by(connection.instance_id());
        }
        connections
    }

    pub(crate) fn record_protocol_error(&self) {
        self.counters.incr("protocol_errors");
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }

    /// Returns the counters and resets them
    pub fn take_metrics(&self) -> MetricsSnapshot {
        self.counters.take()
    }

    fn dispatch(&self, target: SharedConnection, frame: Arc<Vec<u8>>) -> JoinHandle<Result<()>> {
        let timeout = self.propagate_timeout;
        tokio::spawn(async move { target.write(&frame, timeout).await })
    }

    async fn settle(write: JoinHandle<Result<()>>) -> Result<()> {
        match write.await {
            Ok(result) => result,
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        }
    }
}
