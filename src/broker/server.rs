//! Wire protocol of the broker: accepts connections and routes their messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::Settings;
use crate::message::{Message, TOPIC_SUBSCRIBE, TOPIC_UNSUBSCRIBE, decode_topics};
use crate::routine::{AcceptRoutine, ConnectionHandler, MessageHandler, ReadRoutine};
use crate::transport::{CloseSignal, SharedConnection, SharedListener, Status};
use crate::utils::commands::{self, CommandHandlers};
use crate::utils::error::{Error, Result};
use crate::utils::metrics::MetricsSnapshot;

/// Serves a [`Broker`] on a listener.
pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: SharedListener,
    accept: AcceptRoutine,
}

impl BrokerServer {
    pub fn new(listener: SharedListener, broker: Arc<Broker>, settings: &Settings) -> Self {
        let handler = Arc::new(BrokerConnectionHandler {
            broker: broker.clone(),
            read_timeout: settings.connection.read_timeout(),
            write_timeout: settings.connection.write_timeout(),
            concurrent_reads: settings.broker.handle_reads_concurrently,
        });
        let accept = AcceptRoutine::new(listener.clone(), handler, settings.accepter.clone());
        Self {
            broker,
            listener,
            accept,
        }
    }

    /// Convenience for a broker whose topics come from `settings`.
    pub fn with_settings(listener: SharedListener, settings: &Settings) -> Self {
        Self::new(listener, Arc::new(Broker::new(&settings.broker)), settings)
    }

    pub fn start(&self) -> Result<()> {
        self.accept.start()?;
        info!(address = %self.listener.address(), topics = ?self.broker.topics(), "broker started");
        Ok(())
    }

    /// Stops accepting and drops every connection. The listener stays bound so
    /// the server can be started again.
    pub async fn stop(&self) -> Result<()> {
        self.accept.stop().await?;
        for connection in self.broker.disconnect_all() {
            let _ = connection.close().await;
        }
        info!(address = %self.listener.address(), "broker stopped");
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.accept.status()
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn address(&self) -> String {
        self.listener.address()
    }

    /// Broker counters plus the listener's, prefixed with `listener.`.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut metrics = self.broker.metrics();
        metrics.merge("listener", self.listener.metrics());
        metrics
    }

    /// `start`, `stop`, `status`, `metrics`, `add_topic <topic>`, `remove_topic <topic>`.
    pub fn commands(self: &Arc<Self>) -> CommandHandlers {
        let mut handlers = CommandHandlers::new();

        let server = self.clone();
        handlers.insert(
            "start".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move {
                    server.start()?;
                    Ok("success".to_string())
                }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "stop".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move {
                    server.stop().await?;
                    Ok("success".to_string())
                }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "status".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move { Ok(server.status().to_string()) }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "metrics".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move { Ok(serde_json::to_string(&server.metrics())?) }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "add_topic".to_string(),
            commands::handler(move |args| {
                let server = server.clone();
                async move {
                    let topic = commands::single_arg("add_topic", &args)?;
                    server.broker.add_topic(&topic);
                    Ok("success".to_string())
                }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "remove_topic".to_string(),
            commands::handler(move |args| {
                let server = server.clone();
                async move {
                    let topic = commands::single_arg("remove_topic", &args)?;
                    server.broker.remove_topic(&topic)?;
                    Ok("success".to_string())
                }
            }),
        );

        handlers
    }
}

struct BrokerConnectionHandler {
    broker: Arc<Broker>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    concurrent_reads: bool,
}

#[async_trait]
impl ConnectionHandler for BrokerConnectionHandler {
    async fn handle(&self, connection: SharedConnection, stop: CloseSignal) -> Result<()> {
        let id = connection.instance_id().to_string();
        self.broker.register(connection.clone());

        let reader = ReadRoutine::new(
            connection.clone(),
            Arc::new(BrokerMessageHandler {
                broker: self.broker.clone(),
                write_timeout: self.write_timeout,
            }),
            self.read_timeout,
            self.concurrent_reads,
        );
        if let Err(e) = reader.start() {
            self.broker.disconnect(&id);
            return Err(e);
        }
        debug!(connection = %id, address = %connection.address(), "broker connection opened");

        let closed = connection.close_signal();
        tokio::select! {
            _ = closed.fired() => {}
            _ = stop.fired() => {}
        }

        let _ = reader.stop(true).await;
        self.broker.disconnect(&id);
        let _ = connection.close().await;
        debug!(connection = %id, "broker connection closed");
        Ok(())
    }
}

struct BrokerMessageHandler {
    broker: Arc<Broker>,
    write_timeout: Option<Duration>,
}

impl BrokerMessageHandler {
    async fn reply(&self, connection: &SharedConnection, reply: Message) {
        let frame = match reply.serialize() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to serialize reply: {e}");
                return;
            }
        };
        if let Err(e) = connection.write(&frame, self.write_timeout).await {
            debug!(connection = %connection.instance_id(), "failed to write reply: {e}");
        }
    }

    async fn handle_control(&self, connection: &SharedConnection, message: &Message) {
        let sender = connection.instance_id();
        let result = decode_topics(&message.payload).and_then(|topics| {
            if message.topic == TOPIC_SUBSCRIBE {
                self.broker.subscribe(sender, &topics)
            } else {
                self.broker.unsubscribe(sender, &topics)
            }
        });

        if message.is_sync() {
            let reply = match &result {
                Ok(()) => Message::success(&message.sync_token, ""),
                Err(e) => Message::failure(&message.sync_token, e.to_string()),
            };
            self.reply(connection, reply).await;
        } else if let Err(e) = result {
            warn!(connection = %sender, topic = %message.topic, "control message failed: {e}");
        }
    }

    async fn handle_sync(&self, connection: &SharedConnection, message: &Message) {
        let result = self
            .broker
            .propagate_sync(connection.instance_id(), message)
            .await
            .and_then(|replies| Message::serialize_batch(&replies));
        let reply = match result {
            Ok(batch) => Message::success(&message.sync_token, batch),
            Err(e) => {
                debug!(topic = %message.topic, "sync request failed: {e}");
                Message::failure(&message.sync_token, e.to_string())
            }
        };
        self.reply(connection, reply).await;
    }
}

#[async_trait]
impl MessageHandler for BrokerMessageHandler {
    async fn handle(&self, data: Vec<u8>, connection: SharedConnection) {
        let message = match Message::deserialize(&data) {
            Ok(message) => message,
            Err(e) => {
                self.broker.record_protocol_error();
                warn!(connection = %connection.instance_id(), "dropping malformed message: {e}");
                return;
            }
        };

        if message.response {
            if let Err(e) = self
                .broker
                .handle_response(connection.instance_id(), message)
            {
                debug!(connection = %connection.instance_id(), "unmatched response: {e}");
            }
            return;
        }

        match message.topic.as_str() {
            TOPIC_SUBSCRIBE | TOPIC_UNSUBSCRIBE => self.handle_control(&connection, &message).await,
            _ if message.is_sync() => self.handle_sync(&connection, &message).await,
            _ => {
                if let Err(e) = self
                    .broker
                    .propagate_async(connection.instance_id(), &message)
                    .await
                {
                    if matches!(e, Error::UnknownTopic(_)) {
                        self.broker.record_protocol_error();
                    }
                    debug!(topic = %message.topic, "async propagation failed: {e}");
                }
            }
        }
    }
}
