use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::correlator::{Correlator, CorrelatorSettings};
use crate::message::{Message, TOPIC_SUBSCRIBE, TOPIC_UNSUBSCRIBE, encode_topics};
use crate::routine::{MessageHandler, ReadRoutine};
use crate::transport::{Connector, Endpoint, SharedConnection, Status};
use crate::utils::error::{Error, Result};

/// One client connection to a broker.
///
/// Responses are matched to the requests waiting on them; every other message
/// is forwarded to the `incoming` channel the link was opened with.
pub struct BrokerLink {
    endpoint: Endpoint,
    connection: SharedConnection,
    correlator: Arc<Correlator<Message>>,
    reader: ReadRoutine,
    write_timeout: Option<Duration>,
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection.instance_id())
            .field("pending", &self.correlator.len())
            .finish()
    }
}

impl BrokerLink {
    /// Wraps an open connection and starts reading from it.
    pub fn open(
        endpoint: Endpoint,
        connection: SharedConnection,
        incoming: UnboundedSender<Message>,
        write_timeout: Option<Duration>,
    ) -> Result<Self> {
        let correlator = Arc::new(Correlator::new(CorrelatorSettings::default()));
        let handler = Arc::new(LinkHandler {
            correlator: correlator.clone(),
            incoming,
        });
        // deliveries keep their arrival order
        let reader = ReadRoutine::new(connection.clone(), handler, None, false);
        reader.start()?;
        debug!(endpoint = %endpoint, connection = %connection.instance_id(), "broker link opened");
        Ok(Self {
            endpoint,
            connection,
            correlator,
            reader,
            write_timeout,
        })
    }

    pub async fn connect(
        connector: &dyn Connector,
        endpoint: &Endpoint,
        incoming: UnboundedSender<Message>,
        write_timeout: Option<Duration>,
    ) -> Result<Self> {
        let connection = connector.connect(endpoint).await?;
        Self::open(endpoint.clone(), connection, incoming, write_timeout)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.connection.status() == Status::Started
    }

    /// Requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    /// Writes one message without waiting for an answer.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.connection
            .write(&message.serialize()?, self.write_timeout)
            .await
    }

    /// Sends a synchronous message and waits for the broker's response to it.
    ///
    /// A `failure` response becomes [`Error::Remote`]. The wait ends early with
    /// [`Error::ConnectionClosed`] if the link drops.
    pub async fn request(&self, message: Message, timeout: Option<Duration>) -> Result<Message> {
        if !message.is_sync() {
            return Err(Error::protocol("request without a sync token"));
        }
        // dropping the handle on any early return retires the entry
        let mut pending = self
            .correlator
            .new_request(message.sync_token.clone(), 1, timeout)?;
        self.send(&message).await?;

        let closed = self.connection.close_signal();
        let response = tokio::select! {
            // a response delivered just before the close still wins
            biased;
            response = pending.next() => response.ok_or(Error::Timeout),
            _ = closed.fired() => Err(Error::ConnectionClosed),
        };
        response?.into_result()
    }

    pub async fn subscribe(&self, topics: &[String], timeout: Option<Duration>) -> Result<()> {
        self.control(TOPIC_SUBSCRIBE, topics, timeout).await
    }

    pub async fn unsubscribe(&self, topics: &[String], timeout: Option<Duration>) -> Result<()> {
        self.control(TOPIC_UNSUBSCRIBE, topics, timeout).await
    }

    async fn control(&self, topic: &str, topics: &[String], timeout: Option<Duration>) -> Result<()> {
        let request = Message::new_sync(topic, encode_topics(topics)?, Message::new_token());
        self.request(request, timeout).await.map(|_| ())
    }

    pub async fn close(&self) -> Result<()> {
        let _ = self.reader.stop(true).await;
        let result = self.connection.close().await;
        debug!(endpoint = %self.endpoint, "broker link closed");
        result
    }
}

struct LinkHandler {
    correlator: Arc<Correlator<Message>>,
    incoming: UnboundedSender<Message>,
}

#[async_trait]
impl MessageHandler for LinkHandler {
    async fn handle(&self, data: Vec<u8>, connection: SharedConnection) {
        let message = match Message::deserialize(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %connection.instance_id(), "dropping malformed message: {e}");
                return;
            }
        };
        if message.response {
            let token = message.sync_token.clone();
            if let Err(e) = self.correlator.add_response(&token, message) {
                debug!(token = %token, "unmatched response: {e}");
            }
        } else if self.incoming.send(message).is_err() {
            debug!(connection = %connection.instance_id(), "incoming receiver dropped");
        }
    }
}
