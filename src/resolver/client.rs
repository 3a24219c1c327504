use std::time::Duration;

use crate::message::Message;
use crate::resolver::registry::TopicClass;
use crate::transport::{Connection, Connector, Endpoint};
use crate::utils::error::{Error, Result};

/// Asks the resolver at `resolver` which endpoint serves `topic`.
///
/// Opens a fresh connection for the single exchange and closes it afterwards.
pub async fn resolve(
    connector: &dyn Connector,
    resolver: &Endpoint,
    class: TopicClass,
    topic: &str,
    timeout: Option<Duration>,
) -> Result<Endpoint> {
    let connection = connector.connect(resolver).await?;
    let result = resolve_over(connection.as_ref(), class, topic, timeout).await;
    let _ = connection.close().await;
    result
}

/// Runs one resolution exchange over an already open connection.
pub async fn resolve_over(
    connection: &dyn Connection,
    class: TopicClass,
    topic: &str,
    timeout: Option<Duration>,
) -> Result<Endpoint> {
    let request = Message::new_sync(class.request_topic(), topic, Message::new_token());
    connection.write(&request.serialize()?, timeout).await?;
    let response = Message::deserialize(&connection.read(timeout).await?)?;
    if response.sync_token != request.sync_token {
        return Err(Error::protocol("resolution response for another request"));
    }

    let unknown = Error::UnknownTopic(topic.to_string());
    match response.into_result() {
        Ok(success) => Ok(serde_json::from_str(&success.payload)?),
        Err(Error::Remote(reason)) if reason == unknown.to_string() => Err(unknown),
        Err(e) => Err(e),
    }
}
