//! The `message` module defines the envelope exchanged between brokers,
//! resolvers and clients.
//!
//! A message is serialized as a JSON object and carried as one frame on any
//! transport. It is synchronous iff it carries a non-empty sync token.
//!
//! # Example
//!
//! ```rust
//! use switchyard::message::Message;
//!
//! let request = Message::new_sync("prices", "AAPL", "token-1");
//! assert!(request.is_sync());
//! let reply = request.reply("189.5");
//! assert!(reply.response);
//! assert_eq!(reply.sync_token, "token-1");
//! ```

use serde::{Deserialize, Serialize};

use crate::utils::error::{Error, Result};

/// Control topic carrying a JSON array of topic names to subscribe to.
pub const TOPIC_SUBSCRIBE: &str = "subscribe";
/// Control topic carrying a JSON array of topic names to unsubscribe from.
pub const TOPIC_UNSUBSCRIBE: &str = "unsubscribe";
pub const TOPIC_SUCCESS: &str = "success";
pub const TOPIC_FAILURE: &str = "failure";
pub const TOPIC_RESOLVE_ASYNC: &str = "resolve_async";
pub const TOPIC_RESOLVE_SYNC: &str = "resolve_sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sync_token: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    /// Creates an asynchronous (fire-and-forget) message.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            sync_token: String::new(),
            response: false,
        }
    }

    /// Creates a synchronous request correlated by `sync_token`.
    pub fn new_sync(
        topic: impl Into<String>,
        payload: impl Into<String>,
        sync_token: impl Into<String>,
    ) -> Self {
        Self {
            sync_token: sync_token.into(),
            ..Self::new(topic, payload)
        }
    }

    pub fn success(sync_token: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            response: true,
            ..Self::new_sync(TOPIC_SUCCESS, payload, sync_token)
        }
    }

    pub fn failure(sync_token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            response: true,
            ..Self::new_sync(TOPIC_FAILURE, reason, sync_token)
        }
    }

    /// Builds the response to this request: same topic and token, marked as a response.
    pub fn reply(&self, payload: impl Into<String>) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: payload.into(),
            sync_token: self.sync_token.clone(),
            response: true,
        }
    }

    /// Generates a fresh random sync token.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_sync(&self) -> bool {
        !self.sync_token.is_empty()
    }

    pub fn is_control(&self) -> bool {
        self.topic == TOPIC_SUBSCRIBE || self.topic == TOPIC_UNSUBSCRIBE
    }

    /// Converts a `failure` envelope into [`Error::Remote`]; everything else passes through.
    pub fn into_result(self) -> Result<Message> {
        if self.topic == TOPIC_FAILURE {
            Err(Error::Remote(self.payload))
        } else {
            Ok(self)
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Message> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol(format!("malformed message: {e}")))
    }

    /// Serializes a set of replies into the aggregated multi-reply payload.
    pub fn serialize_batch(messages: &[Message]) -> Result<String> {
        Ok(serde_json::to_string(messages)?)
    }

    pub fn deserialize_batch(payload: &str) -> Result<Vec<Message>> {
        serde_json::from_str(payload)
            .map_err(|e| Error::protocol(format!("malformed reply batch: {e}")))
    }
}

/// Encodes a list of topic names as the payload of a subscribe/unsubscribe request.
pub fn encode_topics(topics: &[String]) -> Result<String> {
    Ok(serde_json::to_string(topics)?)
}

pub fn decode_topics(payload: &str) -> Result<Vec<String>> {
    serde_json::from_str(payload)
        .map_err(|e| Error::protocol(format!("expected a JSON array of topics: {e}")))
}

#[cfg(test)]
mod tests;
