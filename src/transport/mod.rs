//! The `transport` module gives every transport the same message-oriented shape.
//!
//! A [`Connection`] moves whole messages (frames) in both directions with
//! per-operation timeouts, adjustable deadlines and an idempotent close. A
//! [`Listener`] produces connections through a cancellable `accept`.
//!
//! Three transports implement both traits:
//! - `tcp`: raw byte streams with a single-byte frame delimiter
//! - `websocket`: upgraded streams, one text message per frame
//! - `channel`: in-process channels, for embedding and tests

pub mod channel;
pub mod endpoint;
pub mod signal;
pub mod tcp;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::utils::error::Result;
use crate::utils::metrics::MetricsSnapshot;

pub use endpoint::{Connector, DialPolicy, Endpoint, NetworkConnector, SharedConnector};
pub use signal::{CloseSignal, Deadline};

/// Names of the per-connection counters.
pub(crate) const CONNECTION_COUNTERS: &[&str] = &[
    "bytes_sent",
    "bytes_received",
    "messages_sent",
    "messages_received",
];

/// Names of the per-listener counters.
pub(crate) const LISTENER_COUNTERS: &[&str] = &["connections_accepted", "connections_rejected"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Started,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Started => f.write_str("started"),
            Status::Stopped => f.write_str("stopped"),
        }
    }
}

/// A transport-agnostic duplex message channel.
///
/// Reads and writes are serialized independently, so a blocked read never
/// holds up a write and vice versa. Every blocking call returns
/// [`Error::Timeout`](crate::utils::Error::Timeout) when its deadline passes and
/// [`Error::ConnectionClosed`](crate::utils::Error::ConnectionClosed) once the
/// connection is closed.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Random identifier unique to this connection object.
    fn instance_id(&self) -> &str;

    /// Address of the remote peer.
    fn address(&self) -> &str;

    fn status(&self) -> Status;

    /// A signal that fires when the connection closes.
    fn close_signal(&self) -> CloseSignal;

    /// Reads the next frame. `None` waits without a timeout.
    async fn read(&self, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Writes one frame. `None` waits without a timeout.
    async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()>;

    /// Moves the deadline of the current (or next) read.
    fn set_read_deadline(&self, timeout: Option<Duration>);

    /// Moves the deadline of the current (or next) write.
    fn set_write_deadline(&self, timeout: Option<Duration>);

    /// Closes the connection. Returns `ConnectionClosed` if it was already closed.
    async fn close(&self) -> Result<()>;

    fn metrics(&self) -> MetricsSnapshot;
}

pub type SharedConnection = Arc<dyn Connection>;

/// Produces connections from one bound transport.
#[async_trait]
pub trait Listener: Send + Sync {
    fn instance_id(&self) -> &str;

    fn address(&self) -> String;

    fn status(&self) -> Status;

    /// A signal that fires when the listener stops.
    fn stop_signal(&self) -> CloseSignal;

    /// Waits for the next admitted connection.
    ///
    /// Races the listener's stop signal, the caller's timeout and the
    /// underlying accept, so it is cancellable on every transport.
    async fn accept(&self, timeout: Option<Duration>) -> Result<SharedConnection>;

    /// Stops the listener. Returns `NotStarted` if it was already stopped.
    async fn stop(&self) -> Result<()>;

    fn metrics(&self) -> MetricsSnapshot;
}

pub type SharedListener = Arc<dyn Listener>;

pub(crate) fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests;
