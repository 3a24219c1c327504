//! In-process transport over bounded tokio channels.
//!
//! Channels have no deadlines of their own, so every operation is raced against
//! the connection's [`Deadline`] and close signal. Dropping or closing one side
//! closes the other side once its buffered messages are drained.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::admission::AdmissionChain;
use crate::transport::endpoint::{Connector, Endpoint};
use crate::transport::signal::{CloseSignal, Deadline, race};
use crate::transport::{
    CONNECTION_COUNTERS, Connection, LISTENER_COUNTERS, Listener, SharedConnection, Status,
    new_instance_id,
};
use crate::utils::error::{Error, Result};
use crate::utils::metrics::{Counters, MetricsSnapshot};

/// Frames buffered per direction before a write blocks.
pub const CHANNEL_CAPACITY: usize = 64;

pub struct ChannelConnection {
    instance_id: String,
    address: String,
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    receiver: Mutex<mpsc::Receiver<Vec<u8>>>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: CloseSignal,
    counters: Counters,
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("instance_id", &self.instance_id)
            .field("address", &self.address)
            .field("closed", &self.close.is_fired())
            .finish()
    }
}

impl ChannelConnection {
    /// Creates two connected ends. `a` reports `b_address` as its peer and vice versa.
    pub fn pair(a_address: &str, b_address: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self::new(b_address, a_tx, a_rx),
            Self::new(a_address, b_tx, b_rx),
        )
    }

    fn new(peer: &str, sender: mpsc::Sender<Vec<u8>>, receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            instance_id: new_instance_id(),
            address: peer.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            close: CloseSignal::new(),
            counters: Counters::new(CONNECTION_COUNTERS),
        }
    }

    async fn fail(&self, error: Error) -> Error {
        if error.is_terminal() && !self.close.is_fired() {
            let _ = self.close().await;
        }
        error
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn status(&self) -> Status {
        if self.close.is_fired() {
            Status::Stopped
        } else {
            Status::Started
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    async fn read(&self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.close.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        self.read_deadline.set(timeout);
        let result = self
            .read_deadline
            .run(&self.close, async {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await.ok_or(Error::ConnectionClosed)
            })
            .await;

        match result {
            Ok(data) => {
                self.counters.incr("messages_received");
                self.counters.add("bytes_received", data.len() as u64);
                Ok(data)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if self.close.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        self.write_deadline.set(timeout);
        let result = self
            .write_deadline
            .run(&self.close, async {
                let sender = self.sender.lock().await;
                let sender = sender.as_ref().ok_or(Error::ConnectionClosed)?;
                sender
                    .send(data.to_vec())
                    .await
                    .map_err(|_| Error::ConnectionClosed)
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.incr("messages_sent");
                self.counters.add("bytes_sent", data.len() as u64);
                Ok(())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    fn set_read_deadline(&self, timeout: Option<Duration>) {
        self.read_deadline.set(timeout);
    }

    fn set_write_deadline(&self, timeout: Option<Duration>) {
        self.write_deadline.set(timeout);
    }

    async fn close(&self) -> Result<()> {
        if !self.close.fire() {
            return Err(Error::ConnectionClosed);
        }
        // blocked operations saw the signal and released their locks
        self.sender.lock().await.take();
        self.receiver.lock().await.close();
        debug!(connection = %self.instance_id, address = %self.address, "channel connection closed");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}

/// A dial attempt travelling to a [`ChannelListener`].
#[derive(Debug)]
pub struct ConnectRequest {
    source: String,
    reply: oneshot::Sender<Result<ChannelConnection>>,
}

/// Listener end of an in-process transport.
pub struct ChannelListener {
    instance_id: String,
    address: String,
    requests: Mutex<mpsc::Receiver<ConnectRequest>>,
    admission: AdmissionChain,
    stop: CloseSignal,
    counters: Counters,
}

impl ChannelListener {
    /// Creates a listener named `address` and the dialer that reaches it.
    pub fn new(address: impl Into<String>, admission: AdmissionChain) -> (Self, ChannelDialer) {
        let address = address.into();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let listener = Self {
            instance_id: new_instance_id(),
            address: address.clone(),
            requests: Mutex::new(rx),
            admission,
            stop: CloseSignal::new(),
            counters: Counters::new(LISTENER_COUNTERS),
        };
        (listener, ChannelDialer { address, requests: tx })
    }
}

#[async_trait]
impl Listener for ChannelListener {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn status(&self) -> Status {
        if self.stop.is_fired() {
            Status::Stopped
        } else {
            Status::Started
        }
    }

    fn stop_signal(&self) -> CloseSignal {
        self.stop.clone()
    }

    async fn accept(&self, timeout: Option<Duration>) -> Result<SharedConnection> {
        race(&self.stop, timeout, async {
            let mut requests = self.requests.lock().await;
            loop {
                let request = requests.recv().await.ok_or(Error::ConnectionClosed)?;
                if let Err(e) = self.admission.admit(&request.source) {
                    self.counters.incr("connections_rejected");
                    warn!(source = %request.source, "rejected channel connection: {e}");
                    let _ = request.reply.send(Err(e));
                    continue;
                }
                let (local, remote) = ChannelConnection::pair(&self.address, &request.source);
                if request.reply.send(Ok(remote)).is_err() {
                    // the dialer gave up before the connection was handed over
                    continue;
                }
                self.counters.incr("connections_accepted");
                return Ok(Arc::new(local) as SharedConnection);
            }
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        if !self.stop.fire() {
            return Err(Error::NotStarted);
        }
        self.requests.lock().await.close();
        debug!(address = %self.address, "channel listener stopped");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}

/// Dials one [`ChannelListener`].
#[derive(Debug, Clone)]
pub struct ChannelDialer {
    address: String,
    requests: mpsc::Sender<ConnectRequest>,
}

impl ChannelDialer {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connects as `source`, the name the listener sees as the peer address.
    pub async fn connect(
        &self,
        source: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<ChannelConnection> {
        let (reply, response) = oneshot::channel();
        let request = ConnectRequest {
            source: source.into(),
            reply,
        };
        let exchange = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| Error::ConnectionClosed)?;
            response.await.map_err(|_| Error::ConnectionClosed)?
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| Error::Timeout)?,
            None => exchange.await,
        }
    }
}

/// Routes [`Endpoint`] addresses to in-process listeners.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    dialers: parking_lot::RwLock<HashMap<String, ChannelDialer>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dialer: ChannelDialer) {
        self.dialers
            .write()
            .insert(dialer.address().to_string(), dialer);
    }

    pub fn unregister(&self, address: &str) -> bool {
        self.dialers.write().remove(address).is_some()
    }
}

#[async_trait]
impl Connector for ChannelRegistry {
    async fn connect(&self, endpoint: &Endpoint) -> Result<SharedConnection> {
        let dialer = self.dialers.read().get(&endpoint.address).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no channel listener at {endpoint}"),
            ))
        })?;
        let source = format!("channel:{}", new_instance_id());
        let connection = dialer.connect(source, None).await?;
        Ok(Arc::new(connection))
    }
}
