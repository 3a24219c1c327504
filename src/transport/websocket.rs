//! Websocket transport: one text message per frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config, connect_async_with_config};
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::WebSocketConfig;

use crate::admission::AdmissionChain;
use crate::config::ConnectionSettings;
use crate::transport::signal::{CloseSignal, Deadline, race};
use crate::transport::{
    CONNECTION_COUNTERS, Connection, LISTENER_COUNTERS, Listener, SharedConnection, Status,
    new_instance_id,
};
use crate::utils::error::{Error, Result};
use crate::utils::metrics::{Counters, MetricsSnapshot};

const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Upgrade time limit when no write timeout is configured.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn websocket_config(settings: &ConnectionSettings) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(settings.byte_limit())
        .max_frame_size(settings.byte_limit())
}

pub struct WebsocketConnection<S> {
    instance_id: String,
    address: String,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: CloseSignal,
    counters: Counters,
}

impl<S> std::fmt::Debug for WebsocketConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketConnection")
            .field("instance_id", &self.instance_id)
            .field("address", &self.address)
            .field("closed", &self.close.is_fired())
            .finish()
    }
}

impl<S> WebsocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: WebSocketStream<S>, address: impl Into<String>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            instance_id: new_instance_id(),
            address: address.into(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            close: CloseSignal::new(),
            counters: Counters::new(CONNECTION_COUNTERS),
        }
    }

    async fn next_text(&self) -> Result<String> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(WsMessage::Binary(_))) => {
                    return Err(Error::protocol("unexpected binary websocket frame"));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(Error::ConnectionClosed),
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn fail(&self, error: Error) -> Error {
        if error.is_terminal() && !self.close.is_fired() {
            debug!(connection = %self.instance_id, "closing after transport error: {error}");
            let _ = self.close().await;
        }
        error
    }
}

impl WebsocketConnection<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
    /// Dials a `ws://` url.
    pub async fn connect(url: &str, settings: &ConnectionSettings) -> Result<Self> {
        let (socket, _response) =
            connect_async_with_config(url, Some(websocket_config(settings)), true).await?;
        Ok(Self::new(socket, url))
    }
}

#[async_trait]
impl<S> Connection for WebsocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
        match self.read_deadline.run(&self.close, self.next_text()).await {
            Ok(text) => {
                self.counters.incr("messages_received");
                self.counters.add("bytes_received", text.len() as u64);
                Ok(text.into_bytes())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if self.close.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::protocol("websocket payload is not valid utf-8"))?;
        self.write_deadline.set(timeout);
        let result = self
            .write_deadline
            .run(&self.close, async {
                let mut sink = self.sink.lock().await;
                sink.send(WsMessage::text(text.to_owned())).await?;
                Ok(())
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
        let mut sink = self.sink.lock().await;
        if let Ok(Err(e)) = tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
            debug!(connection = %self.instance_id, "websocket close failed: {e}");
        }
        debug!(connection = %self.instance_id, address = %self.address, "websocket connection closed");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}

/// Accepts TCP peers, runs admission control, then performs the websocket upgrade.
///
/// Upgrades run as separate tasks bounded by a handshake timeout, so a peer
/// that never completes its handshake cannot hold back the peers behind it.
pub struct WebsocketListener {
    instance_id: String,
    address: String,
    listener: parking_lot::RwLock<Option<Arc<tokio::net::TcpListener>>>,
    settings: ConnectionSettings,
    admission: AdmissionChain,
    handshakes: Mutex<JoinSet<Result<SharedConnection>>>,
    stop: CloseSignal,
    counters: Counters,
}

impl WebsocketListener {
    pub async fn bind(
        address: &str,
        settings: ConnectionSettings,
        admission: AdmissionChain,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(address).await?;
        let address = listener.local_addr()?.to_string();
        debug!(address = %address, "websocket listener bound");
        Ok(Self {
            instance_id: new_instance_id(),
            address,
            listener: parking_lot::RwLock::new(Some(Arc::new(listener))),
            settings,
            admission,
            handshakes: Mutex::new(JoinSet::new()),
            stop: CloseSignal::new(),
            counters: Counters::new(LISTENER_COUNTERS),
        })
    }

    /// The url clients dial to reach this listener.
    pub fn url(&self) -> String {
        format!("ws://{}", self.address)
    }

    fn handshake_timeout(&self) -> Duration {
        self.settings.write_timeout().unwrap_or(HANDSHAKE_TIMEOUT)
    }
}

async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
    config: WebSocketConfig,
    limit: Duration,
) -> Result<SharedConnection> {
    let socket = tokio::time::timeout(limit, accept_async_with_config(stream, Some(config)))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::protocol(format!("websocket handshake failed: {e}")))?;
    Ok(Arc::new(WebsocketConnection::new(socket, peer.to_string())))
}

#[async_trait]
impl Listener for WebsocketListener {
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
        let listener = self
            .listener
            .read()
            .clone()
            .ok_or(Error::ConnectionClosed)?;

        race(&self.stop, timeout, async {
            let mut handshakes = self.handshakes.lock().await;
            loop {
                tokio::select! {
                    Some(joined) = handshakes.join_next(), if !handshakes.is_empty() => {
                        match joined {
                            Ok(Ok(connection)) => {
                                self.counters.incr("connections_accepted");
                                return Ok(connection);
                            }
                            Ok(Err(e)) => {
                                self.counters.incr("connections_rejected");
                                warn!(listener = %self.instance_id, "websocket handshake failed: {e}");
                            }
                            Err(e) => debug!(listener = %self.instance_id, "handshake task ended: {e}"),
                        }
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        if let Err(e) = self.admission.admit(&peer.to_string()) {
                            self.counters.incr("connections_rejected");
                            warn!(peer = %peer, "rejected websocket connection: {e}");
                            drop(stream);
                            return Err(e);
                        }
                        handshakes.spawn(handshake(
                            stream,
                            peer,
                            websocket_config(&self.settings),
                            self.handshake_timeout(),
                        ));
                    }
                }
            }
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        if !self.stop.fire() {
            return Err(Error::NotStarted);
        }
        self.listener.write().take();
        self.handshakes.lock().await.abort_all();
        debug!(address = %self.address, "websocket listener stopped");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}
