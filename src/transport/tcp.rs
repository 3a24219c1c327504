//! TCP transport with single-byte frame delimiting.
//!
//! Wire format: payload bytes followed by [`DELIMITER`]. There is no length
//! prefix. A [`HEARTBEAT`] byte may appear anywhere on the stream and is
//! dropped by the decoder. Payloads therefore must not contain either byte;
//! `write` rejects such payloads instead of corrupting the stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};
use tracing::{debug, warn};

use crate::admission::AdmissionChain;
use crate::config::ConnectionSettings;
use crate::transport::signal::{CloseSignal, Deadline, race};
use crate::transport::{
    CONNECTION_COUNTERS, Connection, LISTENER_COUNTERS, Listener, SharedConnection, Status,
    new_instance_id,
};
use crate::utils::error::{Error, Result};
use crate::utils::metrics::{Counters, MetricsSnapshot};

/// Terminates a frame.
pub const DELIMITER: u8 = 0x04;
/// Keep-alive byte, never delivered as payload.
pub const HEARTBEAT: u8 = 0x05;

/// Upper bound on flushing and shutting down the write half during close.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Delimiter codec with heartbeat filtering and an optional payload limit.
///
/// Heartbeats are removed from the buffer as soon as they arrive, so the
/// buffered bytes never exceed the limit by more than one read. When a frame
/// outgrows the limit the decoder reports [`Error::FrameTooLarge`] once, then
/// silently discards the rest of that frame up to its delimiter. The
/// connection stays usable.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    limit: Option<usize>,
    /// Leading bytes of the buffer already stripped and scanned for a delimiter.
    scanned: usize,
    discarding: bool,
}

impl FrameCodec {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn over_limit(&self, payload_len: usize) -> Option<usize> {
        self.limit.filter(|limit| payload_len > *limit)
    }

    fn reset(&mut self) {
        self.scanned = 0;
    }

    /// Compacts heartbeat bytes out of the unscanned tail of `src`.
    fn strip_heartbeats(&self, src: &mut BytesMut) {
        let mut kept = self.scanned;
        for read in self.scanned..src.len() {
            let byte = src[read];
            if byte != HEARTBEAT {
                src[kept] = byte;
                kept += 1;
            }
        }
        src.truncate(kept);
    }
}

/// What the writer puts on the wire.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Payload(Bytes),
    Heartbeat,
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            self.strip_heartbeats(src);
            let end = src[self.scanned..]
                .iter()
                .position(|byte| *byte == DELIMITER)
                .map(|offset| self.scanned + offset);

            let Some(end) = end else {
                if self.discarding {
                    src.clear();
                    self.reset();
                    return Ok(None);
                }
                self.scanned = src.len();
                if let Some(limit) = self.over_limit(src.len()) {
                    src.clear();
                    self.reset();
                    self.discarding = true;
                    return Err(Error::FrameTooLarge { limit });
                }
                return Ok(None);
            };

            let mut payload = src.split_to(end + 1);
            self.reset();

            if self.discarding {
                // tail of a frame that was already reported as too large
                self.discarding = false;
                continue;
            }
            if let Some(limit) = self.over_limit(end) {
                return Err(Error::FrameTooLarge { limit });
            }

            payload.truncate(end);
            return Ok(Some(payload.freeze()));
        }
    }
}

impl Encoder<OutboundFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<()> {
        match item {
            OutboundFrame::Payload(payload) => {
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(&payload);
                dst.put_u8(DELIMITER);
            }
            OutboundFrame::Heartbeat => dst.put_u8(HEARTBEAT),
        }
        Ok(())
    }
}

/// Accumulates socket reads until the codec yields a frame.
struct FrameReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
    codec: FrameCodec,
    chunk: usize,
}

impl FrameReader {
    async fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }
            self.buffer.reserve(self.chunk);
            if self.half.read_buf(&mut self.buffer).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

type FrameWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>>;

pub struct TcpConnection {
    instance_id: String,
    address: String,
    reader: Mutex<FrameReader>,
    writer: FrameWriter,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: CloseSignal,
    counters: Counters,
    heartbeat: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("instance_id", &self.instance_id)
            .field("address", &self.address)
            .field("closed", &self.close.is_fired())
            .finish()
    }
}

impl TcpConnection {
    /// Wraps an established stream. Starts the heartbeat sender if configured.
    pub fn new(stream: TcpStream, settings: &ConnectionSettings) -> Result<Self> {
        let address = stream.peer_addr()?.to_string();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %address, "failed to set TCP_NODELAY: {e}");
        }
        let (read_half, write_half) = stream.into_split();

        let writer: FrameWriter = Arc::new(Mutex::new(FramedWrite::new(
            write_half,
            FrameCodec::new(settings.byte_limit()),
        )));
        let close = CloseSignal::new();
        let heartbeat = settings
            .heartbeat_interval()
            .map(|interval| spawn_heartbeat(writer.clone(), close.clone(), interval));

        Ok(Self {
            instance_id: new_instance_id(),
            address,
            reader: Mutex::new(FrameReader {
                half: read_half,
                buffer: BytesMut::with_capacity(settings.buffer_bytes),
                codec: FrameCodec::new(settings.byte_limit()),
                chunk: settings.buffer_bytes.max(1),
            }),
            writer,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
            close,
            counters: Counters::new(CONNECTION_COUNTERS),
            heartbeat: parking_lot::Mutex::new(heartbeat),
        })
    }

    pub async fn connect(address: &str, settings: &ConnectionSettings) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        Self::new(stream, settings)
    }

    async fn fail(&self, error: Error) -> Error {
        if error.is_terminal() && !self.close.is_fired() {
            debug!(connection = %self.instance_id, "closing after transport error: {error}");
            let _ = self.close().await;
        }
        error
    }
}

fn spawn_heartbeat(writer: FrameWriter, close: CloseSignal, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = close.fired() => break,
                _ = ticker.tick() => {
                    let mut writer = writer.lock().await;
                    if let Err(e) = writer.send(OutboundFrame::Heartbeat).await {
                        debug!("heartbeat failed: {e}");
                        break;
                    }
                }
            }
        }
    })
}

#[async_trait]
impl Connection for TcpConnection {
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
                let mut reader = self.reader.lock().await;
                reader.next_frame().await
            })
            .await;

        match result {
            Ok(frame) => {
                self.counters.incr("messages_received");
                self.counters.add("bytes_received", frame.len() as u64 + 1);
                Ok(frame.to_vec())
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if self.close.is_fired() {
            return Err(Error::ConnectionClosed);
        }
        if data.iter().any(|b| *b == DELIMITER || *b == HEARTBEAT) {
            return Err(Error::protocol("payload contains a reserved framing byte"));
        }
        self.write_deadline.set(timeout);
        let frame = OutboundFrame::Payload(Bytes::copy_from_slice(data));
        let result = self
            .write_deadline
            .run(&self.close, async {
                let mut writer = self.writer.lock().await;
                writer.send(frame).await
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.incr("messages_sent");
                self.counters.add("bytes_sent", data.len() as u64 + 1);
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
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
        let mut writer = self.writer.lock().await;
        let shutdown = async {
            let _ = writer.flush().await;
            writer.get_mut().shutdown().await
        };
        if let Ok(Err(e)) = tokio::time::timeout(CLOSE_GRACE, shutdown).await {
            debug!(connection = %self.instance_id, "shutdown failed: {e}");
        }
        debug!(connection = %self.instance_id, address = %self.address, "tcp connection closed");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}

/// Accepts TCP peers, running admission control before wrapping the stream.
pub struct TcpListener {
    instance_id: String,
    address: String,
    listener: parking_lot::RwLock<Option<Arc<tokio::net::TcpListener>>>,
    settings: ConnectionSettings,
    admission: AdmissionChain,
    stop: CloseSignal,
    counters: Counters,
}

impl TcpListener {
    pub async fn bind(
        address: &str,
        settings: ConnectionSettings,
        admission: AdmissionChain,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(address).await?;
        let address = listener.local_addr()?.to_string();
        debug!(address = %address, "tcp listener bound");
        Ok(Self {
            instance_id: new_instance_id(),
            address,
            listener: parking_lot::RwLock::new(Some(Arc::new(listener))),
            settings,
            admission,
            stop: CloseSignal::new(),
            counters: Counters::new(LISTENER_COUNTERS),
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
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
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = self.admission.admit(&peer.to_string()) {
                self.counters.incr("connections_rejected");
                warn!(peer = %peer, "rejected tcp connection: {e}");
                drop(stream);
                return Err(e);
            }
            let connection = TcpConnection::new(stream, &self.settings)?;
            self.counters.incr("connections_accepted");
            Ok(Arc::new(connection) as SharedConnection)
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        if !self.stop.fire() {
            return Err(Error::NotStarted);
        }
        self.listener.write().take();
        debug!(address = %self.address, "tcp listener stopped");
        Ok(())
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.counters.snapshot()
    }
}
