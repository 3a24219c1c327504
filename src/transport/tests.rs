use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, Encoder};

use super::channel::{ChannelConnection, ChannelListener, ChannelRegistry};
use super::endpoint::{Connector, DialPolicy, Endpoint};
use super::tcp::{DELIMITER, FrameCodec, HEARTBEAT, OutboundFrame, TcpConnection, TcpListener};
use super::websocket::{WebsocketConnection, WebsocketListener};
use super::{CloseSignal, Connection, Listener, Status};
use crate::admission::{AccessList, AdmissionChain};
use crate::config::ConnectionSettings;
use crate::utils::error::Error;

fn settings() -> ConnectionSettings {
    ConnectionSettings::default()
}

#[test]
fn test_codec_strips_heartbeats() {
    let mut codec = FrameCodec::new(None);
    let mut buf = BytesMut::from(&[HEARTBEAT, b'h', b'i', HEARTBEAT, b'!', DELIMITER, b'x'][..]);

    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"hi!");
    assert!(codec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&[b'y', DELIMITER]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"xy");
}

#[test]
fn test_codec_limit_reports_once_then_recovers() {
    let mut codec = FrameCodec::new(Some(4));
    let mut buf = BytesMut::from(&b"abcdef"[..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(Error::FrameTooLarge { limit: 4 })
    ));

    // rest of the oversized frame is discarded silently
    buf.extend_from_slice(&[b'g', b'h', DELIMITER, b'o', b'k', DELIMITER]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"ok");
}

#[test]
fn test_codec_limit_ignores_heartbeats() {
    let mut codec = FrameCodec::new(Some(2));
    let mut buf = BytesMut::from(&[HEARTBEAT, HEARTBEAT, HEARTBEAT, b'a', b'b', DELIMITER][..]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"ab");
}

#[test]
fn test_codec_heartbeat_stream_does_not_grow_buffer() {
    let mut codec = FrameCodec::new(Some(8));
    let mut buf = BytesMut::new();
    for _ in 0..100 {
        buf.extend_from_slice(&[HEARTBEAT; 10_000]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    buf.extend_from_slice(&[b'o', HEARTBEAT, b'k', DELIMITER]);
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"ok");
}

#[test]
fn test_codec_rejects_complete_oversized_frame() {
    let mut codec = FrameCodec::new(Some(2));
    let mut buf = BytesMut::from(&[b'a', b'b', b'c', DELIMITER, b'd', DELIMITER][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(Error::FrameTooLarge { .. })
    ));
    let frame = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(&frame[..], b"d");
}

#[test]
fn test_codec_encodes_delimiter_and_heartbeat() {
    let mut codec = FrameCodec::new(None);
    let mut dst = BytesMut::new();
    codec
        .encode(OutboundFrame::Payload(bytes::Bytes::from_static(b"ab")), &mut dst)
        .unwrap();
    codec.encode(OutboundFrame::Heartbeat, &mut dst).unwrap();
    assert_eq!(&dst[..], &[b'a', b'b', DELIMITER, HEARTBEAT]);
}

async fn tcp_pair(settings: ConnectionSettings) -> (Arc<dyn Connection>, TcpConnection) {
    let listener = TcpListener::bind("127.0.0.1:0", settings.clone(), AdmissionChain::new())
        .await
        .unwrap();
    let address = listener.address();
    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        TcpConnection::connect(&address, &settings)
    );
    (accepted.unwrap(), dialed.unwrap())
}

#[tokio::test]
async fn test_tcp_round_trip_with_heartbeats() {
    let mut settings = settings();
    settings.heartbeat_interval_ms = 1;
    let (server, client) = tcp_pair(settings).await;

    for i in 0..20 {
        let payload = format!("{{\"n\":{i}}}");
        client.write(payload.as_bytes(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let read = server.read(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(read, payload.as_bytes());
    }

    let metrics = client.metrics();
    assert_eq!(metrics.get("messages_sent"), 20);
    assert_eq!(server.metrics().get("messages_received"), 20);
}

#[tokio::test]
async fn test_tcp_write_rejects_reserved_bytes() {
    let (_server, client) = tcp_pair(settings()).await;
    let result = client.write(&[b'a', DELIMITER, b'b'], None).await;
    assert!(matches!(result, Err(Error::Protocol(_))));
    // the connection survives the rejected write
    assert_eq!(client.status(), Status::Started);
    client.write(b"fine", None).await.unwrap();
}

#[tokio::test]
async fn test_tcp_read_timeout_keeps_connection() {
    let (server, client) = tcp_pair(settings()).await;
    let result = server.read(Some(Duration::from_millis(20))).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(server.status(), Status::Started);

    client.write(b"late", None).await.unwrap();
    assert_eq!(server.read(Some(Duration::from_secs(5))).await.unwrap(), b"late");
}

#[tokio::test]
async fn test_tcp_oversized_frame_is_reported() {
    let mut limited = settings();
    limited.incoming_message_byte_limit = 8;
    let listener = TcpListener::bind("127.0.0.1:0", limited, AdmissionChain::new())
        .await
        .unwrap();
    let address = listener.address();
    let (accepted, raw) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        tokio::net::TcpStream::connect(&address)
    );
    let server = accepted.unwrap();
    let mut raw = raw.unwrap();

    raw.write_all(b"0123456789abcdef\x04small\x04").await.unwrap();
    let result = server.read(Some(Duration::from_secs(5))).await;
    assert!(matches!(result, Err(Error::FrameTooLarge { limit: 8 })));
    assert_eq!(server.read(Some(Duration::from_secs(5))).await.unwrap(), b"small");
}

#[tokio::test]
async fn test_tcp_peer_close_is_terminal() {
    let (server, client) = tcp_pair(settings()).await;
    client.close().await.unwrap();
    assert!(matches!(client.close().await, Err(Error::ConnectionClosed)));

    let result = server.read(Some(Duration::from_secs(5))).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert_eq!(server.status(), Status::Stopped);
}

#[tokio::test]
async fn test_close_unblocks_pending_read() {
    let (server, _client) = tcp_pair(settings()).await;
    let closer = server.clone();
    let handle = tokio::spawn(async move { closer.read(None).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let signal = server.close_signal();
    server.close().await.unwrap();
    assert!(signal.is_fired());
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_deadline_shortens_inflight_read() {
    let (server, _client) = tcp_pair(settings()).await;
    let reader = server.clone();
    let handle = tokio::spawn(async move { reader.read(Some(Duration::from_secs(60))).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.set_read_deadline(Some(Duration::from_millis(1)));
    let result = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_tcp_listener_admission_rejects() {
    let chain = AdmissionChain::new().with(Arc::new(AccessList::blacklist(vec![
        "127.0.0.1".to_string(),
    ])));
    let listener = TcpListener::bind("127.0.0.1:0", settings(), chain)
        .await
        .unwrap();
    let address = listener.address();

    let (accepted, _raw) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        tokio::net::TcpStream::connect(&address)
    );
    assert!(matches!(accepted, Err(Error::AdmissionRejected(_))));
    let metrics = listener.metrics();
    assert_eq!(metrics.get("connections_rejected"), 1);
    assert_eq!(metrics.get("connections_accepted"), 0);
}

#[tokio::test]
async fn test_listener_accept_timeout_and_stop() {
    let listener = TcpListener::bind("127.0.0.1:0", settings(), AdmissionChain::new())
        .await
        .unwrap();
    let result = listener.accept(Some(Duration::from_millis(10))).await;
    assert!(matches!(result, Err(Error::Timeout)));

    listener.stop().await.unwrap();
    assert_eq!(listener.status(), Status::Stopped);
    assert!(matches!(listener.stop().await, Err(Error::NotStarted)));
    assert!(matches!(
        listener.accept(None).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let listener = WebsocketListener::bind("127.0.0.1:0", settings(), AdmissionChain::new())
        .await
        .unwrap();
    let url = listener.url();
    let settings = settings();
    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        WebsocketConnection::connect(&url, &settings)
    );
    let server = accepted.unwrap();
    let client = dialed.unwrap();

    client.write(b"{\"topic\":\"orders\"}", None).await.unwrap();
    let read = server.read(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(read, b"{\"topic\":\"orders\"}");

    server.write(b"pong", None).await.unwrap();
    assert_eq!(client.read(Some(Duration::from_secs(5))).await.unwrap(), b"pong");

    client.close().await.unwrap();
    let result = server.read(Some(Duration::from_secs(5))).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_websocket_idle_peer_does_not_block_accept() {
    let listener = WebsocketListener::bind("127.0.0.1:0", settings(), AdmissionChain::new())
        .await
        .unwrap();
    let url = listener.url();
    // connects but never sends the upgrade request
    let _idle = tokio::net::TcpStream::connect(listener.address()).await.unwrap();

    let settings = settings();
    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_secs(2))),
        WebsocketConnection::connect(&url, &settings)
    );
    let server = accepted.unwrap();
    let client = dialed.unwrap();
    client.write(b"hello", None).await.unwrap();
    assert_eq!(server.read(Some(Duration::from_secs(2))).await.unwrap(), b"hello");
    assert_eq!(listener.metrics().get("connections_accepted"), 1);
}

#[tokio::test]
async fn test_websocket_stalled_handshake_is_rejected() {
    let mut settings = settings();
    settings.write_timeout_ms = 100;
    let listener = WebsocketListener::bind("127.0.0.1:0", settings, AdmissionChain::new())
        .await
        .unwrap();
    let _idle = tokio::net::TcpStream::connect(listener.address()).await.unwrap();

    let result = listener.accept(Some(Duration::from_millis(500))).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(listener.metrics().get("connections_rejected"), 1);
    assert_eq!(listener.metrics().get("connections_accepted"), 0);
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_channel_pair_round_trip_and_close() {
    let (a, b) = ChannelConnection::pair("channel:a", "channel:b");
    assert_eq!(a.address(), "channel:b");
    assert_eq!(b.address(), "channel:a");

    a.write(b"one", None).await.unwrap();
    a.write(b"two", None).await.unwrap();
    a.close().await.unwrap();

    // buffered frames are still delivered after the peer closed
    assert_eq!(b.read(None).await.unwrap(), b"one");
    assert_eq!(b.read(None).await.unwrap(), b"two");
    assert!(matches!(b.read(None).await, Err(Error::ConnectionClosed)));
    assert_eq!(b.status(), Status::Stopped);
}

#[tokio::test]
async fn test_channel_read_timeout() {
    let (a, _b) = ChannelConnection::pair("channel:a", "channel:b");
    let result = a.read(Some(Duration::from_millis(10))).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(a.status(), Status::Started);
}

#[tokio::test]
async fn test_channel_listener_and_registry() {
    let (listener, dialer) = ChannelListener::new("channel:broker", AdmissionChain::new());
    let registry = ChannelRegistry::new();
    registry.register(dialer);

    let endpoint = Endpoint::new("channel:broker");
    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        registry.connect(&endpoint)
    );
    let server = accepted.unwrap();
    let client = dialed.unwrap();
    assert_eq!(client.address(), "channel:broker");
    assert!(server.address().starts_with("channel:"));

    client.write(b"hello", None).await.unwrap();
    assert_eq!(server.read(None).await.unwrap(), b"hello");

    assert!(
        registry
            .connect(&Endpoint::new("channel:nowhere"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_channel_listener_admission() {
    let chain = AdmissionChain::new().with(Arc::new(AccessList::blacklist(vec![
        "channel:bad".to_string(),
    ])));
    let (listener, dialer) = ChannelListener::new("channel:broker", chain);

    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_millis(100))),
        dialer.connect("channel:bad", None)
    );
    assert!(matches!(dialed, Err(Error::AdmissionRejected(_))));
    assert!(matches!(accepted, Err(Error::Timeout)));
    assert_eq!(listener.metrics().get("connections_rejected"), 1);
}

#[tokio::test]
async fn test_dial_policy_retries_until_exhausted() {
    let policy = DialPolicy::new(3, Duration::from_millis(1));
    let mut attempts = 0;
    let result: crate::utils::error::Result<()> = policy
        .retry(|| {
            attempts += 1;
            async { Err(Error::Timeout) }
        })
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn test_endpoint_dial_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0", settings(), AdmissionChain::new())
        .await
        .unwrap();
    let endpoint = Endpoint::new(listener.address()).with_domain("broker.local");
    assert!(!endpoint.is_websocket());

    let settings = settings();
    let (accepted, dialed) = tokio::join!(
        listener.accept(Some(Duration::from_secs(5))),
        endpoint.dial(&settings, DialPolicy::default())
    );
    let server = accepted.unwrap();
    dialed.unwrap().write(b"x", None).await.unwrap();
    assert_eq!(server.read(Some(Duration::from_secs(5))).await.unwrap(), b"x");
}

#[test]
fn test_endpoint_serde_skips_missing_fields() {
    let endpoint = Endpoint::new("127.0.0.1:7001");
    let json = serde_json::to_string(&endpoint).unwrap();
    assert_eq!(json, r#"{"address":"127.0.0.1:7001"}"#);
    assert!(Endpoint::new("ws://host:1").is_websocket());
}

#[tokio::test]
async fn test_close_signal_fires_once() {
    let signal = CloseSignal::new();
    let waiter = signal.clone();
    let handle = tokio::spawn(async move { waiter.fired().await });
    assert!(signal.fire());
    assert!(!signal.fire());
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
