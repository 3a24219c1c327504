//! The `error` module defines the error taxonomy shared by every layer of `switchyard`.
//!
//! Transport, routing, resolution and admission failures all funnel into one
//! [`Error`] enum so that callers can match on the failure class without caring
//! which transport produced it.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The connection (or listener) has been closed. Terminal for that object.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation did not complete before its deadline. The connection stays usable.
    #[error("operation timed out")]
    Timeout,

    /// Malformed frame, unexpected topic or frame type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A TCP frame grew past the configured byte limit before its delimiter arrived.
    #[error("incoming frame exceeded the byte limit of {limit}")]
    FrameTooLarge { limit: usize },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Rejected by an admission handler before the connection was established.
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("sync token already in flight: {0}")]
    TokenCollision(String),

    #[error("invalid sync token: {0}")]
    InvalidToken(String),

    #[error("too many active requests")]
    TooManyRequests,

    /// A synchronous request produced zero replies.
    #[error("no responses")]
    NoResponses,

    /// The peer answered with a failure envelope.
    #[error("remote failure: {0}")]
    Remote(String),

    #[error("already started")]
    AlreadyStarted,

    #[error("not started")]
    NotStarted,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether the failure leaves the underlying connection unusable.
    ///
    /// Read routines keep reading after non-terminal errors (timeouts, bad frames)
    /// and stop after terminal ones.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::Io(_) | Error::WebSocket(_)
        )
    }
}
