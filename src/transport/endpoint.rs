//! Addresses of dialable services and the dialing machinery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::transport::SharedConnection;
use crate::transport::tcp::TcpConnection;
use crate::transport::websocket::WebsocketConnection;
use crate::utils::error::{Error, Result};

/// Where a broker (or resolver) can be reached.
///
/// Addresses starting with `ws://` or `wss://` are dialed as websockets,
/// everything else as plain TCP `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls_certificate: None,
            domain: None,
        }
    }

    pub fn with_tls_certificate(mut self, certificate: impl Into<String>) -> Self {
        self.tls_certificate = Some(certificate.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn is_websocket(&self) -> bool {
        self.address.starts_with("ws://") || self.address.starts_with("wss://")
    }

    /// Dials this endpoint over TCP or websocket, retrying per `policy`.
    pub async fn dial(
        &self,
        settings: &ConnectionSettings,
        policy: DialPolicy,
    ) -> Result<SharedConnection> {
        NetworkConnector::new(settings.clone(), policy)
            .connect(self)
            .await
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// How many times to dial and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct DialPolicy {
    /// Total attempts; `0` keeps retrying forever.
    pub attempts: u32,
    pub retry_interval: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            retry_interval: Duration::from_millis(500),
        }
    }
}

impl DialPolicy {
    pub fn new(attempts: u32, retry_interval: Duration) -> Self {
        Self {
            attempts,
            retry_interval,
        }
    }

    /// Runs `dial` until it succeeds or the attempts run out, returning the last error.
    pub async fn retry<F, Fut, T>(&self, mut dial: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match dial().await {
                Ok(value) => return Ok(value),
                Err(e) if self.attempts != 0 && attempt >= self.attempts => return Err(e),
                Err(e) => {
                    debug!(attempt, "dial failed, retrying: {e}");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<SharedConnection>;
}

pub type SharedConnector = Arc<dyn Connector>;

/// Dials TCP and websocket endpoints.
///
/// TLS material on the endpoint is carried for the caller but not applied here.
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    settings: ConnectionSettings,
    policy: DialPolicy,
}

impl NetworkConnector {
    pub fn new(settings: ConnectionSettings, policy: DialPolicy) -> Self {
        Self { settings, policy }
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<SharedConnection> {
        if endpoint.tls_certificate.is_some() {
            warn!(endpoint = %endpoint, "tls certificate configured but not applied");
        }
        self.policy
            .retry(|| async {
                let connection: SharedConnection = if endpoint.is_websocket() {
                    Arc::new(WebsocketConnection::connect(&endpoint.address, &self.settings).await?)
                } else {
                    Arc::new(TcpConnection::connect(&endpoint.address, &self.settings).await?)
                };
                Ok(connection)
            })
            .await
            .map_err(|e| match e {
                Error::Io(io) => Error::Io(std::io::Error::new(
                    io.kind(),
                    format!("failed to dial {endpoint}: {io}"),
                )),
                other => other,
            })
    }
}
