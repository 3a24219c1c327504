use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::transport::Endpoint;

/// Converts a millisecond setting into an optional duration, `0` meaning "none".
pub fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Top-level configuration settings for the application.
///
/// Includes settings for the server socket, connections, the accept routine,
/// admission control, the broker and the resolver.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub connection: ConnectionSettings,
    pub accepter: AccepterSettings,
    pub admission: AdmissionSettings,
    pub broker: BrokerSettings,
    pub resolver: ResolverSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Websocket,
}

/// Configuration settings for the server.
///
/// Defines the host and port the server will bind to and the transport it speaks.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-connection framing and timeout parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    /// Size of each socket read.
    pub buffer_bytes: usize,
    /// Largest accepted frame payload; `0` disables the limit.
    pub incoming_message_byte_limit: usize,
    /// Interval of the TCP heartbeat byte; `0` disables heartbeats.
    pub heartbeat_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl ConnectionSettings {
    pub fn byte_limit(&self) -> Option<usize> {
        (self.incoming_message_byte_limit > 0).then_some(self.incoming_message_byte_limit)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        millis(self.heartbeat_interval_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        millis(self.write_timeout_ms)
    }
}

/// Behaviour of the background accept routine.
#[derive(Debug, Deserialize, Clone)]
pub struct AccepterSettings {
    pub handle_concurrently: bool,
    /// Force-close accepted connections after this long; `0` means never.
    pub connection_lifetime_ms: u64,
    pub accept_timeout_ms: u64,
    /// Abort in-flight handlers on stop instead of waiting for them.
    pub abort_ongoing_on_stop: bool,
}

impl AccepterSettings {
    pub fn connection_lifetime(&self) -> Option<Duration> {
        millis(self.connection_lifetime_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        millis(self.accept_timeout_ms)
    }
}

/// Pre-acceptance checks on inbound connections.
#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionSettings {
    /// Token bucket size per source IP; `0` disables rate limiting.
    pub rate_limit_capacity: u32,
    pub rate_limit_refill_per_sec: f64,
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Topics declared at startup. Subscribing to anything else fails.
    pub topics: Vec<String>,
    pub propagate_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub max_active_requests: usize,
    pub handle_reads_concurrently: bool,
}

impl BrokerSettings {
    pub fn propagate_timeout(&self) -> Option<Duration> {
        millis(self.propagate_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        millis(self.sync_timeout_ms)
    }
}

/// Configuration settings for the topic resolver.
#[derive(Debug, Deserialize, Clone)]
pub struct ResolverSettings {
    pub async_resolutions: HashMap<String, Endpoint>,
    pub sync_resolutions: HashMap<String, Endpoint>,
    pub request_timeout_ms: u64,
}

impl ResolverSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional. Missing values are filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub connection: Option<PartialConnectionSettings>,
    pub accepter: Option<PartialAccepterSettings>,
    pub admission: Option<PartialAdmissionSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub resolver: Option<PartialResolverSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport: Option<TransportKind>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectionSettings {
    pub buffer_bytes: Option<usize>,
    pub incoming_message_byte_limit: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAccepterSettings {
    pub handle_concurrently: Option<bool>,
    pub connection_lifetime_ms: Option<u64>,
    pub accept_timeout_ms: Option<u64>,
    pub abort_ongoing_on_stop: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAdmissionSettings {
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_per_sec: Option<f64>,
    pub blacklist: Option<Vec<String>>,
    pub whitelist: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub topics: Option<Vec<String>>,
    pub propagate_timeout_ms: Option<u64>,
    pub sync_timeout_ms: Option<u64>,
    pub max_active_requests: Option<usize>,
    pub handle_reads_concurrently: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialResolverSettings {
    pub async_resolutions: Option<HashMap<String, Endpoint>>,
    pub sync_resolutions: Option<HashMap<String, Endpoint>>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fills every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let Settings {
            server,
            connection,
            accepter,
            admission,
            broker,
            resolver,
            logging,
        } = default;

        Settings {
            server: match self.server {
                Some(p) => ServerSettings {
                    host: p.host.unwrap_or(server.host),
                    port: p.port.unwrap_or(server.port),
                    transport: p.transport.unwrap_or(server.transport),
                },
                None => server,
            },
            connection: match self.connection {
                Some(p) => ConnectionSettings {
                    buffer_bytes: p.buffer_bytes.unwrap_or(connection.buffer_bytes),
                    incoming_message_byte_limit: p
                        .incoming_message_byte_limit
                        .unwrap_or(connection.incoming_message_byte_limit),
                    heartbeat_interval_ms: p
                        .heartbeat_interval_ms
                        .unwrap_or(connection.heartbeat_interval_ms),
                    read_timeout_ms: p.read_timeout_ms.unwrap_or(connection.read_timeout_ms),
                    write_timeout_ms: p.write_timeout_ms.unwrap_or(connection.write_timeout_ms),
                },
                None => connection,
            },
            accepter: match self.accepter {
                Some(p) => AccepterSettings {
                    handle_concurrently: p
                        .handle_concurrently
                        .unwrap_or(accepter.handle_concurrently),
                    connection_lifetime_ms: p
                        .connection_lifetime_ms
                        .unwrap_or(accepter.connection_lifetime_ms),
                    accept_timeout_ms: p.accept_timeout_ms.unwrap_or(accepter.accept_timeout_ms),
                    abort_ongoing_on_stop: p
                        .abort_ongoing_on_stop
                        .unwrap_or(accepter.abort_ongoing_on_stop),
                },
                None => accepter,
            },
            admission: match self.admission {
                Some(p) => AdmissionSettings {
                    rate_limit_capacity: p
                        .rate_limit_capacity
                        .unwrap_or(admission.rate_limit_capacity),
                    rate_limit_refill_per_sec: p
                        .rate_limit_refill_per_sec
                        .unwrap_or(admission.rate_limit_refill_per_sec),
                    blacklist: p.blacklist.unwrap_or(admission.blacklist),
                    whitelist: p.whitelist.unwrap_or(admission.whitelist),
                },
                None => admission,
            },
            broker: match self.broker {
                Some(p) => BrokerSettings {
                    topics: p.topics.unwrap_or(broker.topics),
                    propagate_timeout_ms: p
                        .propagate_timeout_ms
                        .unwrap_or(broker.propagate_timeout_ms),
                    sync_timeout_ms: p.sync_timeout_ms.unwrap_or(broker.sync_timeout_ms),
                    max_active_requests: p
                        .max_active_requests
                        .unwrap_or(broker.max_active_requests),
                    handle_reads_concurrently: p
                        .handle_reads_concurrently
                        .unwrap_or(broker.handle_reads_concurrently),
                },
                None => broker,
            },
            resolver: match self.resolver {
                Some(p) => ResolverSettings {
                    async_resolutions: p.async_resolutions.unwrap_or(resolver.async_resolutions),
                    sync_resolutions: p.sync_resolutions.unwrap_or(resolver.sync_resolutions),
                    request_timeout_ms: p
                        .request_timeout_ms
                        .unwrap_or(resolver.request_timeout_ms),
                },
                None => resolver,
            },
            logging: match self.logging {
                Some(p) => LoggingSettings {
                    level: p.level.unwrap_or(logging.level),
                },
                None => logging,
            },
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            buffer_bytes: 4096,
            incoming_message_byte_limit: 0,
            heartbeat_interval_ms: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for AccepterSettings {
    fn default() -> Self {
        Self {
            handle_concurrently: true,
            connection_lifetime_ms: 0,
            accept_timeout_ms: 0,
            abort_ongoing_on_stop: true,
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 0,
            rate_limit_refill_per_sec: 1.0,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            propagate_timeout_ms: 5000,
            sync_timeout_ms: 10_000,
            max_active_requests: 0,
            handle_reads_concurrently: true,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            async_resolutions: HashMap::new(),
            sync_resolutions: HashMap::new(),
            request_timeout_ms: 5000,
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                transport: TransportKind::Tcp,
            },
            connection: ConnectionSettings::default(),
            accepter: AccepterSettings::default(),
            admission: AdmissionSettings::default(),
            broker: BrokerSettings::default(),
            resolver: ResolverSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
