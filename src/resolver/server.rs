//! One-shot resolution service: one request, one response, then close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Settings;
use crate::message::Message;
use crate::resolver::registry::{Resolver, TopicClass};
use crate::routine::{AcceptRoutine, ConnectionHandler};
use crate::transport::{CloseSignal, Endpoint, SharedConnection, SharedListener, Status};
use crate::utils::commands::{self, CommandHandlers};
use crate::utils::error::{Error, Result};
use crate::utils::metrics::MetricsSnapshot;

pub struct ResolverServer {
    resolver: Arc<Resolver>,
    listener: SharedListener,
    accept: AcceptRoutine,
}

impl ResolverServer {
    pub fn new(listener: SharedListener, resolver: Arc<Resolver>, settings: &Settings) -> Self {
        let handler = Arc::new(ResolutionHandler {
            resolver: resolver.clone(),
            request_timeout: settings.resolver.request_timeout(),
            write_timeout: settings.connection.write_timeout(),
        });
        let accept = AcceptRoutine::new(listener.clone(), handler, settings.accepter.clone());
        Self {
            resolver,
            listener,
            accept,
        }
    }

    /// Convenience for a resolver seeded from `settings`.
    pub fn with_settings(listener: SharedListener, settings: &Settings) -> Self {
        Self::new(
            listener,
            Arc::new(Resolver::from_settings(&settings.resolver)),
            settings,
        )
    }

    pub fn start(&self) -> Result<()> {
        self.accept.start()?;
        info!(
            address = %self.listener.address(),
            async_topics = self.resolver.resolution_count(TopicClass::Async),
            sync_topics = self.resolver.resolution_count(TopicClass::Sync),
            "resolver started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.accept.stop().await?;
        info!(address = %self.listener.address(), "resolver stopped");
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.accept.status()
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn address(&self) -> String {
        self.listener.address()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut metrics = self.resolver.metrics();
        metrics.merge("listener", self.listener.metrics());
        metrics
    }

    /// `start`, `stop`, `status`, `metrics`,
    /// `add_async_resolution <topic> <endpoint>`, `add_sync_resolution <topic> <endpoint>`,
    /// `remove_async_resolution <topic>`, `remove_sync_resolution <topic>`.
    ///
    /// `<endpoint>` is either a JSON endpoint object or a bare address.
    pub fn commands(self: &Arc<Self>) -> CommandHandlers {
        let mut handlers = CommandHandlers::new();

        let server = self.clone();
        handlers.insert(
            "start".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move {
                    server.start()?;
                    Ok("success".to_string())
                }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "stop".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move {
                    server.stop().await?;
                    Ok("success".to_string())
                }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "status".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move { Ok(server.status().to_string()) }
            }),
        );

        let server = self.clone();
        handlers.insert(
            "metrics".to_string(),
            commands::handler(move |_args| {
                let server = server.clone();
                async move { Ok(serde_json::to_string(&server.metrics())?) }
            }),
        );

        for class in [TopicClass::Async, TopicClass::Sync] {
            let name = format!("add_{class}_resolution");
            let server = self.clone();
            let command = name.clone();
            handlers.insert(
                name,
                commands::handler(move |args| {
                    let server = server.clone();
                    let command = command.clone();
                    async move {
                        let (topic, endpoint) = match args.as_slice() {
                            [topic, endpoint] => (topic.clone(), parse_endpoint(endpoint)?),
                            _ => {
                                return Err(Error::protocol(format!(
                                    "{command} expects 2 arguments"
                                )));
                            }
                        };
                        server.resolver.add_resolution(class, topic, endpoint);
                        Ok("success".to_string())
                    }
                }),
            );

            let name = format!("remove_{class}_resolution");
            let server = self.clone();
            let command = name.clone();
            handlers.insert(
                name,
                commands::handler(move |args| {
                    let server = server.clone();
                    let command = command.clone();
                    async move {
                        let topic = commands::single_arg(&command, &args)?;
                        server.resolver.remove_resolution(class, &topic)?;
                        Ok("success".to_string())
                    }
                }),
            );
        }

        handlers
    }
}

fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    if raw.trim_start().starts_with('{') {
        Ok(serde_json::from_str(raw)?)
    } else {
        Ok(Endpoint::new(raw))
    }
}

struct ResolutionHandler {
    resolver: Arc<Resolver>,
    request_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl ResolutionHandler {
    async fn exchange(&self, connection: &SharedConnection) -> Result<()> {
        let data = connection.read(self.request_timeout).await?;
        let response = match Message::deserialize(&data) {
            Ok(request) => self.resolver.handle_request(&request),
            Err(e) => {
                self.resolver.record_failure();
                Message::failure("", e.to_string())
            }
        };
        connection
            .write(&response.serialize()?, self.write_timeout)
            .await
    }
}

#[async_trait]
impl ConnectionHandler for ResolutionHandler {
    async fn handle(&self, connection: SharedConnection, _stop: CloseSignal) -> Result<()> {
        let result = self.exchange(&connection).await;
        if let Err(e) = &result {
            debug!(connection = %connection.instance_id(), "resolution exchange failed: {e}");
        }
        // strictly one exchange per connection
        let _ = connection.close().await;
        result
    }
}
