//! CLI for Switchyard
//!
//! Subcommands:
//! - `broker`: serve the pub/sub broker
//! - `resolver`: serve the topic resolver

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use switchyard::admission::{AdmissionChain, IpRateLimiter};
use switchyard::broker::BrokerServer;
use switchyard::config::{Settings, TransportKind, load_config_from};
use switchyard::resolver::ResolverServer;
use switchyard::transport::tcp::TcpListener;
use switchyard::transport::websocket::WebsocketListener;
use switchyard::transport::SharedListener;
use switchyard::utils::logging;

/// How often idle rate-limiter buckets are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "switchyard")]
struct Cli {
    /// Configuration file, extension optional
    #[arg(long, short, default_value = "config/default", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pub/sub broker
    Broker,
    /// Start the topic resolver
    Resolver,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Broker => run_broker(settings).await,
        Command::Resolver => run_resolver(settings).await,
    };
    if let Err(e) = result {
        error!("Server failed: {}", e);
        std::process::exit(1);
    }
}

async fn bind(settings: &Settings) -> switchyard::Result<(SharedListener, Option<Arc<IpRateLimiter>>)> {
    let (admission, limiter) = AdmissionChain::from_settings(&settings.admission);
    let address = settings.server.bind_address();
    let listener: SharedListener = match settings.server.transport {
        TransportKind::Tcp => {
            Arc::new(TcpListener::bind(&address, settings.connection.clone(), admission).await?)
        }
        TransportKind::Websocket => Arc::new(
            WebsocketListener::bind(&address, settings.connection.clone(), admission).await?,
        ),
    };
    if let Some(limiter) = &limiter {
        limiter.spawn_pruner(PRUNE_INTERVAL, listener.stop_signal());
    }
    Ok((listener, limiter))
}

async fn run_broker(settings: Settings) -> switchyard::Result<()> {
    let (listener, _limiter) = bind(&settings).await?;
    let server = BrokerServer::with_settings(listener.clone(), &settings);
    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    server.stop().await?;
    listener.stop().await
}

async fn run_resolver(settings: Settings) -> switchyard::Result<()> {
    let (listener, _limiter) = bind(&settings).await?;
    let server = ResolverServer::with_settings(listener.clone(), &settings);
    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    server.stop().await?;
    listener.stop().await
}
