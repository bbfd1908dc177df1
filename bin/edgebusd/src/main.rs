//! ---
//! eb_section: "04-daemon"
//! eb_subsection: "binary"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Binary entrypoint for the EdgeBus daemon."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgebus_common::config::AppConfig;
use edgebus_common::logging::init_tracing;
use edgebus_msg::{
    replay_from_file, ClientOptions, InMemoryTransport, MessageHandler, MessagingMetricsExporter,
    Protocol, PubSubClient, TopicSchema,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tracing::info;

mod handlers;

use handlers::{SensorHandlers, SystemHandlers, UnknownRouteHandler};

#[derive(Debug, Parser)]
#[command(author, version, about = "EdgeBus envelope router daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "EDGEBUS_DEVICE_ID", help = "Override device.device_id")]
    device_id: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Activate both transports and serve the sample handlers")]
    Run,
    #[command(about = "Feed recorded frames through the router and print what was published")]
    Replay {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value_t = 200, help = "Milliseconds to wait for handlers after the last frame")]
        settle_ms: u64,
    },
    #[command(about = "Validate configuration and print the derived topics")]
    CheckConfig,
}

struct Node {
    client: PubSubClient,
    local: InMemoryTransport,
    broker: InMemoryTransport,
    metrics: Registry,
}

fn load_config(cli: &Cli) -> Result<(AppConfig, PathBuf)> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/edgebus.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(device_id) = &cli.device_id {
        config.device.device_id = Some(device_id.clone());
        config.validate()?;
    }
    Ok((config, loaded.source))
}

async fn start_node(config: &AppConfig) -> Result<Node> {
    let registry = Registry::new();
    let exporter = Arc::new(
        MessagingMetricsExporter::register(&registry).context("registering messaging metrics")?,
    );
    let topics = TopicSchema::from_config(&config.device)?;
    let device_id = topics.device_id().to_owned();
    let options = ClientOptions::from_config(config).with_metrics(exporter);
    let client = PubSubClient::with_default_handler(topics, options, |dispatcher| {
        Arc::new(UnknownRouteHandler::new(dispatcher)) as Arc<dyn MessageHandler>
    });

    let dispatcher = client.dispatcher().clone();
    client.register_group(
        "MySystemHandler",
        Arc::new(SystemHandlers::new(dispatcher.clone(), device_id)),
    )?;
    client.register_group("Sensor", Arc::new(SensorHandlers::new(dispatcher)))?;
    info!(routes = ?client.registry().routes(), "handlers registered");

    // Loopback transports; network clients plug in through the Transport trait.
    let local = InMemoryTransport::new();
    let broker = InMemoryTransport::new();
    client.activate(Protocol::Local, Arc::new(local.clone())).await?;
    client.activate(Protocol::Broker, Arc::new(broker.clone())).await?;

    Ok(Node {
        client,
        local,
        broker,
        metrics: registry,
    })
}

fn print_published(label: &str, transport: &InMemoryTransport) {
    for frame in transport.published() {
        println!(
            "[{label}] {} {}",
            frame.topic,
            String::from_utf8_lossy(&frame.payload)
        );
    }
}

fn render_metrics(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, config_path) = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let topics = TopicSchema::from_config(&config.device)?;
            println!("Configuration: {}", config_path.display());
            println!("Ingress: {}", topics.ingress());
            println!("Egress: {}", topics.egress());
            println!("Worker pool per transport: {}", config.transport.worker_pool_size());
            println!(
                "Extra subscriptions: local={:?} broker={:?}",
                config.subscriptions.local, config.subscriptions.broker
            );
        }
        Commands::Replay { file, settle_ms } => {
            init_tracing("edgebusd", &config.logging)?;
            let node = start_node(&config).await?;
            let replayed = replay_from_file(&node.local, &node.broker, &file)
                .await
                .with_context(|| format!("replaying {}", file.display()))?;
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
            node.client.shutdown();

            println!("Replayed {replayed} frame(s) from {}", file.display());
            print_published("local", &node.local);
            print_published("broker", &node.broker);
            print!("{}", render_metrics(&node.metrics)?);
        }
        Commands::Run => {
            init_tracing("edgebusd", &config.logging)?;
            info!(config = %config_path.display(), "starting edgebusd");
            let node = start_node(&config).await?;
            info!(
                ingress = %node.client.topics().ingress(),
                "daemon running; waiting for termination signal"
            );
            signal::ctrl_c().await?;
            info!("ctrl-c received; shutting down");
            node.client.shutdown();
        }
    }

    Ok(())
}
