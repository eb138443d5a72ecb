//! CLI for mqttlink
//!
//! Subcommands:
//! - `publish`: connect, publish one message and disconnect
//! - `subscribe`: connect, subscribe and print messages until Ctrl-C

use clap::{Parser, Subcommand};
use mqttlink::config::{Settings, load_config_from};
use mqttlink::manager::ConnectOptions;
use mqttlink::utils::logging;
use mqttlink::{ConnectionError, ConnectionManager, QoS};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqttlink")]
struct Cli {
    /// Configuration file, extension optional (default: config/default)
    #[arg(long, default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish a single message
    Publish {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
        #[arg(long)]
        message: String,
    },
    /// Print every message matching a topic filter
    Subscribe {
        #[arg(long)]
        topic: String,
        #[arg(long, default_value_t = 1)]
        qos: u8,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
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

    if let Err(e) = run(settings, cli.command).await {
        error!("mqttlink failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings, command: Command) -> Result<(), ConnectionError> {
    let manager = ConnectionManager::with_mqtt(&settings)?;
    let options = ConnectOptions::from_settings(&settings.broker, &settings.client)?;

    manager
        .connect_with_retry(options, &settings.retry.policy())
        .await?;

    let result = match command {
        Command::Publish {
            topic,
            qos,
            message,
        } => publish(&manager, &topic, QoS::try_from(qos)?, message.as_bytes()).await,
        Command::Subscribe { topic, qos } => {
            subscribe(&manager, &topic, QoS::try_from(qos)?).await
        }
    };

    manager.release().await;
    result
}

async fn publish(
    manager: &ConnectionManager,
    topic: &str,
    qos: QoS,
    payload: &[u8],
) -> Result<(), ConnectionError> {
    manager.publish(topic, qos, payload).await?;
    info!("Published {} bytes to '{}'", payload.len(), topic);
    Ok(())
}

async fn subscribe(
    manager: &ConnectionManager,
    filter: &str,
    qos: QoS,
) -> Result<(), ConnectionError> {
    let mut inbox = manager.router().register();
    manager.subscribe(filter, qos).await?;

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(message) => println!("[{}] {}", message.topic, message.payload_str()),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }
    Ok(())
}
