//! mixbridge CLI.
//!
//! Runs the relay-side service provider, or makes a single JSON-RPC call
//! through the mix network. See the `mixbridge` library for the core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use mixbridge::mixnet::WebSocketConnector;
use mixbridge::provider::WebSocketDialer;
use mixbridge::{Config, ConnectionEvent, MixConnection, ServiceProvider};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "mixbridge")]
#[command(version)]
#[command(about = "JSON-RPC relay bridge over an anonymous mix network")]
struct Cli {
    /// Config file (default: <config dir>/mixbridge/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay-side service provider until Ctrl-C
    Provider {
        /// WebSocket URL of the local mix client
        #[arg(long)]
        mixnet_url: Option<String>,
        /// Relay opened for payloads sent without a session
        #[arg(long)]
        default_relay: Option<String>,
    },
    /// Send one JSON-RPC payload through the mix network and print the reply
    Call {
        /// Relay URL (ws://, wss://, http:// or https://)
        relay_url: String,
        /// JSON-RPC payload
        payload: String,
        /// Mix address of the service provider
        #[arg(long)]
        provider: Option<String>,
        /// WebSocket URL of the local mix client
        #[arg(long)]
        mixnet_url: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start Tokio runtime")?;

    match cli.command {
        Commands::Provider {
            mixnet_url,
            default_relay,
        } => {
            if let Some(url) = mixnet_url {
                config.provider.mixnet_url = url;
            }
            if let Some(url) = default_relay {
                config.provider.default_relay_url = Some(url);
            }
            runtime.block_on(run_provider(config))
        }
        Commands::Call {
            relay_url,
            payload,
            provider,
            mixnet_url,
        } => {
            if let Some(address) = provider {
                config.client.provider_address = Some(address);
            }
            if let Some(url) = mixnet_url {
                config.client.mixnet_url = url;
            }
            let payload: Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let reply = runtime.block_on(run_call(config, &relay_url, payload))?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_provider(config: Config) -> Result<()> {
    let provider_config = config.provider;
    let connector = Arc::new(WebSocketConnector::new(provider_config.mixnet_url.clone()));
    let dialer = Arc::new(WebSocketDialer::new(provider_config.connect_timeout()));
    let provider = ServiceProvider::new(provider_config, connector, dialer);

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C");
            let _ = stop.send(true);
        }
    });

    provider.run(shutdown).await
}

async fn run_call(config: Config, relay_url: &str, payload: Value) -> Result<Value> {
    let client_config = config.client;
    let wait = client_config.call_timeout();
    let connector = Arc::new(WebSocketConnector::new(client_config.mixnet_url.clone()));
    let connection = MixConnection::new(relay_url, client_config, connector)?;
    let mut events = connection.subscribe();

    connection.open().await?;
    connection.send(payload).await?;

    let reply = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Payload(value)) => return Ok(value),
                Ok(ConnectionEvent::Error(message)) => {
                    return Err(anyhow::anyhow!("Provider error: {message}"))
                }
                Ok(ConnectionEvent::Close) => {
                    return Err(anyhow::anyhow!("Connection closed before a reply"))
                }
                Ok(ConnectionEvent::Open) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow::anyhow!("Connection dropped"))
                }
            }
        }
    })
    .await
    .context("No reply before the call timeout")??;

    if let Err(e) = connection.close().await {
        log::warn!("Close failed: {e}");
    }
    Ok(reply)
}
