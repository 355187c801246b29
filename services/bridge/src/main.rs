// bridge: Subscribes to a market-data WebSocket and republishes every frame
// on a broker subject, with drop accounting and reconnection.

use bridge::client::SocketBridge;
use clap::{Arg, Command};
use std::path::Path;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Structured logs to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "bridge starting");

    let matches = Command::new("Socket Bridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Market-data WebSocket to broker bridge")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Path to the bridge TOML config")
                .value_name("PATH")
                .num_args(1),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => bridge::config::load_config_from_path(Path::new(path)),
        None => bridge::config::load_config(),
    };
    let config = match config {
        Ok(config) => {
            info!(
                ws_url = %config.websocket.url,
                streams = config.websocket.streams.len(),
                broker_url = %config.broker.url,
                subject = %config.broker.subject,
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let client = SocketBridge::new(config);
    let mut terminated = client.terminated();

    if let Err(e) = client.start().await {
        eprintln!("FATAL: failed to start bridge: {e}");
        std::process::exit(1);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            client.stop().await;
        }
        changed = terminated.changed() => {
            if changed.is_ok() && *terminated.borrow() {
                error!("bridge terminated after exhausting reconnection attempts");
                client.stop().await;
                std::process::exit(1);
            }
        }
    }

    info!("bridge stopped");
}
