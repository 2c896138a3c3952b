//! Standalone relay binary
//!
//! Listens for extracted-text batches and appends them to the bounded history.

use capture_relay::{RelayConfig, RelayServer};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "Bounded history relay for captured answers")]
struct Args {
    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// SQLite database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Maximum number of history entries kept
    #[arg(long)]
    capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = RelayConfig::default();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }

    info!("Starting capture relay (capacity {})", config.capacity);
    let server = RelayServer::new(config)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    if server.socket_path().exists() {
        std::fs::remove_file(server.socket_path())?;
    }

    Ok(())
}
