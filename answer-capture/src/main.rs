//! Answer Capture - Main entry point
//!
//! Runs as a native messaging host: the page streams its document changes on
//! stdin, new answer content is posted to the processing endpoint.

use answer_capture::host::run_native_messaging_loop;
use answer_capture::{
    CapturePipeline, ChangeObserver, Config, HostMessage, HostSession, LiveDocument, SocketRelay,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Extra time past the settle delay that shutdown waits for scheduled runs
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "answer-capture", about = "Capture new answer content from a live page")]
struct Args {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Processing endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Settle delay before extracting, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Do not forward captured content to the relay
    #[arg(long)]
    no_relay: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.delivery.endpoint = endpoint.clone();
        }
        if let Some(settle_ms) = self.settle_ms {
            config.observer.settle_delay_ms = settle_ms;
        }
        if self.no_relay {
            config.relay.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path);
    args.apply(&mut config);

    if args.write_config {
        config.save(&config_path)?;
        eprintln!("Configuration written to {}", config_path.display());
        return Ok(());
    }

    // stdout carries native messaging, logs go to stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.general.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Answer Capture");
    info!("Configuration loaded from {:?}", config_path);

    if !config.general.enabled {
        info!("Capture is disabled in configuration, exiting");
        return Ok(());
    }

    let document = LiveDocument::new("body");
    let mut pipeline = CapturePipeline::from_config(document, &config);
    if config.relay.enabled {
        info!("Forwarding captured content to relay at {:?}", config.relay.socket_path);
        pipeline = pipeline.with_relay(Arc::new(SocketRelay::new(&config.relay.socket_path)));
    }
    let pipeline = Arc::new(pipeline);

    let observer = ChangeObserver::install(&pipeline, config.observer.settle_delay());
    let pending = observer.pending_runs();
    tokio::spawn(observer.run());

    let (host_tx, mut host_rx) = mpsc::channel::<HostMessage>(100);
    std::thread::spawn(move || {
        run_native_messaging_loop(std::io::stdin().lock(), std::io::stdout(), host_tx);
    });

    // The host's first mutations message is the loaded page; the session
    // extracts once it is applied
    let mut session = HostSession::new(Arc::clone(&pipeline), pending.clone());
    info!(
        "Answer Capture running (endpoint {}, settle {}ms)",
        config.delivery.endpoint, config.observer.settle_delay_ms
    );

    loop {
        tokio::select! {
            message = host_rx.recv() => match message {
                Some(message) => {
                    session.handle(message);
                }
                None => {
                    info!("Host disconnected, shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    if !pending.is_empty() {
        info!("Waiting for {} scheduled runs", pending.len());
        let limit = config.observer.settle_delay() + SHUTDOWN_GRACE;
        if tokio::time::timeout(limit, pending.wait_idle()).await.is_err() {
            warn!("{} scheduled runs still pending after {:?}", pending.len(), limit);
        }
    }

    Ok(())
}
