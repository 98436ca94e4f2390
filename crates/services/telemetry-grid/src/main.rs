//! Telemetry Grid Binary
//!
//! Entry point for the time-grid logger and its stream tap.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remotemedia_telemetry_grid::{config::Config, service::TelemetryGrid, tap::TapClient};

#[derive(Parser)]
#[command(name = "telemetry-grid", about = "UDP telemetry time-grid logger", version)]
struct Cli {
    /// TOML configuration file (falls back to TELEMETRY_* environment variables)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the logger (default)
    Run,

    /// Subscribe to a running grid and print frames to stdout
    Tap {
        /// Stream address of the grid
        #[arg(long, default_value = "127.0.0.1:9100")]
        server: SocketAddr,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config).await,
        Command::Tap { server, frames } => tap(server, frames).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Telemetry Grid...");

    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        "Configuration: channels={}, dt={}ms, stream port={} (enabled={}), max_subscribers={}",
        config.ingest.channels.len(),
        config.grid.frame_interval_ms,
        config.stream.port,
        config.stream.enabled,
        config.stream.max_subscribers
    );

    let grid = TelemetryGrid::new(config);
    let running = grid.start().await.context("Failed to start grid")?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping tasks...");
    grid.shutdown();
    running.join().await;

    let snapshot = grid.metrics().snapshot();
    tracing::info!(
        frames = snapshot.frames_emitted,
        packets = %snapshot.packets_summary(),
        "Telemetry Grid shutdown complete"
    );
    Ok(())
}

async fn tap(server: SocketAddr, frames: Option<u64>) -> Result<()> {
    let client = TapClient::connect(server)
        .await
        .context("Failed to open tap socket")?;
    client.subscribe().await.context("Failed to send SUBSCRIBE")?;
    tracing::info!(%server, "Subscribed, waiting for frames");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut received = 0u64;
    loop {
        tokio::select! {
            frame = client.next_frame() => {
                match frame {
                    Ok(line) => {
                        println!("{}", line);
                        received += 1;
                        if frames.is_some_and(|limit| received >= limit) {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Receive error: {}", e),
                }
            }
            _ = &mut shutdown => break,
        }
    }

    client.unsubscribe().await.context("Failed to send UNSUBSCRIBE")?;
    tracing::info!(frames = received, "Unsubscribed");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
