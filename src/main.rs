//! location-beacon: a WebSocket command server
//!
//! Clients connect over WebSocket and send one JSON command per message:
//! - `GET_LOCATION` returns a fixed coordinate pair
//! - anything else is echoed back as `"<label> received: <command>"`
//!
//! Features:
//! - One task per connection, connections fully independent
//! - Registry of currently open connections
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod registry;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = build_runtime(config.workers)?;
    runtime.block_on(serve(config))
}

/// Build the tokio runtime; a single worker runs everything on the current thread.
fn build_runtime(workers: Option<usize>) -> std::io::Result<tokio::runtime::Runtime> {
    match workers {
        Some(1) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
        Some(n) if n > 1 => tokio::runtime::Builder::new_multi_thread()
            .worker_threads(n)
            .enable_all()
            .build(),
        _ => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build(),
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config).await?;
    let addr = server.local_addr()?;

    info!(
        host = %config.host,
        port = config.port,
        workers = ?config.workers,
        label = %config.label,
        "Starting location-beacon server"
    );
    info!("WebSocket server started on ws://{addr}");

    server.run().await;
    Ok(())
}
