//! relaywire demo server.
//!
//! Registers the demo handlers and serves until Ctrl-C:
//! - 0: heartbeat (ping/pong), built in
//! - 1: echo
//! - 2: data transfer (upper-cases the payload)
//! - 3: close connection
//! - 4: status query
//!
//! Configuration comes from CLI arguments and an optional TOML file.

mod handlers;

use relaywire::{Config, Metrics, Server};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use handlers::{CloseHandler, DataTransferHandler, EchoHandler, StatusHandler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        name = %config.name,
        host = %config.host,
        port = config.port,
        max_conn = config.max_conn,
        worker_pool = config.worker_pool.enabled,
        heartbeat = config.heartbeat.enabled,
        "Starting relaywire server"
    );

    let metrics = Arc::new(Metrics::new());
    let mut server = Server::new(config).with_metrics(metrics.clone());

    server.on_conn_start(|conn| {
        info!(conn_id = conn.id(), peer = %conn.peer_addr(), "Client connected");
    });
    server.on_conn_stop(|conn| {
        info!(conn_id = conn.id(), peer = %conn.peer_addr(), "Client disconnected");
    });

    // A duplicate id here is a wiring bug; refuse to serve
    server.add_handler(1, EchoHandler)?;
    server.add_handler(2, DataTransferHandler)?;
    server.add_handler(3, CloseHandler)?;
    server.add_handler(4, StatusHandler::new(Instant::now(), server.conn_manager()))?;

    server.serve().await?;

    info!("Final metrics\n{}", metrics.snapshot());
    Ok(())
}
