//! grow-a-chat: a line-oriented broadcast chat server
//!
//! Clients connect over TCP and send newline-terminated text. Every line is
//! relayed to all other connected clients as `[<sender-address>] <line>`.
//!
//! Features:
//! - Single-threaded, readiness-based event loop (epoll/kqueue via mio)
//! - Incremental line reassembly across partial reads
//! - Per-connection outgoing queues so slow readers never block the loop
//! - Configuration via CLI arguments or TOML file
//! - Graceful shutdown on Ctrl-C / SIGTERM

mod config;
mod runtime;

use config::Config;
use runtime::{Server, ShutdownHandle};
use tracing::{error, info};
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

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        "Starting grow-a-chat server"
    );

    let mut server = Server::bind(&config)?;
    install_shutdown_handler(server.shutdown_handle())?;
    info!(addr = %server.local_addr(), "Press Ctrl-C to stop");

    server.run()?;
    Ok(())
}

/// Stop the server on SIGINT/SIGTERM: connections are closed and `run` returns.
fn install_shutdown_handler(handle: ShutdownHandle) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        if let Err(e) = handle.shutdown() {
            error!(error = %e, "Failed to signal event loop");
        }
    })
}
