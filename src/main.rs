//! proxy-drain: demo echo server
//!
//! Serves a small echo protocol behind a `DrainListener`:
//! - Optional PROXY protocol (v1) parsing on accept
//! - Graceful shutdown on SIGINT/SIGTERM: stop accepting, wait for open
//!   connections (bounded by the drain timeout), then exit
//! - Configuration via CLI arguments or TOML file

mod config;
mod echo;
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

    info!(
        listen = %config.listen,
        proxy_protocol = config.proxy_protocol,
        keepalive = ?config.keepalive,
        header_timeout = ?config.header_timeout,
        drain_timeout = ?config.drain_timeout,
        "Starting proxy-drain server"
    );

    let server = Server::bind(config)?;
    server.install_signal_handler()?;

    if !server.run()? {
        std::process::exit(1);
    }
    Ok(())
}
