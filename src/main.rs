//! ping-pong-poller: a single-threaded ping/pong server
//!
//! Clients send `ping` and get `pong` back; anything else closes the
//! connection. All connections are multiplexed on one thread through a
//! pluggable readiness poller:
//! - epoll event table (Linux), registrations kept for the connection's life
//! - batched poll(2) readiness sets, capped at a fixed size per call
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocols;
mod runtime;

use config::Config;
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
        backend = ?config.backend,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        "Starting ping-pong-poller"
    );

    runtime::run(config)?;
    Ok(())
}
