//! Single-threaded runtime for the ping/pong server.
//!
//! Shared abstractions:
//! - `Poller`: readiness queries, with an epoll table and a batched poll(2)
//!   backend behind it
//! - `ConnectionRegistry`: live connections in acceptance order
//! - `EventLoop`: accept, read, validate and write phases per tick

mod connection;
mod event_loop;
pub mod poller;

pub(crate) use connection::{Connection, ConnectionRegistry};
pub use event_loop::{bind, EventLoop};

use crate::config::Config;
use poller::{Backend, Poller};
use tracing::info;

/// Bind the listener, select a backend and run the loop forever.
pub fn run(config: Config) -> std::io::Result<()> {
    let listener = bind(&config)?;
    let backend = Backend::select(config.backend, config.batch_size)?;
    let mut event_loop = EventLoop::new(listener, backend, &config)?;

    info!(
        addr = %event_loop.local_addr()?,
        backend = event_loop.poller().name(),
        persistent = event_loop.poller().keeps_registrations(),
        batch_size = config.batch_size,
        timeout_ms = config.poll_timeout.as_millis() as u64,
        "Listening"
    );

    event_loop.run()
}
