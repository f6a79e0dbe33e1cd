//! Readiness polling over a dynamic set of connections.
//!
//! The event loop only talks to the [`Poller`] contract. Two backends
//! implement it:
//! - `BatchPoller`: one-shot `poll(2)` readiness sets capped at a fixed
//!   number of handles per call, queried batch by batch
//! - `EpollPoller` (Linux): a persistent level-triggered `epoll` table
//!
//! [`Backend`] picks one at startup and dispatches to it.

mod batch;
#[cfg(target_os = "linux")]
mod epoll;

pub use batch::BatchPoller;
#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;

use crate::config::BackendKind;
use mio::Token;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

/// A handle to watch and the token its readiness is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    pub fd: RawFd,
    pub token: Token,
}

impl Source {
    pub fn new(fd: RawFd, token: Token) -> Self {
        Self { fd, token }
    }
}

/// Uniform readiness-query contract.
///
/// Callers only unregister what they registered, and never register a
/// handle twice. Violations are reported as `AlreadyExists` / `NotFound`.
/// Results are sets: their order carries no meaning.
pub trait Poller {
    /// Add sources to the watch set.
    fn register(&mut self, sources: &[Source]) -> io::Result<()>;

    /// Remove previously registered sources from the watch set.
    fn unregister(&mut self, sources: &[Source]) -> io::Result<()>;

    /// Tokens of watched sources that are readable, waiting at most `timeout`.
    fn poll_readable(&mut self, timeout: Duration) -> io::Result<Vec<Token>>;

    /// Tokens of watched sources that are writable, waiting at most `timeout`.
    fn poll_writable(&mut self, timeout: Duration) -> io::Result<Vec<Token>>;

    /// Number of watched sources.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether registrations are meant to outlive a single tick.
    ///
    /// Persistent backends are registered on accept and unregistered on
    /// close; the others get a register/query/unregister cycle per phase.
    fn keeps_registrations(&self) -> bool;
}

/// The poller selected at startup.
pub enum Backend {
    #[cfg(target_os = "linux")]
    Table(EpollPoller),
    Batch(BatchPoller),
}

impl Backend {
    /// Build the backend for `kind`.
    ///
    /// `Auto` probes for the event table once and falls back to batching
    /// with `batch_size` when it is unavailable.
    pub fn select(kind: BackendKind, batch_size: usize) -> io::Result<Self> {
        match kind {
            BackendKind::Table => Self::table(),
            BackendKind::Batch => Ok(Backend::Batch(BatchPoller::new(batch_size)?)),
            BackendKind::Auto => match Self::table() {
                Ok(backend) => Ok(backend),
                Err(e) => {
                    debug!(error = %e, "Event table unavailable, using batch poller");
                    Ok(Backend::Batch(BatchPoller::new(batch_size)?))
                }
            },
        }
    }

    #[cfg(target_os = "linux")]
    fn table() -> io::Result<Self> {
        EpollPoller::new().map(Backend::Table)
    }

    #[cfg(not(target_os = "linux"))]
    fn table() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "event table backend requires epoll (Linux)",
        ))
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(_) => "epoll",
            Backend::Batch(_) => "poll-batch",
        }
    }
}

impl Poller for Backend {
    fn register(&mut self, sources: &[Source]) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.register(sources),
            Backend::Batch(p) => p.register(sources),
        }
    }

    fn unregister(&mut self, sources: &[Source]) -> io::Result<()> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.unregister(sources),
            Backend::Batch(p) => p.unregister(sources),
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.poll_readable(timeout),
            Backend::Batch(p) => p.poll_readable(timeout),
        }
    }

    fn poll_writable(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.poll_writable(timeout),
            Backend::Batch(p) => p.poll_writable(timeout),
        }
    }

    fn len(&self) -> usize {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.len(),
            Backend::Batch(p) => p.len(),
        }
    }

    fn keeps_registrations(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Table(p) => p.keeps_registrations(),
            Backend::Batch(p) => p.keeps_registrations(),
        }
    }
}

/// Convert a poll timeout to the millisecond argument of the syscalls.
///
/// Partial milliseconds round up so a non-zero timeout never becomes a
/// non-blocking check.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let mut ms = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms() {
        assert_eq!(timeout_ms(Duration::ZERO), 0);
        assert_eq!(timeout_ms(Duration::from_millis(5)), 5);
        assert_eq!(timeout_ms(Duration::from_micros(1500)), 2);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX)), libc::c_int::MAX);
    }

    #[test]
    fn test_select_batch() {
        let backend = Backend::select(BackendKind::Batch, 8).unwrap();
        assert!(matches!(backend, Backend::Batch(_)));
        assert_eq!(backend.name(), "poll-batch");
        assert!(!backend.keeps_registrations());
        assert!(backend.is_empty());
    }

    #[test]
    fn test_select_batch_rejects_zero() {
        let err = Backend::select(BackendKind::Batch, 0).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_select_auto_prefers_table() {
        let backend = Backend::select(BackendKind::Auto, 8).unwrap();
        assert!(matches!(backend, Backend::Table(_)));
        assert_eq!(backend.name(), "epoll");
        assert!(backend.keeps_registrations());
    }
}
